//! Fan-out of reconciled changes to UI-facing subscribers.
//!
//! Every subscriber owns a bounded queue. A subscriber that lets its queue
//! fill up is dropped after a bounded wait and sees [`Disconnected`]; it has
//! to subscribe again (and usually re-read a cache snapshot) to catch up.

use std::{
    pin::Pin,
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc,
    },
    task::{Context, Poll},
};

use futures::{future::join_all, Stream, StreamExt};
use parking_lot::Mutex;
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::{debug, warn};

use crate::{config::PublisherConfig, resource::ChangeEvent};

/// Signal to a subscriber that it fell behind and was dropped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("subscriber fell behind and was disconnected")]
pub struct Disconnected;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PublisherStats {
    pub subscribers: usize,
    pub published: u64,
    pub dropped_subscribers: u64,
}

#[derive(Clone)]
struct Slot {
    id: u64,
    tx: mpsc::Sender<ChangeEvent>,
    overflowed: Arc<AtomicBool>,
}

pub struct StatePublisher {
    config: PublisherConfig,
    subscribers: Mutex<Vec<Slot>>,
    next_id: AtomicU64,
    published: AtomicU64,
    dropped: AtomicU64,
}

impl StatePublisher {
    pub fn new(config: PublisherConfig) -> Self {
        Self {
            config,
            subscribers: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(1),
            published: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
        }
    }

    pub fn subscribe(&self) -> Subscription {
        let (tx, rx) = mpsc::channel(self.config.queue_capacity.max(1));
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let overflowed = Arc::new(AtomicBool::new(false));

        self.subscribers.lock().push(Slot {
            id,
            tx,
            overflowed: overflowed.clone(),
        });
        debug!(subscriber = id, "subscribed");

        Subscription {
            id,
            rx,
            overflowed,
            finished: false,
        }
    }

    /// Deliver `event` to every subscriber.
    ///
    /// Subscribers with room get the event straight away. Only then does the
    /// publisher wait, for all full queues at once, up to the configured
    /// overflow wait; whoever is still full afterwards is dropped.
    pub async fn publish(&self, event: ChangeEvent) {
        self.published.fetch_add(1, Ordering::Relaxed);
        let slots: Vec<Slot> = self.subscribers.lock().clone();

        let mut full = Vec::new();
        let mut gone = Vec::new();
        for slot in slots {
            match slot.tx.try_send(event.clone()) {
                Ok(()) => {}
                Err(TrySendError::Full(event)) => full.push((slot, event)),
                Err(TrySendError::Closed(_)) => gone.push(slot.id),
            }
        }

        let mut overflowed = Vec::new();
        if !full.is_empty() {
            let wait = self.config.overflow_wait();
            let results = join_all(full.into_iter().map(|(slot, event)| async move {
                let delivered = slot.tx.send_timeout(event, wait).await.is_ok();
                (slot, delivered)
            }))
            .await;

            for (slot, delivered) in results {
                if !delivered {
                    slot.overflowed.store(true, Ordering::Release);
                    overflowed.push(slot.id);
                }
            }
        }

        if gone.is_empty() && overflowed.is_empty() {
            return;
        }

        // a concurrent publish may already have removed the same slot
        let mut disconnected = Vec::new();
        self.subscribers.lock().retain(|slot| {
            if overflowed.contains(&slot.id) {
                disconnected.push(slot.id);
                false
            } else {
                !gone.contains(&slot.id)
            }
        });

        for id in &gone {
            debug!(subscriber = id, "subscriber went away");
        }
        for id in &disconnected {
            warn!(subscriber = id, capacity = self.config.queue_capacity, "subscriber queue overflowed, disconnecting");
        }
        self.dropped
            .fetch_add(disconnected.len() as u64, Ordering::Relaxed);
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().len()
    }

    pub fn stats(&self) -> PublisherStats {
        PublisherStats {
            subscribers: self.subscriber_count(),
            published: self.published.load(Ordering::Relaxed),
            dropped_subscribers: self.dropped.load(Ordering::Relaxed),
        }
    }
}

/// A subscriber's end of the publisher.
///
/// Yields changes in the order they were reconciled for any given key. Ends
/// with a single `Err(Disconnected)` if the subscriber was dropped for falling
/// behind, or plainly if the publisher went away.
pub struct Subscription {
    id: u64,
    rx: mpsc::Receiver<ChangeEvent>,
    overflowed: Arc<AtomicBool>,
    finished: bool,
}

impl Subscription {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub async fn recv(&mut self) -> Option<Result<ChangeEvent, Disconnected>> {
        self.next().await
    }
}

impl Stream for Subscription {
    type Item = Result<ChangeEvent, Disconnected>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        if self.finished {
            return Poll::Ready(None);
        }

        match self.rx.poll_recv(cx) {
            Poll::Ready(Some(event)) => Poll::Ready(Some(Ok(event))),
            Poll::Ready(None) => {
                self.finished = true;
                if self.overflowed.load(Ordering::Acquire) {
                    Poll::Ready(Some(Err(Disconnected)))
                } else {
                    Poll::Ready(None)
                }
            }
            Poll::Pending => Poll::Pending,
        }
    }
}
