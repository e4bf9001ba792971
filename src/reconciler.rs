//! Turns raw fetch events into cache mutations and published changes.
//!
//! One reconciler runs per resource kind:
//!
//! ```text
//! Uninitialized -> Listing -> Watching -> Terminated
//!                                ^  |
//!                                |  v
//!                             Resyncing
//! ```
//!
//! While the fetcher reports the cluster unreachable the reconciler sits in
//! `Unreachable`, and returns to where it was on the next delivered event.
//!
//! Every listing, initial or after a watch gap, is merged into the cache
//! without clearing it. Records of the kind that the listing no longer
//! contains are deleted, so deletions missed while nobody was watching still
//! reach subscribers.

use std::{collections::HashSet, fmt, sync::Arc};

use futures::StreamExt;
use serde::Serialize;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
    cache::{PutOutcome, ResourceCache},
    error::Error,
    fetcher::{RawEvent, ResourceFetcher},
    publisher::StatePublisher,
    resource::{ChangeEvent, ChangeKind, RawObject, ResourceKey, ResourceKind},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum ReconcilerState {
    Uninitialized,
    Listing,
    Watching,
    Resyncing,
    Unreachable,
    Terminated,
}

impl fmt::Display for ReconcilerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            ReconcilerState::Uninitialized => "uninitialized",
            ReconcilerState::Listing => "listing",
            ReconcilerState::Watching => "watching",
            ReconcilerState::Resyncing => "resyncing",
            ReconcilerState::Unreachable => "unreachable",
            ReconcilerState::Terminated => "terminated",
        };
        f.write_str(label)
    }
}

pub struct Reconciler {
    kind: ResourceKind,
    kind_name: String,
    namespace: Option<String>,
    cache: Arc<ResourceCache>,
    publisher: Arc<StatePublisher>,
    state: watch::Sender<ReconcilerState>,
    /// State to return to once an unreachable cluster answers again.
    resume: ReconcilerState,
}

impl Reconciler {
    /// `namespace` must match the scope the fetcher lists in, otherwise a
    /// listing would prune records it never covered.
    pub fn new(
        kind: ResourceKind,
        namespace: Option<String>,
        cache: Arc<ResourceCache>,
        publisher: Arc<StatePublisher>,
    ) -> Self {
        let (state, _) = watch::channel(ReconcilerState::Uninitialized);
        Self {
            kind_name: kind.to_string(),
            kind,
            namespace,
            cache,
            publisher,
            state,
            resume: ReconcilerState::Uninitialized,
        }
    }

    pub fn state(&self) -> ReconcilerState {
        *self.state.borrow()
    }

    /// Follow state transitions from another task.
    pub fn watch_state(&self) -> watch::Receiver<ReconcilerState> {
        self.state.subscribe()
    }

    /// Drive the reconciler from `fetcher` until `cancel` fires or the fetch
    /// stream ends.
    pub async fn run(mut self, fetcher: ResourceFetcher, cancel: CancellationToken) {
        self.transition(ReconcilerState::Listing);
        let mut events = fetcher.subscribe(self.kind.clone());

        loop {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    debug!(kind = %self.kind, "reconciler cancelled");
                    break;
                }
                next = events.next() => next,
            };

            match next {
                Some(Ok(event)) => {
                    if self.state() == ReconcilerState::Unreachable {
                        let resume = self.resume;
                        self.transition(resume);
                    }
                    self.apply(event).await;
                }
                Some(Err(err @ Error::Connection { .. })) => {
                    warn!(kind = %self.kind, %err, "cluster unreachable");
                    if self.state() != ReconcilerState::Unreachable {
                        self.resume = self.state();
                        self.transition(ReconcilerState::Unreachable);
                    }
                }
                Some(Err(err)) => {
                    warn!(kind = %self.kind, %err, "fetch failed");
                }
                None => break,
            }
        }

        // closes the underlying watch before we report termination
        drop(events);
        self.transition(ReconcilerState::Terminated);
    }

    /// Apply one raw event and publish whatever it changed. Returns the
    /// number of changes published.
    pub async fn apply(&mut self, event: RawEvent) -> usize {
        let changes = match event {
            RawEvent::Listed(objects) => {
                let resync = self.state() == ReconcilerState::Resyncing;
                let changes = self.merge_listing(objects);
                if resync {
                    info!(kind = %self.kind, changes = changes.len(), "resync merged");
                }
                self.transition(ReconcilerState::Watching);
                changes
            }
            RawEvent::Applied(object) => self.put(object).into_iter().collect(),
            RawEvent::Deleted(object) => self.remove(object).into_iter().collect(),
            RawEvent::Expired => {
                info!(kind = %self.kind, "watch gap detected, resync required");
                self.transition(ReconcilerState::Resyncing);
                Vec::new()
            }
        };

        let published = changes.len();
        for change in changes {
            debug!(key = %change.key, change = %change.kind, "publishing");
            self.publisher.publish(change).await;
        }
        published
    }

    fn transition(&mut self, next: ReconcilerState) {
        let previous = self.state.send_replace(next);
        if previous != next {
            info!(kind = %self.kind, from = %previous, to = %next, "reconciler state changed");
        }
    }

    fn scope(&self) -> Option<&str> {
        if self.kind.namespaced {
            self.namespace.as_deref()
        } else {
            None
        }
    }

    fn put(&self, object: RawObject) -> Option<ChangeEvent> {
        let record = object.into_record();
        let key = record.key.clone();

        let kind = match self.cache.put(record.clone()) {
            PutOutcome::Inserted => ChangeKind::Added,
            PutOutcome::Replaced(_) => ChangeKind::Modified,
            PutOutcome::Stale => return None,
        };

        Some(ChangeEvent {
            key,
            kind,
            record: Some(record),
        })
    }

    fn remove(&self, object: RawObject) -> Option<ChangeEvent> {
        self.cache
            .delete_observed(&object.key, object.resource_version)?;

        Some(ChangeEvent {
            key: object.key.clone(),
            kind: ChangeKind::Deleted,
            record: Some(object.into_record()),
        })
    }

    fn merge_listing(&self, objects: Vec<RawObject>) -> Vec<ChangeEvent> {
        let mut live: HashSet<ResourceKey> = HashSet::with_capacity(objects.len());
        let mut changes = Vec::new();

        for object in objects {
            live.insert(object.key.clone());
            changes.extend(self.put(object));
        }

        for record in self.cache.snapshot_in(&self.kind_name, self.scope()) {
            if live.contains(&record.key) {
                continue;
            }
            if let Some(removed) = self.cache.delete(&record.key) {
                changes.push(ChangeEvent {
                    key: removed.key.clone(),
                    kind: ChangeKind::Deleted,
                    record: Some(removed),
                });
            }
        }

        changes
    }
}
