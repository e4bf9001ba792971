//! Long-lived list-then-watch streams, one per resource kind.
//!
//! A subscription lists once, then watches from the listed version, resuming
//! from the last seen version whenever the watch drops. If the apiserver has
//! compacted that version away the stream reports [`RawEvent::Expired`] and
//! lists again.

use std::{sync::Arc, time::Duration};

use futures::{stream::BoxStream, StreamExt};
use rand::Rng;
use tracing::{debug, info, warn};

use crate::{
    config::{BackoffConfig, RetryPolicy},
    error::{Error, Result},
    resource::{RawObject, ResourceKind, ResourceVersion},
    source::{ResourceSource, SourceEvent, WatchStream},
};

/// What a fetch subscription yields.
#[derive(Debug, Clone, PartialEq)]
pub enum RawEvent {
    /// The complete set of live objects. Follows subscription start and
    /// every [`RawEvent::Expired`].
    Listed(Vec<RawObject>),
    Applied(RawObject),
    Deleted(RawObject),
    /// The watch fell too far behind; a fresh `Listed` is on its way.
    Expired,
}

/// Exponential backoff with full jitter.
#[derive(Debug, Clone)]
pub struct Backoff {
    config: BackoffConfig,
    attempt: u32,
}

impl Backoff {
    pub fn new(config: BackoffConfig) -> Self {
        Self { config, attempt: 0 }
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    /// Upper bound of the next delay, and whether that bound is the cap.
    pub fn ceiling(&self) -> (Duration, bool) {
        let cap = self.config.cap();
        let exponential = self
            .config
            .base()
            .saturating_mul(1u32 << self.attempt.min(31));
        (exponential.min(cap), exponential >= cap)
    }

    /// Pick a delay uniformly in `[0, ceiling]` and advance.
    pub fn next_delay(&mut self) -> (Duration, bool) {
        let (ceiling, at_cap) = self.ceiling();
        self.attempt = self.attempt.saturating_add(1);
        let millis = rand::thread_rng().gen_range(0..=ceiling.as_millis() as u64);
        (Duration::from_millis(millis), at_cap)
    }
}

/// Hands out list-then-watch subscriptions against a [`ResourceSource`].
#[derive(Clone)]
pub struct ResourceFetcher {
    source: Arc<dyn ResourceSource>,
    backoff: BackoffConfig,
}

impl ResourceFetcher {
    pub fn new(source: Arc<dyn ResourceSource>, backoff: BackoffConfig) -> Self {
        Self { source, backoff }
    }

    /// Subscribe to every change of `kind`.
    ///
    /// Transient failures are retried with backoff. Once the backoff has sat
    /// at its cap for `ceiling_attempts` consecutive failures the stream
    /// yields [`Error::Connection`]; under [`RetryPolicy::GiveUp`] it then ends,
    /// otherwise it carries on retrying. Dropping the stream closes any open
    /// watch.
    pub fn subscribe(&self, kind: ResourceKind) -> BoxStream<'static, Result<RawEvent>> {
        let state = FetchState {
            source: self.source.clone(),
            kind,
            backoff: Backoff::new(self.backoff.clone()),
            ceiling_attempts: self.backoff.ceiling_attempts.max(1),
            retry: self.backoff.retry,
            phase: Phase::List,
            pending_delay: None,
            failures: 0,
            ceiling_hits: 0,
        };

        futures::stream::unfold(state, |mut state| async move {
            let item = state.step().await?;
            Some((item, state))
        })
        .boxed()
    }
}

enum Phase {
    List,
    Watch(ResourceVersion),
    Streaming(ResourceVersion, WatchStream),
    Done,
}

struct FetchState {
    source: Arc<dyn ResourceSource>,
    kind: ResourceKind,
    backoff: Backoff,
    ceiling_attempts: u32,
    retry: RetryPolicy,
    phase: Phase,
    pending_delay: Option<Duration>,
    failures: u32,
    ceiling_hits: u32,
}

impl FetchState {
    async fn step(&mut self) -> Option<Result<RawEvent>> {
        loop {
            if let Some(delay) = self.pending_delay.take() {
                tokio::time::sleep(delay).await;
            }

            match std::mem::replace(&mut self.phase, Phase::Done) {
                Phase::Done => return None,

                Phase::List => match self.source.list(&self.kind).await {
                    Ok(snapshot) => {
                        self.recovered();
                        debug!(
                            kind = %self.kind,
                            objects = snapshot.objects.len(),
                            version = %snapshot.resource_version,
                            "listed"
                        );
                        self.phase = Phase::Watch(snapshot.resource_version);
                        return Some(Ok(RawEvent::Listed(snapshot.objects)));
                    }
                    Err(err) => {
                        self.phase = Phase::List;
                        if let Some(report) = self.failed(err) {
                            return Some(Err(report));
                        }
                    }
                },

                Phase::Watch(version) => match self.source.watch(&self.kind, version).await {
                    Ok(stream) => {
                        self.recovered();
                        debug!(kind = %self.kind, %version, "watch opened");
                        self.phase = Phase::Streaming(version, stream);
                    }
                    Err(Error::ResyncRequired { .. }) => {
                        info!(kind = %self.kind, %version, "watch version expired, relisting");
                        self.phase = Phase::List;
                        return Some(Ok(RawEvent::Expired));
                    }
                    Err(err) => {
                        self.phase = Phase::Watch(version);
                        if let Some(report) = self.failed(err) {
                            return Some(Err(report));
                        }
                    }
                },

                Phase::Streaming(version, mut stream) => match stream.next().await {
                    Some(Ok(SourceEvent::Applied(object))) => {
                        self.recovered();
                        let version = version.max(object.resource_version);
                        self.phase = Phase::Streaming(version, stream);
                        return Some(Ok(RawEvent::Applied(object)));
                    }
                    Some(Ok(SourceEvent::Deleted(object))) => {
                        self.recovered();
                        let version = version.max(object.resource_version);
                        self.phase = Phase::Streaming(version, stream);
                        return Some(Ok(RawEvent::Deleted(object)));
                    }
                    Some(Ok(SourceEvent::Bookmark(bookmark))) => {
                        self.recovered();
                        self.phase = Phase::Streaming(version.max(bookmark), stream);
                    }
                    Some(Ok(SourceEvent::Expired)) | Some(Err(Error::ResyncRequired { .. })) => {
                        info!(kind = %self.kind, %version, "watch version expired, relisting");
                        self.phase = Phase::List;
                        return Some(Ok(RawEvent::Expired));
                    }
                    Some(Err(err @ (Error::Decode { .. } | Error::InvalidVersion(_)))) => {
                        warn!(kind = %self.kind, %err, "skipping undecodable watch event");
                        self.phase = Phase::Streaming(version, stream);
                    }
                    Some(Err(err)) => {
                        self.phase = Phase::Watch(version);
                        if let Some(report) = self.failed(err) {
                            return Some(Err(report));
                        }
                    }
                    None => {
                        let (delay, _) = self.backoff.next_delay();
                        debug!(kind = %self.kind, %version, ?delay, "watch ended, reconnecting");
                        self.pending_delay = Some(delay);
                        self.phase = Phase::Watch(version);
                    }
                },
            }
        }
    }

    fn recovered(&mut self) {
        if self.failures > 0 {
            info!(kind = %self.kind, failures = self.failures, "connection recovered");
        }
        self.backoff.reset();
        self.failures = 0;
        self.ceiling_hits = 0;
    }

    /// Record a failure and schedule the retry. Returns the error to surface,
    /// if the backoff ceiling has been hit often enough.
    fn failed(&mut self, err: Error) -> Option<Error> {
        self.failures = self.failures.saturating_add(1);
        let (delay, at_cap) = self.backoff.next_delay();

        // warn on 1, 2, 4, 8, ... so a long outage does not flood the log
        if self.failures.is_power_of_two() {
            warn!(kind = %self.kind, failures = self.failures, %err, ?delay, "fetch failed, backing off");
        } else {
            debug!(kind = %self.kind, failures = self.failures, %err, ?delay, "fetch failed, backing off");
        }

        self.pending_delay = Some(delay);

        // forbidden, not found and the like: worth showing right away
        if !err.is_retryable() {
            return Some(err);
        }

        if !at_cap {
            return None;
        }

        self.ceiling_hits += 1;
        if self.ceiling_hits < self.ceiling_attempts {
            return None;
        }

        self.ceiling_hits = 0;
        if self.retry == RetryPolicy::GiveUp {
            warn!(kind = %self.kind, failures = self.failures, "giving up on unreachable cluster");
            self.phase = Phase::Done;
            self.pending_delay = None;
        }

        Some(Error::Connection {
            kind: self.kind.to_string(),
            attempts: self.failures,
            message: err.to_string(),
        })
    }
}
