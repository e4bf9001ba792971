//! Everything the client keeps for one connected cluster.
//!
//! A [`ClusterSession`] owns the cluster's cache and publisher and runs one
//! fetch/reconcile task per watched kind. Tasks are cancelled individually
//! with [`ClusterSession::unwatch_kind`], all at once with
//! [`ClusterSession::disconnect`], or by dropping the session.

use std::{collections::BTreeMap, fmt, sync::Arc};

use kube::Client;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::{sync::watch, task::JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, warn, Instrument as _};

use crate::{
    cache::ResourceCache,
    config::SyncConfig,
    fetcher::ResourceFetcher,
    publisher::{StatePublisher, Subscription},
    reconciler::{Reconciler, ReconcilerState},
    resource::ResourceKind,
    source::{KubeSource, ResourceSource},
};

/// Connection status of a whole session, as shown in the UI.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Resyncing,
    /// At least one kind cannot reach the cluster.
    Unreachable,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Resyncing => "resyncing",
            ConnectionState::Unreachable => "unreachable",
        };
        f.write_str(label)
    }
}

struct KindTask {
    kind: ResourceKind,
    cancel: CancellationToken,
    state: watch::Receiver<ReconcilerState>,
    handle: JoinHandle<()>,
}

pub struct ClusterSession {
    name: String,
    namespace: Option<String>,
    fetcher: ResourceFetcher,
    cache: Arc<ResourceCache>,
    publisher: Arc<StatePublisher>,
    cancel: CancellationToken,
    /// Keyed by the cache kind name, so two versions of one kind cannot
    /// both write the same records.
    tasks: Mutex<BTreeMap<String, KindTask>>,
}

impl ClusterSession {
    pub fn new(name: impl Into<String>, source: Arc<dyn ResourceSource>, config: SyncConfig) -> Self {
        let config = config.normalized();
        Self {
            name: name.into(),
            namespace: config.namespace.clone(),
            fetcher: ResourceFetcher::new(source, config.backoff.clone()),
            cache: Arc::new(ResourceCache::new()),
            publisher: Arc::new(StatePublisher::new(config.publisher.clone())),
            cancel: CancellationToken::new(),
            tasks: Mutex::new(BTreeMap::new()),
        }
    }

    /// A session against a live cluster.
    pub fn connect(name: impl Into<String>, client: Client, config: SyncConfig) -> Self {
        let config = config.normalized();
        let source = KubeSource::new(client, config.namespace.clone(), config.fetch.clone());
        Self::new(name, Arc::new(source), config)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Start following `kind`. Returns `false` if it is already followed,
    /// under this or any other API version.
    ///
    /// Must be called from within a tokio runtime.
    pub fn watch_kind(&self, kind: ResourceKind) -> bool {
        let name = kind.to_string();
        let mut tasks = self.tasks.lock();
        if let Some(task) = tasks.get(&name) {
            if !task.handle.is_finished() {
                if task.kind != kind {
                    warn!(
                        cluster = %self.name,
                        watched = %task.kind.api_version(),
                        requested = %kind.api_version(),
                        %kind,
                        "kind already watched under another version"
                    );
                }
                return false;
            }
        }

        let reconciler = Reconciler::new(
            kind.clone(),
            self.namespace.clone(),
            self.cache.clone(),
            self.publisher.clone(),
        );
        let state = reconciler.watch_state();
        let cancel = self.cancel.child_token();
        let span = info_span!("sync", cluster = %self.name, kind = %kind);
        let handle = tokio::spawn(
            reconciler
                .run(self.fetcher.clone(), cancel.clone())
                .instrument(span),
        );

        info!(cluster = %self.name, %kind, "watching kind");
        tasks.insert(
            name,
            KindTask {
                kind,
                cancel,
                state,
                handle,
            },
        );
        true
    }

    /// Stop following `kind` and wait for its task to finish. Cached records
    /// of the kind are kept. Returns `false` if the kind was not followed.
    pub async fn unwatch_kind(&self, kind: &ResourceKind) -> bool {
        let task = self.tasks.lock().remove(&kind.to_string());
        match task {
            Some(task) => {
                self.stop(task).await;
                true
            }
            None => false,
        }
    }

    /// Cancel every task and wait for all of them to finish. The session can
    /// be reused afterwards.
    pub async fn disconnect(&self) {
        let tasks = std::mem::take(&mut *self.tasks.lock());
        for task in tasks.values() {
            task.cancel.cancel();
        }
        for task in tasks.into_values() {
            self.stop(task).await;
        }
        info!(cluster = %self.name, "disconnected");
    }

    async fn stop(&self, task: KindTask) {
        let kind = task.kind;
        task.cancel.cancel();
        match task.handle.await {
            Ok(()) => debug!(cluster = %self.name, %kind, "kind task stopped"),
            Err(err) => warn!(cluster = %self.name, %kind, %err, "kind task failed"),
        }
    }

    pub fn kinds(&self) -> Vec<ResourceKind> {
        self.tasks
            .lock()
            .values()
            .map(|task| task.kind.clone())
            .collect()
    }

    pub fn states(&self) -> BTreeMap<ResourceKind, ReconcilerState> {
        self.tasks
            .lock()
            .values()
            .map(|task| (task.kind.clone(), *task.state.borrow()))
            .collect()
    }

    /// Follow the reconciler state of `kind`.
    pub fn state_changes(&self, kind: &ResourceKind) -> Option<watch::Receiver<ReconcilerState>> {
        self.tasks
            .lock()
            .get(&kind.to_string())
            .map(|task| task.state.clone())
    }

    pub fn connection_state(&self) -> ConnectionState {
        fold_states(self.states().values().copied())
    }

    pub fn cache(&self) -> &Arc<ResourceCache> {
        &self.cache
    }

    pub fn publisher(&self) -> &Arc<StatePublisher> {
        &self.publisher
    }

    pub fn subscribe(&self) -> Subscription {
        self.publisher.subscribe()
    }
}

impl Drop for ClusterSession {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

fn fold_states(states: impl IntoIterator<Item = ReconcilerState>) -> ConnectionState {
    let mut live = 0;
    let mut watching = 0;
    let mut resyncing = false;
    let mut unreachable = false;

    for state in states {
        match state {
            ReconcilerState::Terminated => continue,
            ReconcilerState::Watching => watching += 1,
            ReconcilerState::Resyncing => resyncing = true,
            ReconcilerState::Unreachable => unreachable = true,
            ReconcilerState::Uninitialized | ReconcilerState::Listing => {}
        }
        live += 1;
    }

    if live == 0 {
        ConnectionState::Disconnected
    } else if unreachable {
        ConnectionState::Unreachable
    } else if resyncing {
        ConnectionState::Resyncing
    } else if watching == live {
        ConnectionState::Connected
    } else {
        ConnectionState::Connecting
    }
}
