//! Scripted in-memory [`ResourceSource`] for tests.
//!
//! Lists and watches are answered from queues in push order. Once a queue
//! runs dry the call never completes, like a cluster that stopped answering.

use std::{
    collections::VecDeque,
    sync::atomic::{AtomicUsize, Ordering},
};

use async_trait::async_trait;
use futures::StreamExt;
use parking_lot::Mutex;
use serde_json::json;

use crate::{
    error::{Error, Result},
    resource::{RawObject, ResourceKey, ResourceKind, ResourceVersion},
    source::{ListSnapshot, ResourceSource, SourceEvent, WatchStream},
};

pub(crate) fn raw(kind: &str, namespace: &str, name: &str, version: u64) -> RawObject {
    RawObject {
        key: ResourceKey::new(kind, namespace, name),
        resource_version: ResourceVersion(version),
        payload: json!({
            "metadata": {
                "name": name,
                "namespace": namespace,
                "resourceVersion": version.to_string(),
            }
        }),
    }
}

/// A transport failure as kube reports it.
pub(crate) fn unreachable() -> Error {
    Error::Api(kube::Error::ReadEvents(std::io::Error::new(
        std::io::ErrorKind::ConnectionRefused,
        "connection refused",
    )))
}

enum ScriptedWatch {
    Items { items: Vec<Result<SourceEvent>>, stays_open: bool },
    Fails(Error),
}

#[derive(Default)]
pub(crate) struct ScriptedSource {
    lists: Mutex<VecDeque<Result<ListSnapshot>>>,
    watches: Mutex<VecDeque<ScriptedWatch>>,
    watch_versions: Mutex<Vec<ResourceVersion>>,
    list_calls: AtomicUsize,
}

impl ScriptedSource {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn push_list(&self, objects: Vec<RawObject>, version: u64) {
        self.lists.lock().push_back(Ok(ListSnapshot {
            objects,
            resource_version: ResourceVersion(version),
        }));
    }

    pub(crate) fn push_list_error(&self, err: Error) {
        self.lists.lock().push_back(Err(err));
    }

    /// A watch that delivers `events` and then ends.
    pub(crate) fn push_watch(&self, events: Vec<SourceEvent>) {
        self.push_watch_with(events.into_iter().map(Ok).collect(), false);
    }

    /// A watch that delivers `events` and then stays open.
    pub(crate) fn push_watch_open(&self, events: Vec<SourceEvent>) {
        self.push_watch_with(events.into_iter().map(Ok).collect(), true);
    }

    /// A watch that delivers `items`, errors included, and then ends.
    pub(crate) fn push_watch_items(&self, items: Vec<Result<SourceEvent>>) {
        self.push_watch_with(items, false);
    }

    pub(crate) fn push_watch_error(&self, err: Error) {
        self.watches.lock().push_back(ScriptedWatch::Fails(err));
    }

    fn push_watch_with(&self, items: Vec<Result<SourceEvent>>, stays_open: bool) {
        self.watches
            .lock()
            .push_back(ScriptedWatch::Items { items, stays_open });
    }

    pub(crate) fn list_calls(&self) -> usize {
        self.list_calls.load(Ordering::SeqCst)
    }

    /// Versions each watch was opened from, in call order.
    pub(crate) fn watch_versions(&self) -> Vec<ResourceVersion> {
        self.watch_versions.lock().clone()
    }
}

#[async_trait]
impl ResourceSource for ScriptedSource {
    async fn list(&self, _kind: &ResourceKind) -> Result<ListSnapshot> {
        self.list_calls.fetch_add(1, Ordering::SeqCst);
        let next = self.lists.lock().pop_front();
        match next {
            Some(result) => result,
            None => futures::future::pending().await,
        }
    }

    async fn watch(&self, _kind: &ResourceKind, from: ResourceVersion) -> Result<WatchStream> {
        self.watch_versions.lock().push(from);
        let next = self.watches.lock().pop_front();
        match next {
            Some(ScriptedWatch::Items { items, stays_open }) => {
                let stream = futures::stream::iter(items);
                if stays_open {
                    Ok(stream.chain(futures::stream::pending()).boxed())
                } else {
                    Ok(stream.boxed())
                }
            }
            Some(ScriptedWatch::Fails(err)) => Err(err),
            None => futures::future::pending().await,
        }
    }
}
