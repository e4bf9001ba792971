//! Where raw resource state comes from.
//!
//! The fetcher only ever talks to a [`ResourceSource`]; [`KubeSource`] is the
//! implementation backed by a live cluster.

use async_trait::async_trait;
use futures::{stream::BoxStream, StreamExt};
use kube::{
    api::{ApiResource, DynamicObject, ListParams, WatchEvent, WatchParams},
    core::TypeMeta,
    Api, Client,
};
use tracing::{debug, warn};

use crate::{
    config::FetchConfig,
    error::{Error, Result},
    resource::{RawObject, ResourceKey, ResourceKind, ResourceVersion},
};

/// Result of a full list: every live object plus the version to watch from.
#[derive(Debug, Clone, PartialEq)]
pub struct ListSnapshot {
    pub objects: Vec<RawObject>,
    pub resource_version: ResourceVersion,
}

/// A single item of a watch stream.
#[derive(Debug, Clone, PartialEq)]
pub enum SourceEvent {
    Applied(RawObject),
    Deleted(RawObject),
    /// Progress marker with no object change attached.
    Bookmark(ResourceVersion),
    /// The version we are watching from has been compacted away.
    Expired,
}

pub type WatchStream = BoxStream<'static, Result<SourceEvent>>;

/// List/watch access to one cluster.
#[async_trait]
pub trait ResourceSource: Send + Sync {
    async fn list(&self, kind: &ResourceKind) -> Result<ListSnapshot>;

    /// Open a watch delivering every change after `from`. Fails with
    /// [`Error::ResyncRequired`] if `from` is too old to resume.
    async fn watch(&self, kind: &ResourceKind, from: ResourceVersion) -> Result<WatchStream>;
}

/// [`ResourceSource`] backed by the Kubernetes API.
#[derive(Clone)]
pub struct KubeSource {
    client: Client,
    namespace: Option<String>,
    fetch: FetchConfig,
}

impl KubeSource {
    pub fn new(client: Client, namespace: Option<String>, fetch: FetchConfig) -> Self {
        Self {
            client,
            namespace,
            fetch,
        }
    }

    fn api(&self, kind: &ResourceKind) -> Api<DynamicObject> {
        let resource = ApiResource {
            group: kind.group.clone(),
            version: kind.version.clone(),
            api_version: kind.api_version(),
            kind: kind.kind.clone(),
            plural: kind.plural.clone(),
        };

        match (&self.namespace, kind.namespaced) {
            (Some(namespace), true) => {
                Api::namespaced_with(self.client.clone(), namespace, &resource)
            }
            _ => Api::all_with(self.client.clone(), &resource),
        }
    }
}

#[async_trait]
impl ResourceSource for KubeSource {
    async fn list(&self, kind: &ResourceKind) -> Result<ListSnapshot> {
        let api = self.api(kind);
        let mut params = ListParams::default().limit(self.fetch.list_page_size);
        let mut objects = Vec::new();

        let resource_version = loop {
            let page = api.list(&params).await.map_err(|err| classify(kind, err))?;

            for object in page.items {
                match raw_object(kind, object) {
                    Ok(raw) => objects.push(raw),
                    Err(err) => warn!(%kind, %err, "skipping undecodable object"),
                }
            }

            match page.metadata.continue_.as_deref() {
                Some(token) if !token.is_empty() => {
                    debug!(%kind, listed = objects.len(), "fetching next list page");
                    params = params.continue_token(token);
                }
                _ => break page.metadata.resource_version,
            }
        };

        let resource_version = match resource_version.as_deref() {
            Some(version) => version.parse()?,
            None => ResourceVersion::default(),
        };

        Ok(ListSnapshot {
            objects,
            resource_version,
        })
    }

    async fn watch(&self, kind: &ResourceKind, from: ResourceVersion) -> Result<WatchStream> {
        let params = WatchParams::default().timeout(self.fetch.watch_timeout_secs);
        let api = self.api(kind);
        let stream = api
            .watch(&params, &from.to_string())
            .await
            .map_err(|err| classify(kind, err))?;

        let kind = kind.clone();
        Ok(stream
            .map(move |event| source_event(&kind, event))
            .boxed())
    }
}

/// HTTP 410 means the requested version (or continue token) has expired.
fn classify(kind: &ResourceKind, err: kube::Error) -> Error {
    match err {
        kube::Error::Api(response) if response.code == 410 => Error::ResyncRequired {
            kind: kind.to_string(),
        },
        other => Error::Api(other),
    }
}

fn source_event(
    kind: &ResourceKind,
    event: kube::Result<WatchEvent<DynamicObject>>,
) -> Result<SourceEvent> {
    match event.map_err(|err| classify(kind, err))? {
        WatchEvent::Added(object) | WatchEvent::Modified(object) => {
            raw_object(kind, object).map(SourceEvent::Applied)
        }
        WatchEvent::Deleted(object) => raw_object(kind, object).map(SourceEvent::Deleted),
        WatchEvent::Bookmark(bookmark) => bookmark
            .metadata
            .resource_version
            .parse()
            .map(SourceEvent::Bookmark),
        WatchEvent::Error(response) if response.code == 410 => Ok(SourceEvent::Expired),
        WatchEvent::Error(response) => Err(Error::Api(kube::Error::Api(response))),
    }
}

fn raw_object(kind: &ResourceKind, mut object: DynamicObject) -> Result<RawObject> {
    let decode_error = |message: &str| Error::Decode {
        kind: kind.to_string(),
        message: message.to_string(),
    };

    let name = object
        .metadata
        .name
        .clone()
        .ok_or_else(|| decode_error("object has no name"))?;
    let namespace = object.metadata.namespace.clone().unwrap_or_default();
    let resource_version: ResourceVersion = object
        .metadata
        .resource_version
        .as_deref()
        .ok_or_else(|| decode_error("object has no resourceVersion"))?
        .parse()?;

    // list items come without apiVersion/kind
    object.types.get_or_insert_with(|| TypeMeta {
        api_version: kind.api_version(),
        kind: kind.kind.clone(),
    });

    let payload =
        serde_json::to_value(&object).map_err(|err| decode_error(&err.to_string()))?;

    Ok(RawObject {
        key: ResourceKey::new(kind.to_string(), namespace, name),
        resource_version,
        payload,
    })
}
