//! Resource identity, versions and the records the cache holds.

use std::{fmt, str::FromStr, sync::Arc};

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;

use crate::error::{Error, Result};

/// Kinds the desktop client knows how to address by bare name:
/// `(kind, group, version, plural, namespaced)`.
const KNOWN_KINDS: &[(&str, &str, &str, &str, bool)] = &[
    ("Pod", "", "v1", "pods", true),
    ("Service", "", "v1", "services", true),
    ("ConfigMap", "", "v1", "configmaps", true),
    ("Secret", "", "v1", "secrets", true),
    ("Node", "", "v1", "nodes", false),
    ("Namespace", "", "v1", "namespaces", false),
    ("Event", "", "v1", "events", true),
    ("Endpoints", "", "v1", "endpoints", true),
    ("ServiceAccount", "", "v1", "serviceaccounts", true),
    ("PersistentVolume", "", "v1", "persistentvolumes", false),
    ("PersistentVolumeClaim", "", "v1", "persistentvolumeclaims", true),
    ("ReplicationController", "", "v1", "replicationcontrollers", true),
    ("ResourceQuota", "", "v1", "resourcequotas", true),
    ("LimitRange", "", "v1", "limitranges", true),
    ("Deployment", "apps", "v1", "deployments", true),
    ("StatefulSet", "apps", "v1", "statefulsets", true),
    ("DaemonSet", "apps", "v1", "daemonsets", true),
    ("ReplicaSet", "apps", "v1", "replicasets", true),
    ("Job", "batch", "v1", "jobs", true),
    ("CronJob", "batch", "v1", "cronjobs", true),
    ("Ingress", "networking.k8s.io", "v1", "ingresses", true),
    ("IngressClass", "networking.k8s.io", "v1", "ingressclasses", false),
    ("StorageClass", "storage.k8s.io", "v1", "storageclasses", false),
    ("HorizontalPodAutoscaler", "autoscaling", "v2", "horizontalpodautoscalers", true),
    ("PodDisruptionBudget", "policy", "v1", "poddisruptionbudgets", true),
    ("PriorityClass", "scheduling.k8s.io", "v1", "priorityclasses", false),
    ("RuntimeClass", "node.k8s.io", "v1", "runtimeclasses", false),
    ("Lease", "coordination.k8s.io", "v1", "leases", true),
    ("Role", "rbac.authorization.k8s.io", "v1", "roles", true),
    ("RoleBinding", "rbac.authorization.k8s.io", "v1", "rolebindings", true),
    ("ClusterRole", "rbac.authorization.k8s.io", "v1", "clusterroles", false),
    ("ClusterRoleBinding", "rbac.authorization.k8s.io", "v1", "clusterrolebindings", false),
    ("CustomResourceDefinition", "apiextensions.k8s.io", "v1", "customresourcedefinitions", false),
    ("MutatingWebhookConfiguration", "admissionregistration.k8s.io", "v1", "mutatingwebhookconfigurations", false),
    ("ValidatingWebhookConfiguration", "admissionregistration.k8s.io", "v1", "validatingwebhookconfigurations", false),
];

/// A Kubernetes API resource type.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ResourceKind {
    pub group: String,
    pub version: String,
    pub kind: String,
    pub plural: String,
    pub namespaced: bool,
}

impl ResourceKind {
    /// Address a kind explicitly. Namespacing and plural are looked up in
    /// the built-in table, falling back to a namespaced, naively pluralized kind.
    pub fn new(group: &str, version: &str, kind: &str) -> Self {
        let known = KNOWN_KINDS
            .iter()
            .find(|(k, g, ..)| *k == kind && *g == group);

        let (plural, namespaced) = match known {
            Some((_, _, _, plural, namespaced)) => (plural.to_string(), *namespaced),
            None => (pluralize(kind), true),
        };

        ResourceKind {
            group: group.to_string(),
            version: version.to_string(),
            kind: kind.to_string(),
            plural,
            namespaced,
        }
    }

    /// `group/version` as used in `apiVersion`.
    pub fn api_version(&self) -> String {
        if self.group.is_empty() {
            self.version.clone()
        } else {
            format!("{}/{}", self.group, self.version)
        }
    }
}

fn pluralize(kind: &str) -> String {
    let lower = kind.to_lowercase();
    if lower.ends_with('s') || lower.ends_with('x') || lower.ends_with("ch") {
        format!("{lower}es")
    } else if let Some(stem) = lower.strip_suffix('y') {
        format!("{stem}ies")
    } else {
        format!("{lower}s")
    }
}

impl FromStr for ResourceKind {
    type Err = Error;

    /// Accepts `Kind`, `plural`, `version/Kind` or `group/version/Kind`.
    fn from_str(s: &str) -> Result<Self> {
        let parts: Vec<&str> = s.trim().split('/').collect();
        match parts.as_slice() {
            [name] if !name.is_empty() => {
                let lower = name.to_lowercase();
                KNOWN_KINDS
                    .iter()
                    .find(|(kind, _, _, plural, _)| kind.to_lowercase() == lower || *plural == lower)
                    .map(|(kind, group, version, ..)| ResourceKind::new(group, version, kind))
                    .ok_or_else(|| Error::InvalidKind(s.to_string()))
            }
            [version, kind] if !version.is_empty() && !kind.is_empty() => {
                Ok(ResourceKind::new("", version, kind))
            }
            [group, version, kind] if !version.is_empty() && !kind.is_empty() => {
                Ok(ResourceKind::new(group, version, kind))
            }
            _ => Err(Error::InvalidKind(s.to_string())),
        }
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.group.is_empty() {
            write!(f, "{}", self.kind)
        } else {
            write!(f, "{}.{}", self.kind, self.group)
        }
    }
}

/// Unique identity of a cached resource. Cluster scoped objects have an
/// empty namespace.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct ResourceKey {
    pub kind: String,
    pub namespace: String,
    pub name: String,
}

impl ResourceKey {
    pub fn new(kind: impl Into<String>, namespace: impl Into<String>, name: impl Into<String>) -> Self {
        ResourceKey {
            kind: kind.into(),
            namespace: namespace.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for ResourceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.namespace.is_empty() {
            write!(f, "{}/{}", self.kind, self.name)
        } else {
            write!(f, "{}/{}/{}", self.kind, self.namespace, self.name)
        }
    }
}

/// Ordering token for updates to a resource. Kubernetes hands these out
/// as decimal etcd revisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize)]
pub struct ResourceVersion(pub u64);

impl FromStr for ResourceVersion {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        s.parse::<u64>()
            .map(ResourceVersion)
            .map_err(|_| Error::InvalidVersion(s.to_string()))
    }
}

impl fmt::Display for ResourceVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// An object as delivered by a [`crate::source::ResourceSource`], before it
/// enters the cache.
#[derive(Debug, Clone, PartialEq)]
pub struct RawObject {
    pub key: ResourceKey,
    pub resource_version: ResourceVersion,
    pub payload: Value,
}

impl RawObject {
    pub fn into_record(self) -> ResourceRecord {
        ResourceRecord {
            key: self.key,
            resource_version: self.resource_version,
            payload: Arc::new(self.payload),
            last_seen: Utc::now(),
        }
    }
}

/// Last known state of a single resource.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResourceRecord {
    pub key: ResourceKey,
    pub resource_version: ResourceVersion,
    pub payload: Arc<Value>,
    pub last_seen: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ChangeKind {
    Added,
    Modified,
    Deleted,
}

impl fmt::Display for ChangeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            ChangeKind::Added => "added",
            ChangeKind::Modified => "modified",
            ChangeKind::Deleted => "deleted",
        };
        f.write_str(label)
    }
}

/// A reconciled change, handed to the publisher exactly once.
///
/// For [`ChangeKind::Deleted`] the record is the last known state of the
/// object: the deletion's final object when the watch reported it, or the
/// cached record when a listing found the object gone.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChangeEvent {
    pub key: ResourceKey,
    pub kind: ChangeKind,
    pub record: Option<ResourceRecord>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bare_kinds_resolve_against_builtin_table() {
        let deployment: ResourceKind = "deployments".parse().unwrap();
        assert_eq!(deployment.group, "apps");
        assert_eq!(deployment.api_version(), "apps/v1");
        assert_eq!(deployment.to_string(), "Deployment.apps");

        let node: ResourceKind = "Node".parse().unwrap();
        assert!(!node.namespaced);
        assert_eq!(node.to_string(), "Node");
    }

    #[test]
    fn explicit_kinds_guess_plural() {
        let kind: ResourceKind = "example.com/v1alpha1/Policy".parse().unwrap();
        assert_eq!(kind.plural, "policies");
        assert!(kind.namespaced);
        assert_eq!(kind.api_version(), "example.com/v1alpha1");

        let core: ResourceKind = "v1/Endpoints".parse().unwrap();
        assert_eq!(core.plural, "endpoints");
    }

    #[test]
    fn unknown_or_malformed_kinds_are_rejected() {
        assert!("Widget".parse::<ResourceKind>().is_err());
        assert!("".parse::<ResourceKind>().is_err());
        assert!("a/b/c/d".parse::<ResourceKind>().is_err());
    }

    #[test]
    fn versions_order_numerically() {
        let low: ResourceVersion = "9".parse().unwrap();
        let high: ResourceVersion = "10".parse().unwrap();
        assert!(low < high);
        assert!("abc".parse::<ResourceVersion>().is_err());
    }

    #[test]
    fn keys_display_with_optional_namespace() {
        assert_eq!(ResourceKey::new("Pod", "default", "web").to_string(), "Pod/default/web");
        assert_eq!(ResourceKey::new("Node", "", "worker-1").to_string(), "Node/worker-1");
    }
}
