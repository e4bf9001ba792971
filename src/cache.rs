//! In-memory store of the last known state of every watched resource.
//!
//! One short critical section per mutation; nothing holds the lock across
//! an await point.

use std::{
    collections::BTreeMap,
    ops::Bound,
    sync::atomic::{AtomicU64, Ordering},
};

use parking_lot::RwLock;
use tracing::trace;

use crate::resource::{ResourceKey, ResourceRecord, ResourceVersion};

/// What a [`ResourceCache::put`] did.
#[derive(Debug, Clone, PartialEq)]
pub enum PutOutcome {
    Inserted,
    Replaced(ResourceRecord),
    /// The incoming version was not newer than the stored one.
    Stale,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CacheStats {
    pub records: usize,
    pub stale_dropped: u64,
}

/// Holds at most one record per [`ResourceKey`]. Versions only move forward.
#[derive(Debug, Default)]
pub struct ResourceCache {
    records: RwLock<BTreeMap<ResourceKey, ResourceRecord>>,
    stale_dropped: AtomicU64,
}

impl ResourceCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &ResourceKey) -> Option<ResourceRecord> {
        self.records.read().get(key).cloned()
    }

    /// Store a record unless the cache already holds the same or a newer
    /// version of it.
    pub fn put(&self, record: ResourceRecord) -> PutOutcome {
        let mut records = self.records.write();

        if let Some(existing) = records.get(&record.key) {
            if existing.resource_version >= record.resource_version {
                trace!(
                    key = %record.key,
                    stored = %existing.resource_version,
                    incoming = %record.resource_version,
                    "dropping stale update"
                );
                self.stale_dropped.fetch_add(1, Ordering::Relaxed);
                return PutOutcome::Stale;
            }
        }

        match records.insert(record.key.clone(), record) {
            Some(previous) => PutOutcome::Replaced(previous),
            None => PutOutcome::Inserted,
        }
    }

    pub fn delete(&self, key: &ResourceKey) -> Option<ResourceRecord> {
        self.records.write().remove(key)
    }

    /// Delete on behalf of an observed deletion at `version`. A stored record
    /// newer than the deletion belongs to a recreated object and is kept.
    pub fn delete_observed(
        &self,
        key: &ResourceKey,
        version: ResourceVersion,
    ) -> Option<ResourceRecord> {
        let mut records = self.records.write();
        let newer = records
            .get(key)
            .is_some_and(|existing| existing.resource_version > version);
        if newer {
            self.stale_dropped.fetch_add(1, Ordering::Relaxed);
            return None;
        }
        records.remove(key)
    }

    /// Every record of `kind`, sorted by namespace and name.
    pub fn snapshot(&self, kind: &str) -> Vec<ResourceRecord> {
        let records = self.records.read();
        let snapshot = kind_range(&records, kind).cloned().collect();
        snapshot
    }

    /// Records of `kind`, restricted to `namespace` when one is given.
    pub fn snapshot_in(&self, kind: &str, namespace: Option<&str>) -> Vec<ResourceRecord> {
        let Some(namespace) = namespace else {
            return self.snapshot(kind);
        };

        let records = self.records.read();
        let snapshot = kind_range(&records, kind)
            .filter(|record| record.key.namespace == namespace)
            .cloned()
            .collect();
        snapshot
    }

    /// Drop every record of `kind`, returning what was removed.
    pub fn clear_kind(&self, kind: &str) -> Vec<ResourceRecord> {
        let mut records = self.records.write();
        let keys: Vec<ResourceKey> = kind_range(&records, kind)
            .map(|record| record.key.clone())
            .collect();

        let removed = keys.iter().filter_map(|key| records.remove(key)).collect();
        removed
    }

    /// Distinct kinds currently held.
    pub fn kinds(&self) -> Vec<String> {
        let mut kinds: Vec<String> = Vec::new();
        for key in self.records.read().keys() {
            if kinds.last() != Some(&key.kind) {
                kinds.push(key.kind.clone());
            }
        }
        kinds
    }

    pub fn len(&self) -> usize {
        self.records.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.read().is_empty()
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            records: self.len(),
            stale_dropped: self.stale_dropped.load(Ordering::Relaxed),
        }
    }
}

fn kind_range<'a>(
    records: &'a BTreeMap<ResourceKey, ResourceRecord>,
    kind: &str,
) -> impl Iterator<Item = &'a ResourceRecord> + 'a {
    let start = ResourceKey::new(kind, "", "");
    let kind = kind.to_string();
    records
        .range((Bound::Included(start), Bound::Unbounded))
        .take_while(move |(key, _)| key.kind == kind)
        .map(|(_, record)| record)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use chrono::Utc;
    use serde_json::json;

    use super::*;

    fn record(kind: &str, namespace: &str, name: &str, version: u64) -> ResourceRecord {
        ResourceRecord {
            key: ResourceKey::new(kind, namespace, name),
            resource_version: ResourceVersion(version),
            payload: Arc::new(json!({ "version": version })),
            last_seen: Utc::now(),
        }
    }

    #[test]
    fn put_classifies_inserts_and_replacements() {
        let cache = ResourceCache::new();
        assert_eq!(cache.put(record("Pod", "default", "a", 1)), PutOutcome::Inserted);

        match cache.put(record("Pod", "default", "a", 2)) {
            PutOutcome::Replaced(previous) => assert_eq!(previous.resource_version, ResourceVersion(1)),
            other => panic!("expected replacement, got {other:?}"),
        }
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn stale_and_equal_versions_are_dropped() {
        let cache = ResourceCache::new();
        cache.put(record("Pod", "default", "a", 2));

        assert_eq!(cache.put(record("Pod", "default", "a", 1)), PutOutcome::Stale);
        assert_eq!(cache.put(record("Pod", "default", "a", 2)), PutOutcome::Stale);

        let stored = cache.get(&ResourceKey::new("Pod", "default", "a")).unwrap();
        assert_eq!(stored.resource_version, ResourceVersion(2));
        assert_eq!(cache.stats().stale_dropped, 2);
    }

    #[test]
    fn highest_version_wins_regardless_of_arrival_order() {
        let orders: [[u64; 4]; 4] = [[1, 2, 3, 4], [4, 3, 2, 1], [2, 4, 1, 3], [3, 1, 4, 2]];

        for order in orders {
            let cache = ResourceCache::new();
            for version in order {
                cache.put(record("Pod", "default", "a", version));
            }
            let stored = cache.get(&ResourceKey::new("Pod", "default", "a")).unwrap();
            assert_eq!(stored.resource_version, ResourceVersion(4), "order {order:?}");
            assert_eq!(*stored.payload, json!({ "version": 4 }));
        }
    }

    #[test]
    fn delayed_delete_keeps_recreated_object() {
        let cache = ResourceCache::new();
        let key = ResourceKey::new("Pod", "default", "a");
        cache.put(record("Pod", "default", "a", 7));

        assert!(cache.delete_observed(&key, ResourceVersion(5)).is_none());
        assert!(cache.get(&key).is_some());

        assert!(cache.delete_observed(&key, ResourceVersion(7)).is_some());
        assert!(cache.get(&key).is_none());
    }

    #[test]
    fn snapshots_are_scoped_to_kind_and_sorted() {
        let cache = ResourceCache::new();
        cache.put(record("Pod", "kube-system", "dns", 1));
        cache.put(record("Pod", "default", "web", 1));
        cache.put(record("Node", "", "worker", 1));
        cache.put(record("PodTemplate", "default", "t", 1));

        let names: Vec<String> = cache
            .snapshot("Pod")
            .into_iter()
            .map(|record| record.key.to_string())
            .collect();
        assert_eq!(names, vec!["Pod/default/web", "Pod/kube-system/dns"]);

        assert_eq!(cache.snapshot_in("Pod", Some("kube-system")).len(), 1);
        assert_eq!(cache.kinds(), vec!["Node", "Pod", "PodTemplate"]);
    }

    #[test]
    fn clear_kind_leaves_other_kinds() {
        let cache = ResourceCache::new();
        cache.put(record("Pod", "default", "a", 1));
        cache.put(record("Pod", "default", "b", 1));
        cache.put(record("Service", "default", "a", 1));

        assert_eq!(cache.clear_kind("Pod").len(), 2);
        assert!(cache.snapshot("Pod").is_empty());
        assert_eq!(cache.snapshot("Service").len(), 1);
    }
}
