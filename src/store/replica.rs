use std::collections::HashSet;

use dashmap::DashMap;

use crate::ring::Id;

/// Replicas held on behalf of other nodes, bucketed by origin id.
///
/// A bucket exists only while this node sits in the origin's replica set; it
/// is created on the first replica from that origin and dropped when the
/// origin vanishes or the bucket drains.
pub struct ReplicaStore {
    buckets: DashMap<Id, DashMap<Id, Vec<u8>>>,
}

impl ReplicaStore {
    pub fn new() -> Self {
        Self {
            buckets: DashMap::new(),
        }
    }

    pub fn store(&self, origin: Id, key: Id, value: Vec<u8>) {
        self.buckets.entry(origin).or_default().insert(key, value);
    }

    pub fn get(&self, origin: Id, key: &Id) -> Option<Vec<u8>> {
        self.buckets
            .get(&origin)
            .and_then(|bucket| bucket.get(key).map(|v| v.clone()))
    }

    /// Removes the whole bucket, e.g. when the origin failed and this node
    /// promotes its replicas to primary ownership.
    pub fn remove_origin(&self, origin: Id) -> Option<Vec<(Id, Vec<u8>)>> {
        self.buckets.remove(&origin).map(|(_, bucket)| {
            bucket
                .iter()
                .map(|e| (*e.key(), e.value().clone()))
                .collect()
        })
    }

    /// Applies a reconciliation verdict from the owner; drains the bucket
    /// entirely when nothing is left.
    pub fn delete_keys(&self, origin: Id, keys: &HashSet<Id>) {
        let emptied = match self.buckets.get(&origin) {
            Some(bucket) => {
                for key in keys {
                    bucket.remove(key);
                }
                bucket.is_empty()
            }
            None => false,
        };
        if emptied {
            self.buckets.remove_if(&origin, |_, bucket| bucket.is_empty());
        }
    }

    pub fn keys_of(&self, origin: Id) -> HashSet<Id> {
        self.buckets
            .get(&origin)
            .map(|bucket| bucket.iter().map(|e| *e.key()).collect())
            .unwrap_or_default()
    }

    /// Snapshot of every bucket's claimed key set, for the periodic sync.
    pub fn claims(&self) -> Vec<(Id, HashSet<Id>)> {
        self.buckets
            .iter()
            .map(|e| (*e.key(), e.value().iter().map(|kv| *kv.key()).collect()))
            .collect()
    }

    /// Values of one bucket, for re-insertion when the origin's owner is gone.
    pub fn values_of(&self, origin: Id) -> Vec<(Id, Vec<u8>)> {
        self.buckets
            .get(&origin)
            .map(|bucket| {
                bucket
                    .iter()
                    .map(|e| (*e.key(), e.value().clone()))
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn origin_count(&self) -> usize {
        self.buckets.len()
    }

    pub fn total_entries(&self) -> usize {
        self.buckets.iter().map(|e| e.value().len()).sum()
    }
}

impl Default for ReplicaStore {
    fn default() -> Self {
        Self::new()
    }
}
