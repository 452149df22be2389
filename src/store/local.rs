use std::collections::HashMap;

use dashmap::DashMap;

use crate::ring::Id;

/// Keys this node owns as primary, with their values.
///
/// Concurrent writers race under last-write-wins; there is no per-key
/// ordering across clients.
pub struct LocalStore {
    entries: DashMap<Id, Vec<u8>>,
}

impl LocalStore {
    pub fn new() -> Self {
        Self {
            entries: DashMap::new(),
        }
    }

    pub fn insert(&self, key: Id, value: Vec<u8>) {
        self.entries.insert(key, value);
    }

    pub fn get(&self, key: &Id) -> Option<Vec<u8>> {
        self.entries.get(key).map(|v| v.clone())
    }

    pub fn remove(&self, key: &Id) -> Option<Vec<u8>> {
        self.entries.remove(key).map(|(_, v)| v)
    }

    pub fn contains(&self, key: &Id) -> bool {
        self.entries.contains_key(key)
    }

    pub fn keys(&self) -> Vec<Id> {
        self.entries.iter().map(|e| *e.key()).collect()
    }

    pub fn snapshot(&self) -> Vec<(Id, Vec<u8>)> {
        self.entries
            .iter()
            .map(|e| (*e.key(), e.value().clone()))
            .collect()
    }

    pub fn store_all<I: IntoIterator<Item = (Id, Vec<u8>)>>(&self, entries: I) {
        for (key, value) in entries {
            self.entries.insert(key, value);
        }
    }

    /// Copies out the keys in `(lower, upper]`, the slice a newly admitted
    /// predecessor takes over. Non-destructive: the sender deletes only
    /// after the transfer is acknowledged.
    pub fn range(&self, lower: Id, upper: Id) -> HashMap<Id, Vec<u8>> {
        self.entries
            .iter()
            .filter(|e| Id::between(lower, upper, *e.key()))
            .map(|e| (*e.key(), e.value().clone()))
            .collect()
    }

    /// Drops every key outside `(pred, own]` and returns the dropped ids.
    pub fn drop_unowned(&self, pred: Id, own: Id) -> Vec<Id> {
        let stale: Vec<Id> = self
            .entries
            .iter()
            .filter(|e| !Id::between(pred, own, *e.key()))
            .map(|e| *e.key())
            .collect();
        for key in &stale {
            self.entries.remove(key);
        }
        stale
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Default for LocalStore {
    fn default() -> Self {
        Self::new()
    }
}
