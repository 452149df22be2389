use std::collections::HashSet;

use super::local::LocalStore;
use super::replica::ReplicaStore;
use crate::ring::Id;

fn id(raw: u64) -> Id {
    Id::new(raw)
}

// ============================================================
// LOCAL STORE
// ============================================================

#[test]
fn local_store_roundtrip() {
    let store = LocalStore::new();
    store.insert(id(40), b"alpha".to_vec());

    assert_eq!(store.get(&id(40)), Some(b"alpha".to_vec()));
    assert!(store.contains(&id(40)));
    assert_eq!(store.get(&id(41)), None);

    assert_eq!(store.remove(&id(40)), Some(b"alpha".to_vec()));
    assert_eq!(store.get(&id(40)), None);
    assert!(store.is_empty());
}

#[test]
fn local_store_last_write_wins() {
    let store = LocalStore::new();
    store.insert(id(40), b"first".to_vec());
    store.insert(id(40), b"second".to_vec());
    assert_eq!(store.get(&id(40)), Some(b"second".to_vec()));
    assert_eq!(store.len(), 1);
}

#[test]
fn range_selects_the_handover_slice() {
    let store = LocalStore::new();
    for k in [5u64, 20, 35, 60] {
        store.insert(id(k), vec![k as u8]);
    }

    // new predecessor at 40, old one at 10: keys in (10, 40] move
    let slice = store.range(id(10), id(40));
    let mut keys: Vec<u64> = slice.keys().map(|k| k.raw()).collect();
    keys.sort();
    assert_eq!(keys, vec![20, 35]);
    // non-destructive until the transfer is acknowledged
    assert_eq!(store.len(), 4);
}

#[test]
fn range_wraps_around_zero() {
    let store = LocalStore::new();
    for k in [100u64, 120, 3, 50] {
        store.insert(id(k), vec![k as u8]);
    }

    let slice = store.range(id(90), id(10));
    let mut keys: Vec<u64> = slice.keys().map(|k| k.raw()).collect();
    keys.sort();
    assert_eq!(keys, vec![3, 100, 120]);
}

#[test]
fn drop_unowned_enforces_ownership() {
    let store = LocalStore::new();
    for k in [5u64, 20, 35, 60] {
        store.insert(id(k), vec![k as u8]);
    }

    // this node is 50 with predecessor 30: it owns (30, 50]
    let mut dropped: Vec<u64> = store
        .drop_unowned(id(30), id(50))
        .into_iter()
        .map(|k| k.raw())
        .collect();
    dropped.sort();
    assert_eq!(dropped, vec![5, 20, 60]);
    assert_eq!(store.keys(), vec![id(35)]);
}

// ============================================================
// REPLICA STORE
// ============================================================

#[test]
fn replica_buckets_are_created_per_origin() {
    let store = ReplicaStore::new();
    store.store(id(80), id(55), b"v".to_vec());
    store.store(id(80), id(70), b"w".to_vec());
    store.store(id(100), id(90), b"x".to_vec());

    assert_eq!(store.origin_count(), 2);
    assert_eq!(store.total_entries(), 3);
    assert_eq!(store.get(id(80), &id(55)), Some(b"v".to_vec()));
    assert_eq!(
        store.keys_of(id(80)),
        HashSet::from([id(55), id(70)])
    );
}

#[test]
fn removing_an_origin_yields_its_values() {
    let store = ReplicaStore::new();
    store.store(id(80), id(55), b"v".to_vec());
    store.store(id(80), id(70), b"w".to_vec());

    let mut promoted = store.remove_origin(id(80)).unwrap();
    promoted.sort_by_key(|(k, _)| *k);
    assert_eq!(
        promoted,
        vec![(id(55), b"v".to_vec()), (id(70), b"w".to_vec())]
    );
    assert_eq!(store.origin_count(), 0);
    assert!(store.remove_origin(id(80)).is_none());
}

#[test]
fn delete_keys_drains_empty_buckets() {
    let store = ReplicaStore::new();
    store.store(id(80), id(55), b"v".to_vec());
    store.store(id(80), id(70), b"w".to_vec());

    store.delete_keys(id(80), &HashSet::from([id(55)]));
    assert_eq!(store.keys_of(id(80)), HashSet::from([id(70)]));
    assert_eq!(store.origin_count(), 1);

    store.delete_keys(id(80), &HashSet::from([id(70)]));
    assert_eq!(store.origin_count(), 0);
}

#[test]
fn claims_snapshot_every_bucket() {
    let store = ReplicaStore::new();
    store.store(id(80), id(55), b"v".to_vec());
    store.store(id(100), id(90), b"x".to_vec());

    let mut claims = store.claims();
    claims.sort_by_key(|(origin, _)| *origin);
    assert_eq!(claims.len(), 2);
    assert_eq!(claims[0].0, id(80));
    assert_eq!(claims[0].1, HashSet::from([id(55)]));
    assert_eq!(claims[1].0, id(100));
}
