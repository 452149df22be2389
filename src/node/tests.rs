use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use super::Node;
use crate::error::Error;
use crate::ring::{Id, NodeInfo, PeerState};

fn any_addr() -> SocketAddr {
    "127.0.0.1:0".parse().unwrap()
}

/// An address nothing listens on; connects fail immediately on loopback.
fn dead_addr() -> SocketAddr {
    "127.0.0.1:1".parse().unwrap()
}

async fn start(id: u64) -> Arc<Node> {
    Node::start_with_id(any_addr(), Some(Id::new(id)), 3)
        .await
        .expect("node should start")
}

/// Polls a condition while the cluster settles.
async fn wait_until(cond: impl Fn() -> bool) -> bool {
    for _ in 0..300 {
        if cond() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    cond()
}

/// Drives stabilization on every node until the condition holds.
async fn settle(nodes: &[&Arc<Node>], cond: impl Fn() -> bool) -> bool {
    for _ in 0..40 {
        if cond() {
            return true;
        }
        for node in nodes {
            node.stabilization_round().await;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    cond()
}

// ============================================================
// SINGLE-NODE RING
// ============================================================

#[tokio::test]
async fn single_node_serves_operations_locally() {
    let node = start(10).await;
    let key = Id::new(40);

    assert!(node.insert(key, b"forty".to_vec()).await.unwrap());
    assert_eq!(node.get(key).await.unwrap(), Some(b"forty".to_vec()));

    // alone on the ring: only the primary copy could be placed
    assert_eq!(node.unfinished_replication_of(key), Some(1));

    assert!(node.delete(key).await.unwrap());
    assert_eq!(node.get(key).await.unwrap(), None);
    // deleting a missing key reports failure
    assert!(!node.delete(key).await.unwrap());
}

#[tokio::test]
async fn insert_then_delete_then_get_returns_absent() {
    let node = start(10).await;
    let key = Id::new(99);

    assert!(node.insert(key, b"v".to_vec()).await.unwrap());
    assert!(node.delete(key).await.unwrap());
    assert_eq!(node.get(key).await.unwrap(), None);
}

// ============================================================
// BOOTSTRAP
// ============================================================

#[tokio::test]
async fn two_nodes_become_mutual_neighbours() {
    let a = start(10).await;
    let b = start(50).await;

    b.bootstrap(a.info()).await.unwrap();

    assert!(
        wait_until(|| {
            a.table().successor() == Some(b.info())
                && b.table().successor() == Some(a.info())
                && a.table().predecessor() == Some(b.info())
                && b.table().predecessor() == Some(a.info())
        })
        .await,
        "ring of two should close in both directions"
    );
}

#[tokio::test]
async fn operations_route_to_the_owner() {
    let a = start(10).await;
    let b = start(50).await;
    b.bootstrap(a.info()).await.unwrap();
    wait_until(|| a.table().predecessor() == Some(b.info())).await;

    // key 40 falls in (10, 50]: node 50 owns it
    let key = Id::new(40);
    assert!(a.insert(key, b"forty".to_vec()).await.unwrap());
    assert_eq!(b.local_store().get(&key), Some(b"forty".to_vec()));
    assert!(a.local_store().get(&key).is_none());

    // readable from either entry point
    assert_eq!(a.get(key).await.unwrap(), Some(b"forty".to_vec()));
    assert_eq!(b.get(key).await.unwrap(), Some(b"forty".to_vec()));

    assert!(b.delete(key).await.unwrap());
    assert_eq!(a.get(key).await.unwrap(), None);
}

#[tokio::test]
async fn wrap_around_keys_land_on_the_lowest_node() {
    let a = start(10).await;
    let b = start(50).await;
    b.bootstrap(a.info()).await.unwrap();
    wait_until(|| b.table().predecessor() == Some(a.info())).await;

    // 120 > every node id: the wrap arc belongs to node 10
    let owner = b.lookup(Id::new(120)).await.unwrap();
    assert_eq!(owner.id, Id::new(10));

    assert!(b.insert(Id::new(120), b"wrap".to_vec()).await.unwrap());
    assert_eq!(a.local_store().get(&Id::new(120)), Some(b"wrap".to_vec()));
}

#[tokio::test]
async fn bootstrap_rejects_an_occupied_id() {
    let a = start(10).await;
    let b = start(50).await;
    b.bootstrap(a.info()).await.unwrap();
    wait_until(|| a.table().successor() == Some(b.info())).await;

    let clone = start(50).await;
    match clone.bootstrap(a.info()).await {
        Err(Error::IdCollision(id)) => assert_eq!(id, Id::new(50)),
        other => panic!("expected id collision, got {other:?}"),
    }
}

#[tokio::test]
async fn concurrent_callers_share_one_operation() {
    let a = start(10).await;
    let b = start(50).await;
    b.bootstrap(a.info()).await.unwrap();
    wait_until(|| a.table().predecessor() == Some(b.info())).await;

    let key = Id::new(40);
    assert!(a.insert(key, b"shared".to_vec()).await.unwrap());

    let (first, second) = tokio::join!(a.get(key), a.get(key));
    assert_eq!(first.unwrap(), Some(b"shared".to_vec()));
    assert_eq!(second.unwrap(), Some(b"shared".to_vec()));
    assert_eq!(a.in_flight_operations(), 0);
}

// ============================================================
// KEY HANDOVER ON ADMISSION
// ============================================================

#[tokio::test]
async fn admission_hands_over_exactly_the_new_arc() {
    let a = start(10).await;
    let b = start(50).await;
    b.bootstrap(a.info()).await.unwrap();
    wait_until(|| a.table().predecessor() == Some(b.info())).await;

    // node 50 owns both before the join
    assert!(a.insert(Id::new(20), b"twenty".to_vec()).await.unwrap());
    assert!(a.insert(Id::new(35), b"thirty-five".to_vec()).await.unwrap());
    assert_eq!(b.local_store().len(), 2);

    // node 30 joins: (10, 30] moves to it, (30, 50] stays
    let c = start(30).await;
    c.bootstrap(a.info()).await.unwrap();

    assert!(
        wait_until(|| {
            c.local_store().get(&Id::new(20)).is_some()
                && b.local_store().get(&Id::new(20)).is_none()
        })
        .await,
        "key 20 should move to the admitted node"
    );
    assert_eq!(b.local_store().get(&Id::new(35)), Some(b"thirty-five".to_vec()));
}

// ============================================================
// REPLICATION
// ============================================================

#[tokio::test]
async fn keys_replicate_onto_the_successor_suffix() {
    let a = start(10).await;
    let b = start(50).await;
    let c = start(80).await;
    let d = start(100).await;
    b.bootstrap(a.info()).await.unwrap();
    c.bootstrap(a.info()).await.unwrap();
    d.bootstrap(a.info()).await.unwrap();

    let nodes = [&a, &b, &c, &d];
    assert!(
        settle(&nodes, || {
            a.table().successor().map(|s| s.id) == Some(Id::new(50))
                && b.table().successor().map(|s| s.id) == Some(Id::new(80))
                && c.table().successor().map(|s| s.id) == Some(Id::new(100))
                && d.table().successor().map(|s| s.id) == Some(Id::new(10))
        })
        .await,
        "ring of four should converge"
    );

    // key 55 falls in (50, 80]: primary at 80, replicas at 100 and 10
    let key = Id::new(55);
    assert!(a.insert(key, b"fifty-five".to_vec()).await.unwrap());
    assert_eq!(c.local_store().get(&key), Some(b"fifty-five".to_vec()));

    assert!(
        settle(&nodes, || {
            d.replica_store().get(Id::new(80), &key).is_some()
                && a.replica_store().get(Id::new(80), &key).is_some()
        })
        .await,
        "replicas should land on the owner's two successors"
    );
    assert_eq!(c.unfinished_replication_of(key), None);
}

#[tokio::test]
async fn reconciliation_trims_and_refills_replica_buckets() {
    let a = start(10).await;
    let b = start(50).await;
    b.bootstrap(a.info()).await.unwrap();
    wait_until(|| a.table().predecessor() == Some(b.info())).await;

    // a key node 10 really owns, replicated to node 50 eventually
    assert!(b.insert(Id::new(5), b"five".to_vec()).await.unwrap());
    assert_eq!(a.local_store().get(&Id::new(5)), Some(b"five".to_vec()));

    // node 50 also claims a replica node 10 never stored
    b.replica_store().store(Id::new(10), Id::new(7), b"stale".to_vec());

    let nodes = [&a, &b];
    assert!(
        settle(&nodes, || {
            b.replica_store().get(Id::new(10), &Id::new(7)).is_none()
                && b.replica_store().get(Id::new(10), &Id::new(5)).is_some()
        })
        .await,
        "sync should drop the stale key and push the missing one"
    );
}

// ============================================================
// FAILURE HANDLING
// ============================================================

#[tokio::test]
async fn predecessor_failure_promotes_its_replicas() {
    let node = start(100).await;
    let ghost = NodeInfo::with_id(Id::new(80), dead_addr());

    node.table().try_update_predecessor(ghost).unwrap();
    node.replica_store().store(ghost.id, Id::new(55), b"v".to_vec());
    node.replica_store().store(ghost.id, Id::new(70), b"w".to_vec());

    node.inform_about_failure(&ghost).await;

    assert!(node.table().predecessor().is_none());
    assert_eq!(node.replica_store().origin_count(), 0);
    assert_eq!(node.local_store().get(&Id::new(55)), Some(b"v".to_vec()));
    assert_eq!(node.local_store().get(&Id::new(70)), Some(b"w".to_vec()));
}

#[tokio::test]
async fn unreachable_owner_fails_the_operation_cleanly() {
    let node = start(10).await;
    let ghost = NodeInfo::with_id(Id::new(50), dead_addr());
    node.table().update_successors(ghost);
    node.table().try_update_predecessor(ghost).unwrap();

    // key 40 maps to the unreachable ghost
    match node.insert(Id::new(40), b"v".to_vec()).await {
        Err(Error::KeyNotFound(key)) => assert_eq!(key, Id::new(40)),
        other => panic!("expected KeyNotFound, got {other:?}"),
    }

    // retries exhausted: the slot is free and the ghost is purged
    assert_eq!(node.in_flight_operations(), 0);
    assert!(!node.table().successors_contain(&ghost));
    assert_eq!(node.transport().peer_state(ghost.id), Some(PeerState::Dead));
}

#[tokio::test]
async fn declaring_self_failed_is_ignored() {
    let node = start(10).await;
    let peer = NodeInfo::with_id(Id::new(50), dead_addr());
    node.table().update_successors(peer);

    let me = node.info();
    node.inform_about_failure(&me).await;
    assert!(node.table().successors_contain(&peer));
}
