use std::collections::HashSet;
use std::time::Duration;

use super::operations::{await_outcome, OperationManager, Ticket};
use super::protocol::{Envelope, Message};
use super::transport::{recv_frame, send_frame, MAX_FRAME_BYTES};
use crate::error::Error;
use crate::ring::{Id, NodeInfo};

fn node(id: u64) -> NodeInfo {
    let addr = format!("127.0.0.1:{}", 4000 + id).parse().unwrap();
    NodeInfo::with_id(Id::new(id), addr)
}

// ============================================================
// OPERATION MANAGER
// ============================================================

#[tokio::test]
async fn first_caller_is_new_and_the_rest_attach() {
    let manager: OperationManager<Id, bool> = OperationManager::new();

    assert!(matches!(manager.subscribe(Id::new(7)), Ticket::New(_)));
    assert!(matches!(manager.subscribe(Id::new(7)), Ticket::Attached(_)));
    assert!(matches!(manager.subscribe(Id::new(8)), Ticket::New(_)));
    assert_eq!(manager.in_flight(), 2);
}

#[tokio::test]
async fn finish_wakes_every_waiter_with_the_same_value() {
    let manager: OperationManager<Id, bool> = OperationManager::new();
    let key = Id::new(7);

    let first = manager.subscribe(key).receiver();
    let second = manager.subscribe(key).receiver();

    let waiter_a = tokio::spawn(await_outcome(first, Duration::from_secs(1)));
    let waiter_b = tokio::spawn(await_outcome(second, Duration::from_secs(1)));

    assert!(manager.finish(&key, true));
    assert!(matches!(waiter_a.await.unwrap(), Some(Ok(true))));
    assert!(matches!(waiter_b.await.unwrap(), Some(Ok(true))));
    assert_eq!(manager.in_flight(), 0);
}

#[tokio::test]
async fn failure_propagates_to_attached_waiters() {
    let manager: OperationManager<Id, bool> = OperationManager::new();
    let key = Id::new(7);

    let rx = manager.subscribe(key).receiver();
    assert!(manager.fail(&key, Error::KeyNotFound(key)));

    match await_outcome(rx, Duration::from_secs(1)).await {
        Some(Err(Error::KeyNotFound(k))) => assert_eq!(k, key),
        other => panic!("unexpected outcome: {other:?}"),
    }
}

#[tokio::test]
async fn expired_slot_allows_a_fresh_operation() {
    let manager: OperationManager<Id, bool> = OperationManager::new();
    let key = Id::new(7);

    let rx = manager.subscribe(key).receiver();
    // nothing completes it: the bounded wait gives up
    assert!(await_outcome(rx, Duration::from_millis(20)).await.is_none());

    // caller reacts to the timeout by failing the slot
    assert!(manager.fail(&key, Error::OperationTimeout(key)));
    assert!(!manager.contains(&key));

    // a retry opens a brand-new slot
    assert!(matches!(manager.subscribe(key), Ticket::New(_)));
}

#[tokio::test]
async fn late_reply_finds_no_waiter_and_is_dropped() {
    let manager: OperationManager<Id, bool> = OperationManager::new();
    assert!(!manager.finish(&Id::new(9), true));
    assert!(!manager.fail(&Id::new(9), Error::KeyNotFound(Id::new(9))));
}

// ============================================================
// FRAME CODEC
// ============================================================

#[tokio::test]
async fn frames_roundtrip_over_a_stream() {
    let (mut client, mut server) = tokio::io::duplex(64 * 1024);

    let sent = Envelope {
        origin: node(10),
        payload: Message::Insert {
            key: Id::new(40),
            value: b"payload".to_vec(),
        },
    };
    send_frame(&mut client, &sent).await.unwrap();

    let received: Envelope = recv_frame(&mut server).await.unwrap();
    assert_eq!(received.origin, node(10));
    match received.payload {
        Message::Insert { key, value } => {
            assert_eq!(key, Id::new(40));
            assert_eq!(value, b"payload");
        }
        other => panic!("unexpected payload: {other:?}"),
    }
}

#[tokio::test]
async fn consecutive_frames_stay_separated() {
    let (mut client, mut server) = tokio::io::duplex(64 * 1024);

    for key in [1u64, 2, 3] {
        let env = Envelope {
            origin: node(10),
            payload: Message::Lookup { key: Id::new(key) },
        };
        send_frame(&mut client, &env).await.unwrap();
    }

    for key in [1u64, 2, 3] {
        let env: Envelope = recv_frame(&mut server).await.unwrap();
        match env.payload {
            Message::Lookup { key: got } => assert_eq!(got, Id::new(key)),
            other => panic!("unexpected payload: {other:?}"),
        }
    }
}

#[tokio::test]
async fn oversized_frames_are_rejected() {
    let (mut client, mut server) = tokio::io::duplex(256);

    // a fake length prefix far past the cap
    let bogus = ((MAX_FRAME_BYTES + 1) as u32).to_be_bytes();
    tokio::io::AsyncWriteExt::write_all(&mut client, &bogus)
        .await
        .unwrap();

    let result: crate::error::Result<Envelope> = recv_frame(&mut server).await;
    assert!(matches!(result, Err(Error::Serialization(_))));
}

#[tokio::test]
async fn replica_sync_carries_key_sets() {
    let (mut client, mut server) = tokio::io::duplex(64 * 1024);

    let keys: HashSet<Id> = [Id::new(5), Id::new(90)].into();
    let env = Envelope {
        origin: node(100),
        payload: Message::ReplicaSync { keys: keys.clone() },
    };
    send_frame(&mut client, &env).await.unwrap();

    let received: Envelope = recv_frame(&mut server).await.unwrap();
    match received.payload {
        Message::ReplicaSync { keys: got } => assert_eq!(got, keys),
        other => panic!("unexpected payload: {other:?}"),
    }
}
