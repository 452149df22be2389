//! Message Handlers
//!
//! The receiving half of the protocol: one pure dispatch function that runs
//! an inbound envelope against the local node. Requests answer their origin,
//! `*Result` messages complete the matching in-flight operation, and a
//! result without a waiter is dropped silently.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use tracing::{debug, trace};

use super::Node;
use crate::ring::Id;
use crate::rpc::{Envelope, Message};

/// Boxed entry point used by [`Node::dispatch`]; handlers may send, and
/// sends may dispatch locally.
pub fn handle_message_boxed(
    node: Arc<Node>,
    env: Envelope,
) -> Pin<Box<dyn Future<Output = ()> + Send>> {
    Box::pin(handle_message(node, env))
}

pub async fn handle_message(node: Arc<Node>, env: Envelope) {
    let origin = env.origin;
    trace!(node = %node.info(), from = %origin, kind = env.payload.kind(), "handling");

    // ring traffic doubles as a liveness and topology signal; client
    // messages must not, or ephemeral clients would enter the ring
    if !env.payload.is_client_surface() {
        node.inform_about_existence(&origin);
    }

    match env.payload {
        // -- ring maintenance --
        Message::Lookup { key } => handle_lookup(&node, env.origin, key).await,
        Message::LookupResult { key, owner } => {
            node.inform_about_existence(&owner);
            node.lookups.finish(&key, owner);
        }
        Message::RequestPredecessor => {
            let predecessor = node.table().predecessor().unwrap_or(node.info());
            send_reply(&node, origin, Message::PredecessorReply { predecessor }).await;
        }
        Message::PredecessorReply { predecessor } => {
            // completes the singleton request only; what the answer means
            // depends on who asked. Bootstrap adopts it as its own
            // predecessor, stabilization weighs it as a successor candidate.
            if predecessor.id != node.info().id {
                node.inform_about_existence(&predecessor);
            }
            node.predecessor_request.finish(&(), predecessor);
        }
        Message::Notify => {
            node.update_predecessor(origin).await;
        }
        Message::Ping => {
            // answered directly: probing before a probe would never end
            if let Err(e) = node.transport().send(&origin, Message::Pong).await {
                debug!(peer = %origin, "pong failed: {e}");
            }
        }
        Message::Pong => {
            node.pings.finish(&origin.id, ());
        }

        // -- key-value operations, executed as the owner --
        Message::Insert { key, value } => {
            node.local_store().insert(key, value.clone());
            node.ensure_replication(key, &value).await;
            send_reply(&node, origin, Message::InsertResult { key, success: true }).await;
        }
        Message::InsertResult { key, success } => {
            node.inserts.finish(&key, success);
        }
        Message::Get { key } => {
            let value = node.local_store().get(&key);
            send_reply(&node, origin, Message::GetResult { key, value }).await;
        }
        Message::GetResult { key, value } => {
            node.gets.finish(&key, value);
        }
        Message::Delete { key } => {
            let success = node.local_store().remove(&key).is_some();
            send_reply(&node, origin, Message::DeleteResult { key, success }).await;
        }
        Message::DeleteResult { key, success } => {
            node.deletes.finish(&key, success);
        }

        // -- replication --
        Message::Replicate { key, value } => {
            node.replica_store().store(origin.id, key, value);
        }
        Message::ReplicaSync { keys } => {
            node.synchronize_replicas(origin, keys).await;
        }
        Message::ReplicaSyncResult { keys_to_delete } => {
            node.replica_store().delete_keys(origin.id, &keys_to_delete);
        }
        Message::SendKeys { entries } => {
            debug!(node = %node.info(), count = entries.len(), "receiving key transfer");
            node.local_store().store_all(entries);
            send_reply(&node, origin, Message::SendKeysResult { success: true }).await;
        }
        Message::SendKeysResult { success } => {
            if success {
                // the transfer is acknowledged; drop everything the new
                // predecessor now owns
                if let Some(pred) = node.table().predecessor() {
                    let dropped = node.local_store().drop_unowned(pred.id, node.info().id);
                    if !dropped.is_empty() {
                        debug!(node = %node.info(), count = dropped.len(), "handed over keys");
                    }
                }
            }
            node.key_sends.finish(&origin.id, success);
        }

        // -- client surface: run the routed operation on the client's behalf --
        Message::Put { key, value } => {
            let success = node.insert(key, value).await.unwrap_or(false);
            node.reply_to_client(&origin, Message::PutResult { key, success })
                .await;
        }
        Message::Retrieve { key } => {
            let value = node.get(key).await.unwrap_or(None);
            node.reply_to_client(&origin, Message::RetrieveResult { key, value })
                .await;
        }
        Message::Remove { key } => {
            let success = node.delete(key).await.unwrap_or(false);
            node.reply_to_client(&origin, Message::RemoveResult { key, success })
                .await;
        }
        Message::State => {
            let summary = node.describe();
            node.reply_to_client(&origin, Message::StateResult { summary })
                .await;
        }

        // client-side results have no business arriving at a node
        Message::PutResult { .. }
        | Message::RetrieveResult { .. }
        | Message::RemoveResult { .. }
        | Message::StateResult { .. } => {
            trace!(from = %origin, "ignoring client result message");
        }
    }
}

/// Routes a LOOKUP: answer as the owner, or pass the envelope on with its
/// origin intact so the owner can reply straight to the requester.
async fn handle_lookup(node: &Arc<Node>, requester: crate::ring::NodeInfo, key: Id) {
    if node.table().owns(key) {
        let owner = node.info();
        send_reply(node, requester, Message::LookupResult { key, owner }).await;
        return;
    }

    let next = match node.table().successor() {
        Some(successor) if Id::between(node.info().id, successor.id, key) => successor,
        Some(successor) => {
            let candidate = node.table().next_best(key);
            if candidate.id == node.info().id {
                successor
            } else {
                candidate
            }
        }
        None => {
            debug!(key = %key, "cannot route lookup without a successor");
            return;
        }
    };

    let env = Envelope {
        origin: requester,
        payload: Message::Lookup { key },
    };
    if let Err(e) = node.forward_envelope(&next, env).await {
        debug!(key = %key, next = %next, "lookup forward failed: {e}");
    }
}

async fn send_reply(node: &Arc<Node>, dest: crate::ring::NodeInfo, payload: Message) {
    let kind = payload.kind();
    if let Err(e) = node.send_operation(&dest, payload).await {
        debug!(dest = %dest, kind, "reply failed: {e}");
    }
}
