//! Wire Protocol
//!
//! Every frame on the wire is an [`Envelope`]: the sender's identity plus one
//! [`Message`]. The origin header is what lets a LOOKUP travel several hops
//! and still be answered directly to the node that asked, and it is how an
//! accepted connection learns who is on the other end.
//!
//! Messages are serialized with bincode inside u32-length-prefixed frames.

use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};

use crate::ring::{Id, NodeInfo};

/// One framed unit on the wire.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    /// Identity of the node (or client) this message speaks for. For a
    /// forwarded LOOKUP this stays the original requester.
    pub origin: NodeInfo,
    pub payload: Message,
}

/// The message taxonomy of the protocol.
///
/// `*Result` messages complete the matching in-flight operation on the
/// receiving side; a result that finds no waiter is dropped silently.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Message {
    // -- ring maintenance --
    /// Resolve the owner of `key`; answered by the owner itself.
    Lookup { key: Id },
    LookupResult { key: Id, owner: NodeInfo },
    /// Ask a node for its predecessor pointer.
    RequestPredecessor,
    PredecessorReply { predecessor: NodeInfo },
    /// The sender asserts itself as a possible predecessor of the receiver.
    Notify,
    Ping,
    Pong,

    // -- key-value operations, node to owner --
    Insert { key: Id, value: Vec<u8> },
    InsertResult { key: Id, success: bool },
    Get { key: Id },
    GetResult { key: Id, value: Option<Vec<u8>> },
    Delete { key: Id },
    DeleteResult { key: Id, success: bool },

    // -- replication --
    /// Store a copy of the sender's key. One-way, at-most-once best-effort.
    Replicate { key: Id, value: Vec<u8> },
    /// The sender claims to hold these replicas of the receiver's keys.
    ReplicaSync { keys: HashSet<Id> },
    ReplicaSyncResult { keys_to_delete: HashSet<Id> },
    /// Full key transfer to a newly admitted predecessor.
    SendKeys { entries: HashMap<Id, Vec<u8>> },
    SendKeysResult { success: bool },

    // -- client surface --
    Put { key: Id, value: Vec<u8> },
    PutResult { key: Id, success: bool },
    Retrieve { key: Id },
    RetrieveResult { key: Id, value: Option<Vec<u8>> },
    Remove { key: Id },
    RemoveResult { key: Id, success: bool },
    State,
    StateResult { summary: String },
}

impl Message {
    /// Short tag for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            Message::Lookup { .. } => "LOOKUP",
            Message::LookupResult { .. } => "LOOKUP_RESULT",
            Message::RequestPredecessor => "REQUEST_PREDECESSOR",
            Message::PredecessorReply { .. } => "PREDECESSOR_REPLY",
            Message::Notify => "NOTIFY",
            Message::Ping => "PING",
            Message::Pong => "PONG",
            Message::Insert { .. } => "INSERT",
            Message::InsertResult { .. } => "INSERT_RESULT",
            Message::Get { .. } => "GET",
            Message::GetResult { .. } => "GET_RESULT",
            Message::Delete { .. } => "DELETE",
            Message::DeleteResult { .. } => "DELETE_RESULT",
            Message::Replicate { .. } => "REPLICATE",
            Message::ReplicaSync { .. } => "REPLICA_SYNC",
            Message::ReplicaSyncResult { .. } => "REPLICA_SYNC_RESULT",
            Message::SendKeys { .. } => "SEND_KEYS",
            Message::SendKeysResult { .. } => "SEND_KEYS_RESULT",
            Message::Put { .. } => "PUT",
            Message::PutResult { .. } => "PUT_RESULT",
            Message::Retrieve { .. } => "RETRIEVE",
            Message::RetrieveResult { .. } => "RETRIEVE_RESULT",
            Message::Remove { .. } => "REMOVE",
            Message::RemoveResult { .. } => "REMOVE_RESULT",
            Message::State => "STATE",
            Message::StateResult { .. } => "STATE_RESULT",
        }
    }

    /// Client-surface messages never feed ring topology: a client's
    /// ephemeral identity must not end up in a successor list.
    pub fn is_client_surface(&self) -> bool {
        matches!(
            self,
            Message::Put { .. }
                | Message::PutResult { .. }
                | Message::Retrieve { .. }
                | Message::RetrieveResult { .. }
                | Message::Remove { .. }
                | Message::RemoveResult { .. }
                | Message::State
                | Message::StateResult { .. }
        )
    }
}
