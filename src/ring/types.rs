use std::fmt;
use std::net::SocketAddr;

use serde::{Deserialize, Serialize};

use super::id::Id;

/// Identity of a node on the ring.
///
/// The id is derived from the socket address, so a node that restarts on the
/// same address keeps its place on the ring. Two `NodeInfo`s are equal when
/// their ids are equal; the address is transport detail.
#[derive(Clone, Copy, Serialize, Deserialize)]
pub struct NodeInfo {
    /// Position on the ring: `hash(address:port) mod M`.
    pub id: Id,
    /// Address the node's transport listens on.
    pub addr: SocketAddr,
}

impl NodeInfo {
    pub fn new(addr: SocketAddr) -> Self {
        Self {
            id: Id::hash(addr.to_string().as_bytes()),
            addr,
        }
    }

    /// Builds a `NodeInfo` with an explicit id instead of the address hash.
    /// Used by tests to pin nodes to chosen ring positions.
    pub fn with_id(id: Id, addr: SocketAddr) -> Self {
        Self { id, addr }
    }
}

impl PartialEq for NodeInfo {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for NodeInfo {}

impl std::hash::Hash for NodeInfo {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

impl fmt::Display for NodeInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.id, self.addr)
    }
}

impl fmt::Debug for NodeInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NodeInfo({}@{})", self.id, self.addr)
    }
}

/// Lifecycle of a peer from the local node's point of view.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerState {
    /// The peer has answered an RPC or announced itself.
    Alive,
    /// One send to the peer has failed; it may still recover.
    Suspect,
    /// Retries or a ping were exhausted. Terminal for this `NodeInfo`
    /// instance; a new arrival at the same id starts over at `Alive`.
    Dead,
}
