//! RPC Coordination Module
//!
//! The asynchronous glue between nodes: the wire protocol, the pooled TCP
//! transport, and the in-flight operation managers that link remote replies
//! back to local awaiters.
//!
//! ## Core Mechanisms
//! - **Envelope protocol**: every frame carries its origin, so multi-hop
//!   requests can be answered directly and accepted connections identify
//!   themselves with their first message.
//! - **Operation managers**: per-kind maps of key to pending outcome give
//!   at-most-one in-flight semantics; concurrent callers share one future.
//! - **Bounded waits**: every await carries a timeout; an expired slot is
//!   removed so a retry can open a fresh one, and a late reply is dropped.

pub mod operations;
pub mod protocol;
pub mod transport;

pub use operations::{await_outcome, OperationManager, Ticket};
pub use protocol::{Envelope, Message};
pub use transport::Transport;

#[cfg(test)]
mod tests;
