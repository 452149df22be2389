use crate::ring::Id;

/// Errors surfaced by the node core.
///
/// Transport and timeout failures are recovered locally by retry; exhausted
/// retries surface as a failed operation to the caller and as a failure
/// declaration to the ring. None of these abort the node.
#[derive(Debug, Clone, thiserror::Error)]
pub enum Error {
    /// Socket-level failure while sending or receiving.
    #[error("transport failure: {0}")]
    Transport(String),

    /// A finger-table lookup did not resolve within the allowed window.
    #[error("lookup for key {0} timed out")]
    LookupTimeout(Id),

    /// The operation could not be routed, or the owner holds no such key.
    #[error("key {0} not found")]
    KeyNotFound(Id),

    /// A remote operation did not complete within its window.
    #[error("operation on key {0} timed out")]
    OperationTimeout(Id),

    /// The local node was passed where a remote peer was expected.
    /// Logged at the call site; never propagated into ring state.
    #[error("local node treated as a remote peer")]
    SelfReference,

    /// An inbound frame could not be decoded. Closes only that connection.
    #[error("malformed message: {0}")]
    Serialization(String),

    /// Another node already occupies this id. Fatal at bootstrap.
    #[error("id {0} is already taken on the ring")]
    IdCollision(Id),

    /// The connection pool is at its cap.
    #[error("connection limit reached")]
    ConnectionLimit,
}

pub type Result<T> = std::result::Result<T, Error>;

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::Transport(e.to_string())
    }
}

impl From<bincode::Error> for Error {
    fn from(e: bincode::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}
