//! Error types for endpoint RPC operations

use thiserror::Error;

/// Result type for RPC operations
pub type RpcResult<T> = Result<T, RpcError>;

/// Errors surfaced by the endpoint client and server
#[derive(Error, Debug)]
pub enum RpcError {
    /// Connect, send, recv or framing failure on the wire
    #[error("transport error: {0}")]
    Transport(String),

    /// Message body could not be encoded or decoded
    #[error("codec error: {0}")]
    Codec(#[from] bincode::Error),

    /// Frame exceeds the maximum allowed size
    #[error("frame too large: {0} bytes")]
    FrameTooLarge(u64),

    /// Remote endpoint refused an allocation
    #[error("remote endpoint out of memory: {0}")]
    RemoteOom(String),

    /// Remote endpoint does not support a required command
    #[error("protocol mismatch: {0}")]
    ProtocolMismatch(String),

    /// Remote endpoint reported a compute failure
    #[error("remote compute failed: {0}")]
    RemoteCompute(String),

    /// A request was malformed before it ever hit the wire, or the
    /// endpoint rejected it as malformed
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// Response did not match the request that was sent
    #[error("bad response: {0}")]
    BadResponse(String),
}

impl From<std::io::Error> for RpcError {
    fn from(err: std::io::Error) -> Self {
        RpcError::Transport(err.to_string())
    }
}
