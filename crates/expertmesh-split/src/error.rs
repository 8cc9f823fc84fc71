//! Error types for split planning and split buffers

use expertmesh_rpc::RpcError;
use thiserror::Error;

/// Result type for split operations
pub type SplitResult<T> = Result<T, SplitError>;

/// Errors that can occur while planning, allocating or loading splits
#[derive(Error, Debug)]
pub enum SplitError {
    /// Bad endpoint/weight configuration
    #[error("configuration error: {0}")]
    Config(String),

    /// Tensor shapes or byte counts are inconsistent
    #[error("shape mismatch: {0}")]
    ShapeMismatch(String),

    /// No tensor with this name lives in the buffer
    #[error("unknown tensor: {0}")]
    UnknownTensor(String),

    /// The buffer saw a transport failure earlier and refuses further work
    #[error("split buffer poisoned by an earlier transport failure")]
    Poisoned,

    /// Error from an endpoint client
    #[error(transparent)]
    Rpc(#[from] RpcError),
}
