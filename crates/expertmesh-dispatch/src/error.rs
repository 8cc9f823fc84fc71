//! Error types for distributed dispatch

use expertmesh_rpc::RpcError;
use expertmesh_split::SplitError;
use thiserror::Error;

/// Result type for dispatch operations
pub type DispatchResult<T> = Result<T, DispatchError>;

/// Errors that can occur during a distributed MUL_MAT_ID dispatch
#[derive(Error, Debug)]
pub enum DispatchError {
    /// Activation/weight/routing shapes are inconsistent
    #[error("shape mismatch: {0}")]
    ShapeMismatch(String),

    /// Local tensor computation failed
    #[error("tensor error: {0}")]
    Tensor(String),

    /// Invariant violation inside the dispatcher
    #[error("internal error: {0}")]
    Internal(String),

    /// Error from the split buffer layer
    #[error(transparent)]
    Split(#[from] SplitError),

    /// Error from an endpoint client
    #[error(transparent)]
    Rpc(#[from] RpcError),
}

impl From<candle_core::Error> for DispatchError {
    fn from(err: candle_core::Error) -> Self {
        DispatchError::Tensor(err.to_string())
    }
}
