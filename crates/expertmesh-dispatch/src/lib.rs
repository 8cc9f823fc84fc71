//! # expertmesh-dispatch
//!
//! Per-inference-step orchestration for split expert tensors.
//!
//! The [`Dispatcher`] takes the routing decisions of a MoE layer, fans
//! partial matmul requests out to the endpoints owning the selected
//! experts, and sums the partial outputs into the dense result. A
//! [`Profiler`] tracks per-endpoint timing, the load-balance metric, and
//! per-expert activation counts.

pub mod dispatch;
pub mod error;
pub mod gather;
pub mod profiler;

pub use dispatch::Dispatcher;
pub use error::{DispatchError, DispatchResult};
pub use profiler::{EndpointStats, ExpertActivation, ProfileSnapshot, Profiler};
