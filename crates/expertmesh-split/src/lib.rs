//! # expertmesh-split
//!
//! Expert-tensor split planning and remote split buffers.
//!
//! At model-load time this crate decides which endpoint owns which slice
//! of each expert weight tensor and drives the byte-accurate uploads:
//!
//! - **Split planner**: proportional, contiguous expert (or row) ranges
//!   from per-endpoint memory weights
//! - **Classifier**: picks out the banked expert tensors by name
//! - **Split buffer**: allocates per-endpoint remote sub-buffers and
//!   shards tensor data into them
//! - **Config**: the operator-facing `"endpoints|weights"` string

pub mod buffer;
pub mod classify;
pub mod config;
pub mod error;
pub mod plan;
pub mod upload;

pub use buffer::{Placement, SplitBuffer, SplitBufferType, TensorShards};
pub use classify::is_expert_tensor;
pub use config::SplitConfig;
pub use error::{SplitError, SplitResult};
pub use plan::{plan_expert, plan_rows, ExpertRange, SplitPlan, MAX_ENDPOINTS};
