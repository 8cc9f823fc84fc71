//! # ExpertMesh
//!
//! Root crate that re-exports all ExpertMesh components.
//!
//! ExpertMesh serves Mixture-of-Experts models whose expert banks exceed
//! any single machine: expert weight tensors are sharded across remote
//! endpoints in proportion to their memory, and each inference step fans
//! the routed matmul out to the endpoints owning the selected experts.
//!
//! ## Crates
//!
//! - [`expertmesh_rpc`]: endpoint wire protocol, client and reference server
//! - [`expertmesh_split`]: split planning and remote split buffers
//! - [`expertmesh_dispatch`]: distributed MUL_MAT_ID dispatch and profiling

pub use expertmesh_dispatch as dispatch;
pub use expertmesh_rpc as rpc;
pub use expertmesh_split as split;

/// ExpertMesh version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
