//! Endpoint wire protocol for ExpertMesh
//!
//! This crate provides the transport-facing half of the system:
//!
//! - Message bodies for the endpoint protocol (ALLOC, FREE, UPLOAD,
//!   DOWNLOAD, MUL_MAT_ID_PARTIAL, CAPS)
//! - Length-prefixed little-endian frame codec
//! - [`EndpointClient`]: one serialized connection per remote endpoint,
//!   capabilities probed once at connect time
//! - [`EndpointServer`]: a reference CPU endpoint used to exercise the
//!   client stack end-to-end

pub mod client;
pub mod codec;
pub mod error;
pub mod protocol;
pub mod server;

pub use client::{Endpoint, EndpointClient};
pub use error::{RpcError, RpcResult};
pub use protocol::{
    ActivationsRef, Command, Dtype, MulMatIdPartialRequest, RoutingIds, TensorMeta,
};
pub use server::{EndpointServer, RunningServer};
