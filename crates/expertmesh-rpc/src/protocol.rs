//! Message bodies for the endpoint wire protocol
//!
//! Every exchange is a single request frame answered by a single response
//! frame (see [`crate::codec`] for the framing). The bodies below are
//! bincode-encoded with fixed-width little-endian integers, so the field
//! layouts on the wire are exactly the struct declarations.

use serde::{Deserialize, Serialize};

use crate::error::{RpcError, RpcResult};

/// Commands understood by an endpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Command {
    /// Allocate a remote buffer of a given size
    Alloc = 1,
    /// Free a remote buffer
    Free = 2,
    /// Write bytes into a remote buffer
    Upload = 3,
    /// Partial routed matmul over the endpoint's local expert range
    MulMatIdPartial = 4,
    /// Query the endpoint's supported-command bitmask
    Caps = 5,
    /// Read bytes back out of a remote buffer
    Download = 6,
}

impl Command {
    pub fn from_u8(byte: u8) -> Option<Self> {
        match byte {
            1 => Some(Self::Alloc),
            2 => Some(Self::Free),
            3 => Some(Self::Upload),
            4 => Some(Self::MulMatIdPartial),
            5 => Some(Self::Caps),
            6 => Some(Self::Download),
            _ => None,
        }
    }

    /// Bit in the CAPS bitmask advertising support for this command
    pub fn cap_bit(self) -> u64 {
        1 << (self as u8)
    }
}

/// Capability mask advertising every command in this protocol revision
pub fn full_caps() -> u64 {
    [
        Command::Alloc,
        Command::Free,
        Command::Upload,
        Command::MulMatIdPartial,
        Command::Caps,
        Command::Download,
    ]
    .iter()
    .fold(0, |mask, c| mask | c.cap_bit())
}

// ── Tensor metadata ──────────────────────────────────────────────────────────

/// Element type of a tensor travelling over the wire
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Dtype {
    F16,
    F32,
}

impl Dtype {
    /// Size of one element in bytes
    pub fn size_bytes(self) -> usize {
        match self {
            Dtype::F16 => 2,
            Dtype::F32 => 4,
        }
    }

    /// Decode a little-endian byte buffer of this dtype into f32 values
    pub fn decode_f32(self, bytes: &[u8]) -> RpcResult<Vec<f32>> {
        let elem = self.size_bytes();
        if bytes.len() % elem != 0 {
            return Err(RpcError::BadResponse(format!(
                "tensor byte length {} is not a multiple of element size {}",
                bytes.len(),
                elem
            )));
        }
        let out = match self {
            Dtype::F32 => bytes
                .chunks_exact(4)
                .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
                .collect(),
            Dtype::F16 => bytes
                .chunks_exact(2)
                .map(|c| half::f16::from_le_bytes([c[0], c[1]]).to_f32())
                .collect(),
        };
        Ok(out)
    }
}

/// Shape and element type of a tensor
///
/// `dims[0]` is the innermost (contiguous) dimension; the last dimension is
/// the outermost in memory. Expert weight tensors are `[d_in, d_out,
/// n_expert]`, so slicing along the expert axis yields contiguous byte
/// ranges.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TensorMeta {
    pub dims: Vec<u64>,
    pub dtype: Dtype,
}

impl TensorMeta {
    pub fn new(dims: &[u64], dtype: Dtype) -> Self {
        Self { dims: dims.to_vec(), dtype }
    }

    /// Total number of elements
    pub fn elem_count(&self) -> u64 {
        self.dims.iter().product()
    }

    /// Total byte size
    pub fn byte_size(&self) -> u64 {
        self.elem_count() * self.dtype.size_bytes() as u64
    }

    /// Size of the outermost (last) dimension, the expert axis for expert
    /// tensors
    pub fn outer_dim(&self) -> u64 {
        self.dims.last().copied().unwrap_or(0)
    }

    /// Bytes occupied by one slice of the outermost dimension
    pub fn bytes_per_outer(&self) -> u64 {
        let outer = self.outer_dim();
        if outer == 0 {
            0
        } else {
            self.byte_size() / outer
        }
    }
}

// ── Routing ──────────────────────────────────────────────────────────────────

/// Per-token expert selections for one dispatch
///
/// Laid out token-major: `ids[token * top_k + slot]`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoutingIds {
    pub top_k: u32,
    pub n_tokens: u32,
    pub ids: Vec<u32>,
}

impl RoutingIds {
    pub fn new(top_k: u32, n_tokens: u32, ids: Vec<u32>) -> RpcResult<Self> {
        if ids.len() as u64 != top_k as u64 * n_tokens as u64 {
            return Err(RpcError::InvalidRequest(format!(
                "routing has {} ids, expected top_k {} x n_tokens {}",
                ids.len(),
                top_k,
                n_tokens
            )));
        }
        Ok(Self { top_k, n_tokens, ids })
    }

    /// Expert ids selected for one token
    pub fn token_ids(&self, token: usize) -> &[u32] {
        let k = self.top_k as usize;
        &self.ids[token * k..(token + 1) * k]
    }

    /// Whether any selection falls inside `[lo, hi)`
    pub fn intersects(&self, lo: u32, hi: u32) -> bool {
        self.ids.iter().any(|&id| id >= lo && id < hi)
    }
}

// ── Request / response bodies ────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AllocRequest {
    pub device: u32,
    pub size: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AllocResponse {
    pub handle: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FreeRequest {
    pub handle: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadRequest {
    pub handle: u64,
    pub offset: u64,
    pub bytes: Vec<u8>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DownloadRequest {
    pub handle: u64,
    pub offset: u64,
    pub nbytes: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DownloadResponse {
    pub bytes: Vec<u8>,
}

/// Activation input: inline bytes for single-shot dispatch, or a handle to a
/// buffer previously uploaded to the same endpoint
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ActivationsRef {
    Inline(Vec<u8>),
    Handle(u64),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MulMatIdPartialRequest {
    /// Remote handle of this endpoint's expert shard
    pub weight_handle: u64,
    /// Shape of the shard: `[d_in, d_out, local_experts]`
    pub weight_meta: TensorMeta,
    /// Activations, shape `[d_in, n_tokens]`, f32
    pub activations: ActivationsRef,
    /// Per-token expert selections over the full (global) expert space
    pub routing: RoutingIds,
    /// Global expert range owned by this endpoint
    pub expert_lo: u32,
    pub expert_hi: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MulMatIdPartialResponse {
    /// Dense f32 output `[d_out, n_tokens]`; rows for tokens routed
    /// elsewhere are zero
    pub bytes: Vec<u8>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CapsResponse {
    pub caps: u64,
}

// ── Error frames ─────────────────────────────────────────────────────────────

/// Failure classes an endpoint can report
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RemoteErrorKind {
    /// Allocation refused
    Oom,
    /// Command not supported by this endpoint
    Unsupported,
    /// Compute kernel failed
    Compute,
    /// Request was malformed or referenced an unknown handle
    InvalidRequest,
}

/// Body of an error response frame
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteError {
    pub kind: RemoteErrorKind,
    pub message: String,
}

impl RemoteError {
    pub fn new(kind: RemoteErrorKind, message: impl Into<String>) -> Self {
        Self { kind, message: message.into() }
    }

    /// Map a reported remote failure onto the client error taxonomy
    pub fn into_rpc_error(self) -> RpcError {
        match self.kind {
            RemoteErrorKind::Oom => RpcError::RemoteOom(self.message),
            RemoteErrorKind::Unsupported => RpcError::ProtocolMismatch(self.message),
            RemoteErrorKind::Compute => RpcError::RemoteCompute(self.message),
            RemoteErrorKind::InvalidRequest => RpcError::InvalidRequest(self.message),
        }
    }
}

// ── Byte helpers ─────────────────────────────────────────────────────────────

/// Encode f32 values as little-endian bytes
pub fn f32s_to_bytes(values: &[f32]) -> Vec<u8> {
    let mut out = Vec::with_capacity(values.len() * 4);
    for v in values {
        out.extend_from_slice(&v.to_le_bytes());
    }
    out
}

/// Decode little-endian bytes into f32 values
pub fn bytes_to_f32s(bytes: &[u8]) -> RpcResult<Vec<f32>> {
    Dtype::F32.decode_f32(bytes)
}
