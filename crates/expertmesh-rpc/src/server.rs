//! Reference endpoint server
//!
//! A CPU implementation of the endpoint side of the protocol: an accept
//! loop, an in-memory buffer store, and a naive f32 kernel for the partial
//! routed matmul. Production deployments put real accelerator kernels
//! behind the same wire format; this server exists so the client stack can
//! be exercised end-to-end in-process.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::codec::{read_frame, write_frame, write_frame_bytes, ERROR_TAG_BIT};
use crate::error::{RpcError, RpcResult};
use crate::protocol::{
    f32s_to_bytes, full_caps, ActivationsRef, AllocRequest, AllocResponse, CapsResponse,
    Command, DownloadRequest, DownloadResponse, FreeRequest, MulMatIdPartialRequest,
    MulMatIdPartialResponse, RemoteError, RemoteErrorKind, RoutingIds, UploadRequest,
};

/// Builder for a reference endpoint server
pub struct EndpointServer {
    caps: u64,
    memory_limit: Option<u64>,
}

impl EndpointServer {
    /// Server supporting the full protocol
    pub fn new() -> Self {
        Self { caps: full_caps(), memory_limit: None }
    }

    /// Restrict the advertised capability mask
    ///
    /// Used to stand in for older servers, e.g. ones without
    /// MUL_MAT_ID_PARTIAL, so the client fallback paths can be tested.
    pub fn with_caps(mut self, caps: u64) -> Self {
        self.caps = caps;
        self
    }

    /// Cap the total bytes the buffer store will hold
    pub fn with_memory_limit(mut self, limit: u64) -> Self {
        self.memory_limit = Some(limit);
        self
    }

    /// Bind and start serving; returns once the listener is live
    pub async fn bind(self, addr: &str) -> RpcResult<RunningServer> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| RpcError::Transport(format!("bind {}: {}", addr, e)))?;
        let local_addr = listener
            .local_addr()
            .map_err(|e| RpcError::Transport(e.to_string()))?;

        let state = Arc::new(ServerState {
            caps: self.caps,
            memory_limit: self.memory_limit,
            used: AtomicU64::new(0),
            next_handle: AtomicU64::new(1),
            buffers: Mutex::new(HashMap::new()),
            connections: Mutex::new(Vec::new()),
        });

        info!(%local_addr, caps = format_args!("{:#x}", self.caps), "endpoint server listening");

        let accept_state = Arc::clone(&state);
        let handle = tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, peer)) => {
                        debug!(%peer, "endpoint connection accepted");
                        let state = Arc::clone(&accept_state);
                        let conn_state = Arc::clone(&accept_state);
                        let conn = tokio::spawn(async move {
                            if let Err(e) = serve_connection(stream, state).await {
                                debug!(%peer, error = %e, "endpoint connection closed");
                            }
                        });
                        let mut connections =
                            conn_state.connections.lock().expect("connection list lock");
                        connections.retain(|c: &JoinHandle<()>| !c.is_finished());
                        connections.push(conn);
                    }
                    Err(e) => {
                        warn!(error = %e, "accept failed");
                        break;
                    }
                }
            }
        });

        Ok(RunningServer { local_addr, handle, state })
    }
}

impl Default for EndpointServer {
    fn default() -> Self {
        Self::new()
    }
}

/// Handle to a bound, running server
pub struct RunningServer {
    local_addr: SocketAddr,
    handle: JoinHandle<()>,
    state: Arc<ServerState>,
}

impl RunningServer {
    pub fn addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn port(&self) -> u16 {
        self.local_addr.port()
    }

    /// Stop accepting and sever every live connection
    pub fn shutdown(&self) {
        self.handle.abort();
        let connections = self.state.connections.lock().expect("connection list lock");
        for conn in connections.iter() {
            conn.abort();
        }
    }
}

impl Drop for RunningServer {
    fn drop(&mut self) {
        self.shutdown();
    }
}

// ── Per-connection state machine ─────────────────────────────────────────────

struct ServerState {
    caps: u64,
    memory_limit: Option<u64>,
    used: AtomicU64,
    next_handle: AtomicU64,
    buffers: Mutex<HashMap<u64, BufferEntry>>,
    connections: Mutex<Vec<JoinHandle<()>>>,
}

struct BufferEntry {
    data: Vec<u8>,
}

async fn serve_connection(mut stream: TcpStream, state: Arc<ServerState>) -> RpcResult<()> {
    loop {
        let (tag, body) = match read_frame(&mut stream).await {
            Ok(frame) => frame,
            // EOF or reset: the client went away, nothing to report
            Err(RpcError::Transport(_)) => return Ok(()),
            Err(e) => return Err(e),
        };

        let command = match Command::from_u8(tag) {
            Some(c) => c,
            None => {
                write_error(
                    &mut stream,
                    tag,
                    RemoteErrorKind::Unsupported,
                    format!("unknown command tag {:#04x}", tag),
                )
                .await?;
                continue;
            }
        };

        // CAPS itself always answers, otherwise clients could never learn
        // what the endpoint speaks.
        if command != Command::Caps && state.caps & command.cap_bit() == 0 {
            write_error(
                &mut stream,
                tag,
                RemoteErrorKind::Unsupported,
                format!("{:?} not supported by this endpoint", command),
            )
            .await?;
            continue;
        }

        match handle_command(command, &body, &state) {
            Ok(resp_bytes) => {
                write_frame_bytes(&mut stream, tag, &resp_bytes).await?;
            }
            Err(remote) => {
                write_error(&mut stream, tag, remote.kind, remote.message).await?;
            }
        }
    }
}

async fn write_error(
    stream: &mut TcpStream,
    tag: u8,
    kind: RemoteErrorKind,
    message: impl Into<String>,
) -> RpcResult<()> {
    let err = RemoteError::new(kind, message);
    write_frame(stream, tag | ERROR_TAG_BIT, &err).await
}

fn handle_command(
    command: Command,
    body: &[u8],
    state: &ServerState,
) -> Result<Vec<u8>, RemoteError> {
    match command {
        Command::Caps => encode(&CapsResponse { caps: state.caps }),
        Command::Alloc => {
            let req: AllocRequest = decode(body)?;
            if let Some(limit) = state.memory_limit {
                let used = state.used.load(Ordering::Relaxed);
                if used.saturating_add(req.size) > limit {
                    return Err(RemoteError::new(
                        RemoteErrorKind::Oom,
                        format!("alloc of {} bytes exceeds limit {}", req.size, limit),
                    ));
                }
            }
            state.used.fetch_add(req.size, Ordering::Relaxed);
            let handle = state.next_handle.fetch_add(1, Ordering::Relaxed);
            let mut buffers = state.buffers.lock().expect("buffer store lock");
            buffers.insert(handle, BufferEntry { data: vec![0u8; req.size as usize] });
            debug!(handle, size = req.size, device = req.device, "alloc");
            encode(&AllocResponse { handle })
        }
        Command::Free => {
            let req: FreeRequest = decode(body)?;
            let mut buffers = state.buffers.lock().expect("buffer store lock");
            match buffers.remove(&req.handle) {
                Some(entry) => {
                    state.used.fetch_sub(entry.data.len() as u64, Ordering::Relaxed);
                    debug!(handle = req.handle, "free");
                    encode(&())
                }
                None => Err(unknown_handle(req.handle)),
            }
        }
        Command::Upload => {
            let req: UploadRequest = decode(body)?;
            let mut buffers = state.buffers.lock().expect("buffer store lock");
            let entry = buffers
                .get_mut(&req.handle)
                .ok_or_else(|| unknown_handle(req.handle))?;
            let end = (req.offset as usize).saturating_add(req.bytes.len());
            if end > entry.data.len() {
                return Err(RemoteError::new(
                    RemoteErrorKind::InvalidRequest,
                    format!(
                        "upload of {} bytes at offset {} overflows buffer of {} bytes",
                        req.bytes.len(),
                        req.offset,
                        entry.data.len()
                    ),
                ));
            }
            entry.data[req.offset as usize..end].copy_from_slice(&req.bytes);
            encode(&())
        }
        Command::Download => {
            let req: DownloadRequest = decode(body)?;
            let buffers = state.buffers.lock().expect("buffer store lock");
            let entry = buffers
                .get(&req.handle)
                .ok_or_else(|| unknown_handle(req.handle))?;
            let end = req.offset.saturating_add(req.nbytes) as usize;
            if end > entry.data.len() {
                return Err(RemoteError::new(
                    RemoteErrorKind::InvalidRequest,
                    format!(
                        "download of {} bytes at offset {} overflows buffer of {} bytes",
                        req.nbytes,
                        req.offset,
                        entry.data.len()
                    ),
                ));
            }
            let bytes = entry.data[req.offset as usize..end].to_vec();
            encode(&DownloadResponse { bytes })
        }
        Command::MulMatIdPartial => {
            let req: MulMatIdPartialRequest = decode(body)?;
            let out = partial_mul_mat_id(&req, state)?;
            encode(&MulMatIdPartialResponse { bytes: f32s_to_bytes(&out) })
        }
    }
}

fn partial_mul_mat_id(
    req: &MulMatIdPartialRequest,
    state: &ServerState,
) -> Result<Vec<f32>, RemoteError> {
    if req.expert_hi < req.expert_lo {
        return Err(RemoteError::new(
            RemoteErrorKind::InvalidRequest,
            format!("inverted expert range [{}, {})", req.expert_lo, req.expert_hi),
        ));
    }
    let dims = &req.weight_meta.dims;
    if dims.len() != 3 {
        return Err(RemoteError::new(
            RemoteErrorKind::InvalidRequest,
            format!("weight shard must be rank 3, got {:?}", dims),
        ));
    }
    let (d_in, d_out, local_experts) = (dims[0] as usize, dims[1] as usize, dims[2] as usize);
    if local_experts != (req.expert_hi - req.expert_lo) as usize {
        return Err(RemoteError::new(
            RemoteErrorKind::InvalidRequest,
            format!(
                "shard holds {} experts but range [{}, {}) spans {}",
                local_experts,
                req.expert_lo,
                req.expert_hi,
                req.expert_hi - req.expert_lo
            ),
        ));
    }

    let weights = {
        let buffers = state.buffers.lock().expect("buffer store lock");
        let entry = buffers
            .get(&req.weight_handle)
            .ok_or_else(|| unknown_handle(req.weight_handle))?;
        let need = req.weight_meta.byte_size() as usize;
        if entry.data.len() < need {
            return Err(RemoteError::new(
                RemoteErrorKind::InvalidRequest,
                format!("shard buffer holds {} bytes, meta implies {}", entry.data.len(), need),
            ));
        }
        req.weight_meta
            .dtype
            .decode_f32(&entry.data[..need])
            .map_err(|e| RemoteError::new(RemoteErrorKind::Compute, e.to_string()))?
    };

    let activations = match &req.activations {
        ActivationsRef::Inline(bytes) => crate::protocol::bytes_to_f32s(bytes)
            .map_err(|e| RemoteError::new(RemoteErrorKind::InvalidRequest, e.to_string()))?,
        ActivationsRef::Handle(handle) => {
            let buffers = state.buffers.lock().expect("buffer store lock");
            let entry = buffers.get(handle).ok_or_else(|| unknown_handle(*handle))?;
            crate::protocol::bytes_to_f32s(&entry.data)
                .map_err(|e| RemoteError::new(RemoteErrorKind::InvalidRequest, e.to_string()))?
        }
    };

    let n_tokens = req.routing.n_tokens as usize;
    if activations.len() != d_in * n_tokens {
        return Err(RemoteError::new(
            RemoteErrorKind::InvalidRequest,
            format!(
                "activations hold {} values, expected {} x {} tokens",
                activations.len(),
                d_in,
                n_tokens
            ),
        ));
    }

    Ok(kernel(
        &weights,
        d_in,
        d_out,
        &activations,
        &req.routing,
        req.expert_lo,
        req.expert_hi,
    ))
}

/// Naive partial MUL_MAT_ID: `out[t] += W[e] · x[t]` for every selection
/// `e` of token `t` that falls inside `[lo, hi)`; other tokens stay zero
fn kernel(
    weights: &[f32],
    d_in: usize,
    d_out: usize,
    activations: &[f32],
    routing: &RoutingIds,
    lo: u32,
    hi: u32,
) -> Vec<f32> {
    let n_tokens = routing.n_tokens as usize;
    let mut out = vec![0.0f32; d_out * n_tokens];
    for t in 0..n_tokens {
        let x = &activations[t * d_in..(t + 1) * d_in];
        let y = &mut out[t * d_out..(t + 1) * d_out];
        for &e in routing.token_ids(t) {
            if e < lo || e >= hi {
                continue;
            }
            let base = (e - lo) as usize * d_in * d_out;
            for (j, acc) in y.iter_mut().enumerate() {
                let row = &weights[base + j * d_in..base + (j + 1) * d_in];
                *acc += row.iter().zip(x).map(|(w, v)| w * v).sum::<f32>();
            }
        }
    }
    out
}

fn unknown_handle(handle: u64) -> RemoteError {
    RemoteError::new(RemoteErrorKind::InvalidRequest, format!("unknown handle {}", handle))
}

fn decode<T: serde::de::DeserializeOwned>(body: &[u8]) -> Result<T, RemoteError> {
    bincode::deserialize(body)
        .map_err(|e| RemoteError::new(RemoteErrorKind::InvalidRequest, e.to_string()))
}

fn encode<T: serde::Serialize>(value: &T) -> Result<Vec<u8>, RemoteError> {
    bincode::serialize(value)
        .map_err(|e| RemoteError::new(RemoteErrorKind::Compute, e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::{Endpoint, EndpointClient};
    use crate::protocol::{Dtype, TensorMeta};

    #[test]
    fn test_kernel_zero_outside_range() {
        // 2 local experts [4, 6), identity-ish weights
        let d_in = 2;
        let d_out = 2;
        let mut weights = vec![0.0f32; 2 * d_in * d_out];
        // expert 4 (local 0): identity; expert 5 (local 1): 2x identity
        weights[0] = 1.0;
        weights[3] = 1.0;
        weights[4] = 2.0;
        weights[7] = 2.0;

        // token 0 -> expert 4, token 1 -> expert 0 (owned elsewhere)
        let routing = RoutingIds::new(1, 2, vec![4, 0]).unwrap();
        let activations = vec![1.0, 2.0, 3.0, 4.0];

        let out = kernel(&weights, d_in, d_out, &activations, &routing, 4, 6);
        assert_eq!(out, vec![1.0, 2.0, 0.0, 0.0]);
    }

    #[tokio::test]
    async fn test_alloc_upload_download_roundtrip() {
        let server = EndpointServer::new().bind("127.0.0.1:0").await.unwrap();
        let client = EndpointClient::connect(Endpoint::new("127.0.0.1", server.port(), 0))
            .await
            .unwrap();

        let handle = client.alloc(64).await.unwrap();
        let payload: Vec<u8> = (0..64).collect();
        client.upload(handle, 0, &payload).await.unwrap();

        let back = client.download(handle, 0, 64).await.unwrap();
        assert_eq!(back, payload);

        let tail = client.download(handle, 32, 32).await.unwrap();
        assert_eq!(tail, &payload[32..]);

        client.free(handle).await.unwrap();
        assert!(client.free(handle).await.is_err());
    }

    #[tokio::test]
    async fn test_caps_mask_enforced() {
        let caps = full_caps() & !Command::MulMatIdPartial.cap_bit();
        let server = EndpointServer::new()
            .with_caps(caps)
            .bind("127.0.0.1:0")
            .await
            .unwrap();
        let client = EndpointClient::connect(Endpoint::new("127.0.0.1", server.port(), 0))
            .await
            .unwrap();

        assert!(!client.supports(Command::MulMatIdPartial));
        assert!(client.supports(Command::Upload));

        let req = MulMatIdPartialRequest {
            weight_handle: 1,
            weight_meta: TensorMeta::new(&[2, 2, 1], Dtype::F32),
            activations: ActivationsRef::Inline(vec![]),
            routing: RoutingIds::new(1, 1, vec![0]).unwrap(),
            expert_lo: 0,
            expert_hi: 1,
        };
        let result = client.mul_mat_id_partial(&req).await;
        assert!(matches!(result, Err(RpcError::ProtocolMismatch(_))));
    }

    #[tokio::test]
    async fn test_memory_limit_reports_oom() {
        let server = EndpointServer::new()
            .with_memory_limit(100)
            .bind("127.0.0.1:0")
            .await
            .unwrap();
        let client = EndpointClient::connect(Endpoint::new("127.0.0.1", server.port(), 0))
            .await
            .unwrap();

        let handle = client.alloc(80).await.unwrap();
        let result = client.alloc(80).await;
        assert!(matches!(result, Err(RpcError::RemoteOom(_))));

        // freeing makes room again
        client.free(handle).await.unwrap();
        client.alloc(80).await.unwrap();
    }
}
