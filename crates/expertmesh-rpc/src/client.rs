//! Endpoint client
//!
//! One reliable ordered TCP connection per remote endpoint. Requests are
//! serialized by an internal mutex so the client can be shared behind an
//! `Arc` and called from any task while preserving one-in-flight ordering
//! on the connection. A broken connection is never re-established; the
//! owning layer decides what to do with the surfaced transport error.

use std::fmt;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::codec::{decode_response, read_frame, write_frame, MAX_UPLOAD_CHUNK};
use crate::error::{RpcError, RpcResult};
use crate::protocol::{
    AllocRequest, AllocResponse, CapsResponse, Command, DownloadRequest, DownloadResponse,
    FreeRequest, MulMatIdPartialRequest, MulMatIdPartialResponse, UploadRequest,
};

/// Network identity of one remote endpoint
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
    /// Remote device index, typically 0
    pub device: u32,
}

impl Endpoint {
    pub fn new(host: impl Into<String>, port: u16, device: u32) -> Self {
        Self { host: host.into(), port, device }
    }

    /// Socket address string accepted by `TcpStream::connect`
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Client for one remote endpoint
pub struct EndpointClient {
    endpoint: Endpoint,
    conn: Mutex<TcpStream>,
    /// Capability bitmask probed once at connect time
    caps: u64,
}

impl EndpointClient {
    /// Connect and probe the endpoint's capabilities
    pub async fn connect(endpoint: Endpoint) -> RpcResult<Self> {
        let stream = TcpStream::connect(endpoint.addr()).await.map_err(|e| {
            RpcError::Transport(format!("connect to {}: {}", endpoint, e))
        })?;
        // Request/response latency matters more than throughput here.
        let _ = stream.set_nodelay(true);

        let mut client = Self { endpoint, conn: Mutex::new(stream), caps: 0 };
        let caps: CapsResponse = client.request(Command::Caps, &()).await?;
        client.caps = caps.caps;

        info!(endpoint = %client.endpoint, caps = format_args!("{:#x}", client.caps), "endpoint connected");
        Ok(client)
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    /// Capability bitmask reported by the endpoint
    pub fn caps(&self) -> u64 {
        self.caps
    }

    /// Whether the endpoint advertised support for a command
    pub fn supports(&self, command: Command) -> bool {
        self.caps & command.cap_bit() != 0
    }

    /// Allocate a remote buffer on this endpoint's device
    pub async fn alloc(&self, size: u64) -> RpcResult<u64> {
        let req = AllocRequest { device: self.endpoint.device, size };
        let resp: AllocResponse = self.request(Command::Alloc, &req).await?;
        debug!(endpoint = %self.endpoint, size, handle = resp.handle, "allocated remote buffer");
        Ok(resp.handle)
    }

    /// Free a remote buffer
    pub async fn free(&self, handle: u64) -> RpcResult<()> {
        let req = FreeRequest { handle };
        self.request::<_, ()>(Command::Free, &req).await
    }

    /// Write bytes into a remote buffer, chunking large payloads
    ///
    /// The connection lock is held across all chunks so interleaved callers
    /// cannot split one logical upload.
    pub async fn upload(&self, handle: u64, offset: u64, bytes: &[u8]) -> RpcResult<()> {
        let mut conn = self.conn.lock().await;
        let mut pos = 0usize;
        while pos < bytes.len() {
            let end = (pos + MAX_UPLOAD_CHUNK).min(bytes.len());
            let req = UploadRequest {
                handle,
                offset: offset + pos as u64,
                bytes: bytes[pos..end].to_vec(),
            };
            write_frame(&mut *conn, Command::Upload as u8, &req).await?;
            let (tag, body) = read_frame(&mut *conn).await?;
            decode_response::<()>(Command::Upload as u8, tag, &body)?;
            pos = end;
        }
        debug!(endpoint = %self.endpoint, handle, offset, nbytes = bytes.len(), "uploaded");
        Ok(())
    }

    /// Read bytes back out of a remote buffer
    pub async fn download(&self, handle: u64, offset: u64, nbytes: u64) -> RpcResult<Vec<u8>> {
        let req = DownloadRequest { handle, offset, nbytes };
        let resp: DownloadResponse = self.request(Command::Download, &req).await?;
        if resp.bytes.len() as u64 != nbytes {
            return Err(RpcError::BadResponse(format!(
                "download returned {} bytes, requested {}",
                resp.bytes.len(),
                nbytes
            )));
        }
        Ok(resp.bytes)
    }

    /// Partial routed matmul over this endpoint's local expert range
    pub async fn mul_mat_id_partial(
        &self,
        req: &MulMatIdPartialRequest,
    ) -> RpcResult<Vec<u8>> {
        let resp: MulMatIdPartialResponse =
            self.request(Command::MulMatIdPartial, req).await?;
        Ok(resp.bytes)
    }

    async fn request<Req, Resp>(&self, command: Command, req: &Req) -> RpcResult<Resp>
    where
        Req: Serialize,
        Resp: DeserializeOwned,
    {
        let mut conn = self.conn.lock().await;
        write_frame(&mut *conn, command as u8, req).await?;
        let (tag, body) = read_frame(&mut *conn).await?;
        decode_response(command as u8, tag, &body)
    }
}

impl fmt::Debug for EndpointClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EndpointClient")
            .field("endpoint", &self.endpoint)
            .field("caps", &self.caps)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_endpoint_identity() {
        let a = Endpoint::new("10.0.0.1", 50052, 0);
        let b = Endpoint::new("10.0.0.1", 50052, 0);
        let c = Endpoint::new("10.0.0.1", 50052, 1);
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.to_string(), "10.0.0.1:50052");
        assert_eq!(a.addr(), "10.0.0.1:50052");
    }
}
