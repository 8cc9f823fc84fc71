//! Frame codec for the endpoint wire protocol
//!
//! Wire format, all integers little-endian:
//!
//! ```text
//! [8-byte length][1-byte command tag][bincode body]
//! ```
//!
//! The length covers the tag byte plus the body. A response frame whose tag
//! has [`ERROR_TAG_BIT`] set carries a [`RemoteError`] body instead of the
//! command's response body.

use bytes::{BufMut, BytesMut};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{RpcError, RpcResult};
use crate::protocol::RemoteError;

/// Maximum frame size (256 MiB). Expert shards are large, but anything
/// beyond this is a framing error, not a legitimate payload.
pub const MAX_FRAME_SIZE: u64 = 256 * 1024 * 1024;

/// Upload payloads above this size are split into sequential UPLOAD frames
pub const MAX_UPLOAD_CHUNK: usize = 32 * 1024 * 1024;

/// Tag bit marking a response frame as an error report
pub const ERROR_TAG_BIT: u8 = 0x80;

/// Encode a frame into a byte buffer
pub fn encode_frame<B: Serialize>(tag: u8, body: &B) -> RpcResult<Vec<u8>> {
    let body_bytes = bincode::serialize(body)?;
    let total_len = 1 + body_bytes.len() as u64;
    if total_len > MAX_FRAME_SIZE {
        return Err(RpcError::FrameTooLarge(total_len));
    }

    let mut buf = BytesMut::with_capacity(8 + total_len as usize);
    buf.put_u64_le(total_len);
    buf.put_u8(tag);
    buf.put_slice(&body_bytes);
    Ok(buf.to_vec())
}

/// Write one frame to the transport
pub async fn write_frame<W, B>(io: &mut W, tag: u8, body: &B) -> RpcResult<()>
where
    W: AsyncWrite + Unpin,
    B: Serialize,
{
    let bytes = encode_frame(tag, body)?;
    io.write_all(&bytes).await?;
    io.flush().await?;
    Ok(())
}

/// Write a frame whose body is already encoded
pub async fn write_frame_bytes<W>(io: &mut W, tag: u8, body: &[u8]) -> RpcResult<()>
where
    W: AsyncWrite + Unpin,
{
    let total_len = 1 + body.len() as u64;
    if total_len > MAX_FRAME_SIZE {
        return Err(RpcError::FrameTooLarge(total_len));
    }
    let mut buf = BytesMut::with_capacity(8 + total_len as usize);
    buf.put_u64_le(total_len);
    buf.put_u8(tag);
    buf.put_slice(body);
    io.write_all(&buf).await?;
    io.flush().await?;
    Ok(())
}

/// Read one frame from the transport, returning the raw tag and body bytes
pub async fn read_frame<R>(io: &mut R) -> RpcResult<(u8, Vec<u8>)>
where
    R: AsyncRead + Unpin,
{
    let mut len_buf = [0u8; 8];
    io.read_exact(&mut len_buf).await?;
    let len = u64::from_le_bytes(len_buf);

    if len == 0 {
        return Err(RpcError::Transport("empty frame".to_string()));
    }
    if len > MAX_FRAME_SIZE {
        return Err(RpcError::FrameTooLarge(len));
    }

    let mut msg = vec![0u8; len as usize];
    io.read_exact(&mut msg).await?;

    let tag = msg[0];
    msg.drain(..1);
    Ok((tag, msg))
}

/// Decode a body received with [`read_frame`]
pub fn decode_body<B: DeserializeOwned>(bytes: &[u8]) -> RpcResult<B> {
    Ok(bincode::deserialize(bytes)?)
}

/// Interpret a response frame for a request sent with `expected` tag
///
/// Returns the decoded response body, or the remote error mapped onto the
/// client taxonomy if the endpoint answered with an error frame.
pub fn decode_response<B: DeserializeOwned>(
    expected: u8,
    tag: u8,
    body: &[u8],
) -> RpcResult<B> {
    if tag == expected | ERROR_TAG_BIT {
        let err: RemoteError = decode_body(body)?;
        return Err(err.into_rpc_error());
    }
    if tag != expected {
        return Err(RpcError::BadResponse(format!(
            "response tag {:#04x} does not match request tag {:#04x}",
            tag, expected
        )));
    }
    decode_body(body)
}
