//! Length-prefixed frame codec used over vsock / hybrid-vsock / remote
//! transports.
//!
//! Each frame is `[u64 request_id][u32 len][len bytes of postcard payload]`.
//! The request id lets a long-lived connection multiplex many in-flight
//! requests and match responses out of order.
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("postcard error: {0}")]
    Postcard(#[from] postcard::Error),
    #[error("frame too large: {0} bytes")]
    TooLarge(u32),
}

/// Frames above this size are rejected rather than allocated; `copy_file`
/// chunking (§4.1) exists precisely so payloads never need to exceed this.
pub const MAX_FRAME_BYTES: u32 = 64 * 1024 * 1024;

pub struct Frame {
    pub request_id: u64,
    pub payload: Vec<u8>,
}

/// Warning: Using a private protocol, so do not send data without using
/// this function.
pub async fn send_frame<W: AsyncWrite + Unpin>(
    stream: &mut W,
    request_id: u64,
    payload: &[u8],
) -> Result<(), FrameError> {
    stream.write_u64_le(request_id).await?;
    stream.write_u32_le(payload.len() as u32).await?;
    stream.write_all(payload).await?;
    stream.flush().await?;
    Ok(())
}

/// Warning: Using a private protocol, so do not receive data without using
/// this function.
pub async fn receive_frame<R: AsyncRead + Unpin>(stream: &mut R) -> Result<Frame, FrameError> {
    let request_id = stream.read_u64_le().await?;
    let len = stream.read_u32_le().await?;
    if len > MAX_FRAME_BYTES {
        return Err(FrameError::TooLarge(len));
    }
    let mut payload = vec![0u8; len as usize];
    stream.read_exact(&mut payload).await?;
    Ok(Frame {
        request_id,
        payload,
    })
}

pub fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>, FrameError> {
    Ok(postcard::to_allocvec(value)?)
}

pub fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, FrameError> {
    Ok(postcard::from_bytes(bytes)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::duplex;

    #[tokio::test]
    async fn frame_round_trips() {
        let (mut a, mut b) = duplex(1024);
        send_frame(&mut a, 42, b"hello").await.unwrap();
        let frame = receive_frame(&mut b).await.unwrap();
        assert_eq!(frame.request_id, 42);
        assert_eq!(frame.payload, b"hello");
    }

    #[tokio::test]
    async fn oversized_frame_is_rejected() {
        let (mut a, mut b) = duplex(32);
        a.write_all(b"").await.ok();
        drop(a);
        let err = receive_frame(&mut b).await.unwrap_err();
        assert!(matches!(err, FrameError::Io(_)));
    }

    #[test]
    fn encode_decode_round_trip() {
        let bytes = encode(&(1u32, "abc".to_string())).unwrap();
        let (n, s): (u32, String) = decode(&bytes).unwrap();
        assert_eq!(n, 1);
        assert_eq!(s, "abc");
    }
}
