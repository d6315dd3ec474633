//! Length-prefixed JSON framing.
//!
//! Each frame is a 4-byte big-endian length followed by that many bytes of
//! JSON. Frames larger than `MAX_FRAME_BYTES` are refused on both sides.
//!
//! Errors say where the failure happened:
//!
//! - `InvalidPayload`: the local frame cannot be encoded; nothing was written
//! - `ChannelClosed`: the write failed, or the stream died before a new frame
//!   started
//! - `Transport`: the stream died inside a frame
//! - `Codec`: the peer sent an oversized or malformed frame

use serde::{de::DeserializeOwned, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use trustlink_contracts::{
    error::{TrustlinkError, TrustlinkResult},
    wire::{encode_frame, MAX_FRAME_BYTES},
};

fn closed(e: std::io::Error) -> TrustlinkError {
    TrustlinkError::ChannelClosed {
        reason: e.to_string(),
    }
}

/// Serialize `frame` and write it with its length prefix.
pub async fn write_frame<W, T>(writer: &mut W, frame: &T) -> TrustlinkResult<()>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let body = encode_frame(frame)?;

    writer
        .write_all(&(body.len() as u32).to_be_bytes())
        .await
        .map_err(closed)?;
    writer.write_all(&body).await.map_err(closed)?;
    writer.flush().await.map_err(closed)
}

/// Read one frame.
///
/// Returns `Ok(None)` when the stream ends cleanly before a new frame starts.
pub async fn read_frame<R, T>(reader: &mut R) -> TrustlinkResult<Option<T>>
where
    R: AsyncRead + Unpin,
    T: DeserializeOwned,
{
    let mut header = [0u8; 4];
    match reader.read_exact(&mut header).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(closed(e)),
    }

    let len = u32::from_be_bytes(header) as usize;
    if len > MAX_FRAME_BYTES {
        return Err(TrustlinkError::Codec {
            reason: format!("frame of {} bytes exceeds {} byte limit", len, MAX_FRAME_BYTES),
        });
    }

    let mut body = vec![0u8; len];
    reader
        .read_exact(&mut body)
        .await
        .map_err(|e| TrustlinkError::Transport {
            reason: e.to_string(),
        })?;

    serde_json::from_slice(&body)
        .map(Some)
        .map_err(|e| TrustlinkError::Codec {
            reason: format!("malformed frame: {}", e),
        })
}

// ── Tests ────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use serde_json::json;

    use trustlink_contracts::call::{Artifact, CallResult};
    use trustlink_contracts::wire::WireRequest;

    use super::*;

    #[tokio::test]
    async fn test_frames_over_a_pipe() {
        let (mut client, mut server) = tokio::io::duplex(1024);

        let request = WireRequest {
            action: "greet".to_string(),
            payload: json!({ "name": "x" }),
            trace_id: "t-1".to_string(),
            timeout_ms: Some(250),
        };
        write_frame(&mut client, &request).await.unwrap();
        let received: WireRequest = read_frame(&mut server).await.unwrap().unwrap();
        assert_eq!(received, request);

        let reply = CallResult::completed(vec![Artifact::json(json!({ "greeting": "hi" }))]);
        write_frame(&mut server, &reply).await.unwrap();
        let back: CallResult = read_frame(&mut client).await.unwrap().unwrap();
        assert!(back.is_completed());
    }

    #[tokio::test]
    async fn test_clean_eof_is_none() {
        let (client, mut server) = tokio::io::duplex(64);
        drop(client);
        let frame: Option<WireRequest> = read_frame(&mut server).await.unwrap();
        assert!(frame.is_none());
    }

    #[tokio::test]
    async fn test_oversized_header_is_refused() {
        let (mut client, mut server) = tokio::io::duplex(64);
        client
            .write_all(&((MAX_FRAME_BYTES as u32) + 1).to_be_bytes())
            .await
            .unwrap();

        let result: TrustlinkResult<Option<WireRequest>> = read_frame(&mut server).await;
        assert!(matches!(result, Err(TrustlinkError::Codec { .. })));
    }

    #[tokio::test]
    async fn test_malformed_json_is_codec_error() {
        let (mut client, mut server) = tokio::io::duplex(64);
        client.write_all(&3u32.to_be_bytes()).await.unwrap();
        client.write_all(b"{{{").await.unwrap();

        let result: TrustlinkResult<Option<WireRequest>> = read_frame(&mut server).await;
        assert!(matches!(result, Err(TrustlinkError::Codec { .. })));
    }

    #[tokio::test]
    async fn test_truncated_body_is_transport_error() {
        let (mut client, mut server) = tokio::io::duplex(64);
        client.write_all(&10u32.to_be_bytes()).await.unwrap();
        client.write_all(b"{}").await.unwrap();
        drop(client);

        let result: TrustlinkResult<Option<WireRequest>> = read_frame(&mut server).await;
        assert!(matches!(result, Err(TrustlinkError::Transport { .. })));
    }

    #[tokio::test]
    async fn test_oversized_local_frame_is_invalid_payload() {
        let (mut client, mut server) = tokio::io::duplex(64);
        let request = WireRequest {
            action: "greet".to_string(),
            payload: json!({ "name": "x".repeat(MAX_FRAME_BYTES) }),
            trace_id: "t-big".to_string(),
            timeout_ms: None,
        };

        let result = write_frame(&mut client, &request).await;
        assert!(matches!(result, Err(TrustlinkError::InvalidPayload { .. })));

        // Nothing reached the stream.
        drop(client);
        let frame: Option<WireRequest> = read_frame(&mut server).await.unwrap();
        assert!(frame.is_none());
    }

    #[tokio::test]
    async fn test_write_to_closed_stream_is_channel_closed() {
        let (mut client, server) = tokio::io::duplex(64);
        drop(server);
        let reply = CallResult::completed(Vec::new());

        let result = write_frame(&mut client, &reply).await;
        assert!(matches!(result, Err(TrustlinkError::ChannelClosed { .. })));
    }
}
