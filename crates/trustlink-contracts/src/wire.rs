//! Frames carried over the mutually authenticated transport.
//!
//! A request frame names the action and carries the payload plus trace
//! metadata. The response frame is the `CallResult` envelope itself. The
//! caller's identity is never part of the frame: it comes from the peer
//! certificate.

use serde::{Deserialize, Serialize};

use crate::call::CallRequest;
use crate::error::{TrustlinkError, TrustlinkResult};

/// Upper bound on a single encoded frame.
pub const MAX_FRAME_BYTES: usize = 8 * 1024 * 1024;

/// Encode `frame` as JSON and check it against `MAX_FRAME_BYTES`.
///
/// Failures are `InvalidPayload`: they are the sender's fault and nothing
/// has been sent yet.
pub fn encode_frame<T: Serialize>(frame: &T) -> TrustlinkResult<Vec<u8>> {
    let body = serde_json::to_vec(frame).map_err(|e| TrustlinkError::InvalidPayload {
        reason: format!("frame is not serializable: {}", e),
    })?;
    if body.len() > MAX_FRAME_BYTES {
        return Err(TrustlinkError::InvalidPayload {
            reason: format!("frame of {} bytes exceeds {} byte limit", body.len(), MAX_FRAME_BYTES),
        });
    }
    Ok(body)
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WireRequest {
    pub action: String,
    #[serde(default)]
    pub payload: serde_json::Value,
    pub trace_id: String,
    /// Remaining caller budget, used by the peer to bound handler execution.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
}

impl WireRequest {
    /// Build the frame for `request`. `timeout_ms` is the caller's remaining budget.
    pub fn from_call(request: &CallRequest, timeout_ms: Option<u64>) -> Self {
        Self {
            action: request.action.clone(),
            payload: request.payload.clone(),
            trace_id: request.context.trace_id.clone(),
            timeout_ms,
        }
    }
}
