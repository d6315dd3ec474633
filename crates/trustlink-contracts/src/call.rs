//! Call requests and the uniform result envelope.
//!
//! `CallRequest` is what a local caller hands to the dispatcher.
//! `CallResult` is what every call path returns, on both sides of the wire:
//! callers never see a raw error, only one of the three statuses below.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::capability::DEFAULT_CONTENT_TYPE;
use crate::identity::AgentId;

/// Per-call context propagated to the policy engine and the peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallContext {
    /// Correlation id carried through logs, audit records and the wire.
    pub trace_id: String,
    /// Overall deadline for the call. `None` uses the dispatcher default.
    pub timeout: Option<Duration>,
}

impl CallContext {
    /// A context with a fresh trace id and no explicit timeout.
    pub fn new() -> Self {
        Self {
            trace_id: uuid::Uuid::new_v4().to_string(),
            timeout: None,
        }
    }

    /// Set the overall call deadline.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

impl Default for CallContext {
    fn default() -> Self {
        Self::new()
    }
}

/// One outbound call, owned by the calling task until it completes.
#[derive(Debug, Clone)]
pub struct CallRequest {
    /// The identity the caller expects to reach.
    pub target: AgentId,
    /// The capability name to invoke on the target.
    pub action: String,
    /// Arbitrary JSON body handed to the remote handler.
    pub payload: serde_json::Value,
    /// Trace id and deadline.
    pub context: CallContext,
}

impl CallRequest {
    /// Build a request with a fresh context.
    pub fn new(target: AgentId, action: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            target,
            action: action.into(),
            payload,
            context: CallContext::new(),
        }
    }

    /// Set the overall call deadline.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.context.timeout = Some(timeout);
        self
    }
}

/// Terminal status of a call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallStatus {
    /// The handler ran and produced artifacts.
    Completed,
    /// The call could not be completed (transport, timeout, handler failure).
    Failed,
    /// Authorization was refused.
    Rejected,
}

/// One typed payload produced by a handler.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Artifact {
    /// Content type of `data`.
    pub content_type: String,
    /// The artifact body.
    pub data: serde_json::Value,
}

impl Artifact {
    /// A JSON artifact.
    pub fn json(data: serde_json::Value) -> Self {
        Self {
            content_type: DEFAULT_CONTENT_TYPE.to_string(),
            data,
        }
    }
}

/// Machine-readable failure category carried in a `CallResult`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    PolicyDenied,
    IdentityUnavailable,
    IdentityMismatch,
    InvalidTarget,
    UnknownPeer,
    UnknownCapability,
    InvalidPayload,
    CircuitOpen,
    Timeout,
    Transport,
    InternalHandlerError,
    Internal,
}

/// Structured failure reason. `message` is safe to show to the remote side.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallError {
    pub kind: ErrorKind,
    pub message: String,
}

/// Bookkeeping attached to every result.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallMetadata {
    /// Correlation id of the originating call.
    #[serde(default)]
    pub trace_id: String,
    /// Transport attempts made (0 when the call never reached transport).
    #[serde(default)]
    pub attempts: u32,
    /// Wall time spent producing the result.
    #[serde(default)]
    pub duration_ms: u64,
}

/// The uniform envelope produced exactly once per call.
///
/// Immutable once returned; the constructors below are the only way the
/// runtime builds one.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallResult {
    pub status: CallStatus,
    #[serde(default)]
    pub artifacts: Vec<Artifact>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<CallError>,
    #[serde(default)]
    pub metadata: CallMetadata,
}

impl CallResult {
    /// A completed call carrying `artifacts`.
    pub fn completed(artifacts: Vec<Artifact>) -> Self {
        Self {
            status: CallStatus::Completed,
            artifacts,
            error: None,
            metadata: CallMetadata::default(),
        }
    }

    /// A failed call.
    pub fn failed(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            status: CallStatus::Failed,
            artifacts: Vec::new(),
            error: Some(CallError {
                kind,
                message: message.into(),
            }),
            metadata: CallMetadata::default(),
        }
    }

    /// A call refused by policy.
    pub fn rejected(reason: impl Into<String>) -> Self {
        Self {
            status: CallStatus::Rejected,
            artifacts: Vec::new(),
            error: Some(CallError {
                kind: ErrorKind::PolicyDenied,
                message: reason.into(),
            }),
            metadata: CallMetadata::default(),
        }
    }

    /// Replace the metadata block.
    pub fn with_metadata(mut self, metadata: CallMetadata) -> Self {
        self.metadata = metadata;
        self
    }

    /// The failure kind, if any.
    pub fn error_kind(&self) -> Option<ErrorKind> {
        self.error.as_ref().map(|e| e.kind)
    }

    pub fn is_completed(&self) -> bool {
        self.status == CallStatus::Completed
    }
}
