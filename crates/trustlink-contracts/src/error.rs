//! Error taxonomy for the TRUSTLINK runtime.
//!
//! All fallible operations return `TrustlinkResult<T>`. Errors never cross
//! the wire as-is: the dispatcher folds them into a `CallResult` using
//! `kind()` and `wire_message()`, which strips internal detail.

use thiserror::Error;

use crate::call::{CallResult, ErrorKind};

/// Generic message sent to a peer in place of internal failure detail.
pub const INTERNAL_ERROR_MESSAGE: &str = "internal error";

/// The unified error type for the TRUSTLINK crates.
#[derive(Debug, Error)]
pub enum TrustlinkError {
    /// No valid identity document is held (fatal at startup, retryable during refresh).
    #[error("identity unavailable: {reason}")]
    IdentityUnavailable { reason: String },

    /// A string is not a well-formed URI identity.
    #[error("invalid identity '{value}': {reason}")]
    InvalidIdentity { value: String, reason: String },

    /// The peer presented a different identity than the one dialled.
    #[error("identity mismatch: expected '{expected}', peer presented '{presented}'")]
    IdentityMismatch { expected: String, presented: String },

    /// The target of an outbound call is unusable (malformed or self).
    #[error("invalid target: {reason}")]
    InvalidTarget { reason: String },

    /// The policy engine refused the call.
    #[error("policy denied action: {reason}")]
    PolicyDenied { reason: String },

    /// The policy engine could not be consulted. Always treated as a deny.
    #[error("policy engine unreachable: {reason}")]
    PolicyEngineUnreachable { reason: String },

    /// No handler is registered under the requested action.
    #[error("unknown capability '{name}'")]
    UnknownCapability { name: String },

    /// A capability name was registered twice.
    #[error("capability '{name}' is already registered")]
    DuplicateCapability { name: String },

    /// The payload does not satisfy the capability's input schema.
    #[error("invalid payload: {reason}")]
    InvalidPayload { reason: String },

    /// A handler returned an error or panicked. Detail stays local.
    #[error("handler failed: {reason}")]
    InternalHandlerError { reason: String },

    /// The destination's circuit breaker is open.
    #[error("circuit open for '{destination}', retry after {retry_after_ms}ms")]
    CircuitOpen { destination: String, retry_after_ms: u64 },

    /// The call deadline elapsed.
    #[error("call timed out after {after_ms}ms")]
    Timeout { after_ms: u64 },

    /// No address is known for the destination.
    #[error("no address known for peer '{id}'")]
    UnknownPeer { id: String },

    /// Establishing a connection failed (refused, unreachable, TLS handshake).
    #[error("connect to '{destination}' failed: {reason}")]
    ConnectFailed { destination: String, reason: String },

    /// An established connection broke mid-exchange.
    #[error("transport error: {reason}")]
    Transport { reason: String },

    /// The connection was already closed: the request could not be written,
    /// or the peer hung up before any byte of a response arrived.
    #[error("connection closed: {reason}")]
    ChannelClosed { reason: String },

    /// A frame could not be encoded or decoded.
    #[error("codec error: {reason}")]
    Codec { reason: String },

    /// TLS material could not be turned into a usable configuration.
    #[error("TLS error: {reason}")]
    Tls { reason: String },

    /// A required configuration value is missing or invalid.
    #[error("configuration error: {reason}")]
    ConfigError { reason: String },

    /// The audit sink could not persist an authorization record.
    #[error("audit write failed: {reason}")]
    AuditWriteFailed { reason: String },
}

/// Convenience alias used throughout the TRUSTLINK crates.
pub type TrustlinkResult<T> = Result<T, TrustlinkError>;

impl TrustlinkError {
    /// The wire-level category for this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::IdentityUnavailable { .. } => ErrorKind::IdentityUnavailable,
            Self::InvalidIdentity { .. } | Self::InvalidTarget { .. } => ErrorKind::InvalidTarget,
            Self::IdentityMismatch { .. } => ErrorKind::IdentityMismatch,
            Self::PolicyDenied { .. } | Self::PolicyEngineUnreachable { .. } => {
                ErrorKind::PolicyDenied
            }
            Self::UnknownCapability { .. } => ErrorKind::UnknownCapability,
            Self::InvalidPayload { .. } => ErrorKind::InvalidPayload,
            Self::InternalHandlerError { .. } => ErrorKind::InternalHandlerError,
            Self::CircuitOpen { .. } => ErrorKind::CircuitOpen,
            Self::Timeout { .. } => ErrorKind::Timeout,
            Self::UnknownPeer { .. } => ErrorKind::UnknownPeer,
            Self::ConnectFailed { .. }
            | Self::Transport { .. }
            | Self::ChannelClosed { .. }
            | Self::Codec { .. } => ErrorKind::Transport,
            Self::DuplicateCapability { .. }
            | Self::Tls { .. }
            | Self::ConfigError { .. }
            | Self::AuditWriteFailed { .. } => ErrorKind::Internal,
        }
    }

    /// True for connect-level failures that are safe to retry: nothing was sent.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::ConnectFailed { .. })
    }

    /// True for failures that count toward a destination's circuit breaker.
    ///
    /// Identity mismatches are excluded: they are a security verdict about the
    /// peer, not a sign of an unhealthy destination. `InvalidPayload` is a
    /// local refusal and never reaches the peer.
    pub fn trips_breaker(&self) -> bool {
        matches!(
            self,
            Self::ConnectFailed { .. }
                | Self::Transport { .. }
                | Self::ChannelClosed { .. }
                | Self::Codec { .. }
        )
    }

    /// The message that may be shown to a remote caller.
    pub fn wire_message(&self) -> String {
        match self {
            Self::InternalHandlerError { .. }
            | Self::Tls { .. }
            | Self::ConfigError { .. }
            | Self::AuditWriteFailed { .. }
            | Self::DuplicateCapability { .. } => INTERNAL_ERROR_MESSAGE.to_string(),
            Self::IdentityUnavailable { .. } => "identity unavailable".to_string(),
            Self::PolicyDenied { reason } => reason.clone(),
            Self::PolicyEngineUnreachable { .. } => "denied: policy engine unavailable".to_string(),
            Self::Timeout { .. } => "Timeout".to_string(),
            other => other.to_string(),
        }
    }

    /// Fold this error into the uniform envelope.
    ///
    /// Authorization failures become `rejected`, everything else `failed`.
    pub fn into_call_result(self) -> CallResult {
        match self {
            Self::PolicyDenied { .. } | Self::PolicyEngineUnreachable { .. } => {
                CallResult::rejected(self.wire_message())
            }
            other => CallResult::failed(other.kind(), other.wire_message()),
        }
    }
}
