//! Core trait definitions for the TRUSTLINK dispatch pipeline.
//!
//! These traits define the trust boundary around the dispatcher:
//!
//! - `IdentityProvider` — trusted source of the local identity
//! - `PolicyDecider`    — trusted gate, consulted for every call
//! - `Connector`        — establishes authenticated channels to peers
//! - `Channel`          — one authenticated connection, one exchange at a time
//! - `AuditWriter`      — trusted sink for authorization records
//!
//! The dispatcher wires them together. Capability handlers are untrusted and
//! are only reached after `PolicyDecider::evaluate` allows the call.

use async_trait::async_trait;

use trustlink_contracts::{
    audit::AuthorizationRecord,
    call::CallResult,
    error::TrustlinkResult,
    identity::{AgentId, AgentIdentity},
    policy::{PolicyDecision, PolicyQuery},
    wire::WireRequest,
};

/// Source of the agent's own identity.
///
/// Implementations must never return an expired identity: once the held
/// document has expired, `current()` fails with `IdentityUnavailable`.
pub trait IdentityProvider: Send + Sync {
    fn current(&self) -> TrustlinkResult<AgentIdentity>;
}

/// The policy decision point.
///
/// The signature is infallible on purpose: implementations fold every
/// failure to reach their engine into a deny, so no caller can
/// accidentally treat an outage as an allow.
#[async_trait]
pub trait PolicyDecider: Send + Sync {
    async fn evaluate(&self, query: &PolicyQuery) -> PolicyDecision;
}

/// Establishes mutually authenticated channels.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Dial `target` and complete the authenticated handshake.
    ///
    /// Failures to reach or handshake with the destination must be reported as
    /// `ConnectFailed` so the dispatcher can retry them.
    async fn connect(&self, target: &AgentId) -> TrustlinkResult<Box<dyn Channel>>;
}

/// An established, authenticated connection to one peer.
#[async_trait]
pub trait Channel: Send {
    /// The identity the peer proved during the handshake.
    fn peer(&self) -> &AgentId;

    /// Send one request frame and wait for its response envelope.
    async fn call(&mut self, request: &WireRequest) -> TrustlinkResult<CallResult>;
}

/// The authorization audit sink.
///
/// Every policy decision the dispatcher consumes is written here before the
/// call proceeds. A failed write blocks an allowed call.
pub trait AuditWriter: Send + Sync {
    fn write(&self, record: &AuthorizationRecord) -> TrustlinkResult<()>;
}
