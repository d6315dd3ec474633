//! Audit event and log types.
//!
//! `AuditEvent` is a single entry in the hash chain: it wraps an
//! `AuthorizationRecord` with sequence numbering and the SHA-256 hashes that
//! make tampering detectable. `AuditLog` is an exported snapshot.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use trustlink_contracts::audit::AuthorizationRecord;

/// A single entry in one agent's authorization hash chain.
///
/// Modifying any field, including those of the embedded `record`,
/// invalidates `this_hash` and every subsequent `prev_hash`, which
/// `verify_chain` detects.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEvent {
    /// Position in the chain, starting at 0.
    pub sequence: u64,

    /// Identity of the agent that owns the trail.
    pub agent: String,

    /// The authorization decision being recorded.
    pub record: AuthorizationRecord,

    /// SHA-256 hash (hex) of the previous event, or `GENESIS_HASH`.
    pub prev_hash: String,

    /// SHA-256 hash (hex) over (agent, sequence, prev_hash, record).
    pub this_hash: String,
}

impl AuditEvent {
    /// The sentinel `prev_hash` used for the first event in every chain.
    pub const GENESIS_HASH: &'static str =
        "0000000000000000000000000000000000000000000000000000000000000000";
}

/// A snapshot of an agent's audit trail.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditLog {
    pub agent: String,

    /// All audit events in chain order (sequence 0 first).
    pub events: Vec<AuditEvent>,

    /// Wall-clock time (UTC) the snapshot was taken.
    pub exported_at: DateTime<Utc>,

    /// The `this_hash` of the last event. Empty string if the log is empty.
    pub terminal_hash: String,
}
