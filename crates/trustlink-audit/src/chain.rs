//! Hash-chain primitives: hashing, chain state and integrity verification.
//!
//! Hash input layout (bytes, in order):
//!   1. agent identity as UTF-8 bytes
//!   2. sequence as 8-byte little-endian
//!   3. prev_hash as UTF-8 bytes (64 ASCII hex chars)
//!   4. canonical JSON of the authorization record

use sha2::{Digest, Sha256};

use trustlink_contracts::{
    audit::AuthorizationRecord,
    error::{TrustlinkError, TrustlinkResult},
};

use crate::event::AuditEvent;

/// Compute the SHA-256 hash for a single audit event.
///
/// The hash commits to the trail owner (`agent`), the event's position
/// (`sequence`), its link to the previous event (`prev_hash`) and the full
/// authorization record. Returns a lowercase 64-character hex string.
pub fn hash_event(
    agent: &str,
    sequence: u64,
    record: &AuthorizationRecord,
    prev_hash: &str,
) -> TrustlinkResult<String> {
    let record_json = serde_json::to_vec(record).map_err(|e| TrustlinkError::AuditWriteFailed {
        reason: format!("authorization record is not serializable: {}", e),
    })?;

    let mut hasher = Sha256::new();
    hasher.update(agent.as_bytes());
    hasher.update(sequence.to_le_bytes());
    hasher.update(prev_hash.as_bytes());
    hasher.update(&record_json);

    Ok(hex::encode(hasher.finalize()))
}

/// Verify the integrity of a hash chain.
///
/// Returns `true` when every event links to its predecessor (or to
/// `GENESIS_HASH` for the first) and every stored hash matches the value
/// recomputed from the event's own fields. An empty chain is valid.
pub fn verify_chain(events: &[AuditEvent]) -> bool {
    let mut expected_prev = AuditEvent::GENESIS_HASH.to_string();

    for event in events {
        if event.prev_hash != expected_prev {
            return false;
        }

        match hash_event(&event.agent, event.sequence, &event.record, &event.prev_hash) {
            Ok(recomputed) if recomputed == event.this_hash => {}
            _ => return false,
        }

        expected_prev = event.this_hash.clone();
    }

    true
}

/// Running position of a chain: next sequence number and last hash.
#[derive(Debug, Clone)]
pub struct ChainHead {
    agent: String,
    sequence: u64,
    last_hash: String,
}

impl ChainHead {
    pub fn new(agent: impl Into<String>) -> Self {
        Self {
            agent: agent.into(),
            sequence: 0,
            last_hash: AuditEvent::GENESIS_HASH.to_string(),
        }
    }

    pub fn agent(&self) -> &str {
        &self.agent
    }

    pub fn last_hash(&self) -> &str {
        &self.last_hash
    }

    pub fn len(&self) -> u64 {
        self.sequence
    }

    pub fn is_empty(&self) -> bool {
        self.sequence == 0
    }

    /// Seal `record` as the next event and advance the head.
    pub fn append(&mut self, record: &AuthorizationRecord) -> TrustlinkResult<AuditEvent> {
        let prev_hash = self.last_hash.clone();
        let this_hash = hash_event(&self.agent, self.sequence, record, &prev_hash)?;

        let event = AuditEvent {
            sequence: self.sequence,
            agent: self.agent.clone(),
            record: record.clone(),
            prev_hash,
            this_hash: this_hash.clone(),
        };

        self.sequence += 1;
        self.last_hash = this_hash;
        Ok(event)
    }
}
