//! In-memory implementation of `AuditWriter`.
//!
//! `InMemoryAuditWriter` keeps all events in a `Vec` protected by a `Mutex`,
//! so the dispatcher can write from any task. Use `export_log()` to obtain a
//! snapshot and `verify_integrity()` to confirm the chain has not been
//! tampered with in memory.

use std::sync::{Arc, Mutex};

use chrono::Utc;
use tracing::debug;

use trustlink_contracts::{
    audit::AuthorizationRecord,
    error::{TrustlinkError, TrustlinkResult},
};
use trustlink_core::traits::AuditWriter;

use crate::{
    chain::{verify_chain, ChainHead},
    event::{AuditEvent, AuditLog},
};

// ── Internal mutable state ────────────────────────────────────────────────────

pub(crate) struct InMemoryState {
    pub(crate) head: ChainHead,
    pub(crate) events: Vec<AuditEvent>,
}

// ── Public writer ─────────────────────────────────────────────────────────────

/// An in-memory, append-only audit writer backed by a SHA-256 hash chain.
///
/// Cloning shares the underlying trail.
#[derive(Clone)]
pub struct InMemoryAuditWriter {
    pub(crate) state: Arc<Mutex<InMemoryState>>,
}

impl InMemoryAuditWriter {
    /// Create an empty trail owned by `agent`.
    pub fn new(agent: impl Into<String>) -> Self {
        let state = InMemoryState {
            head: ChainHead::new(agent),
            events: Vec::new(),
        };
        Self {
            state: Arc::new(Mutex::new(state)),
        }
    }

    fn lock(&self) -> TrustlinkResult<std::sync::MutexGuard<'_, InMemoryState>> {
        self.state.lock().map_err(|e| TrustlinkError::AuditWriteFailed {
            reason: format!("audit state lock poisoned: {}", e),
        })
    }

    /// Snapshot every event written so far.
    pub fn export_log(&self) -> TrustlinkResult<AuditLog> {
        let state = self.lock()?;
        let terminal_hash = state
            .events
            .last()
            .map(|e| e.this_hash.clone())
            .unwrap_or_default();

        Ok(AuditLog {
            agent: state.head.agent().to_string(),
            events: state.events.clone(),
            exported_at: Utc::now(),
            terminal_hash,
        })
    }

    /// Verify that the in-memory chain has not been tampered with.
    pub fn verify_integrity(&self) -> bool {
        match self.lock() {
            Ok(state) => verify_chain(&state.events),
            Err(_) => false,
        }
    }

    pub fn len(&self) -> usize {
        self.lock().map(|s| s.events.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

// ── AuditWriter impl ──────────────────────────────────────────────────────────

impl AuditWriter for InMemoryAuditWriter {
    /// Append one authorization record to the hash chain.
    fn write(&self, record: &AuthorizationRecord) -> TrustlinkResult<()> {
        let mut state = self.lock()?;
        let event = state.head.append(record)?;

        debug!(
            sequence = event.sequence,
            trace_id = %record.trace_id,
            allow = record.decision.allow,
            "authorization recorded"
        );

        state.events.push(event);
        Ok(())
    }
}
