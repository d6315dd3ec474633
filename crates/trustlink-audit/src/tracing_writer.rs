//! Audit writer that emits the hash chain as structured log events.
//!
//! Only the chain head is held in memory. Each record becomes one `info!`
//! event on the `trustlink::audit` target carrying the record fields plus
//! `sequence`, `prev_hash` and `this_hash`, so a log pipeline can rebuild and
//! verify the chain downstream.

use std::sync::Mutex;

use tracing::info;

use trustlink_contracts::{
    audit::AuthorizationRecord,
    error::{TrustlinkError, TrustlinkResult},
};
use trustlink_core::traits::AuditWriter;

use crate::chain::ChainHead;

pub struct TracingAuditWriter {
    head: Mutex<ChainHead>,
}

impl TracingAuditWriter {
    pub fn new(agent: impl Into<String>) -> Self {
        Self {
            head: Mutex::new(ChainHead::new(agent)),
        }
    }

    /// Hash of the last emitted event.
    pub fn last_hash(&self) -> TrustlinkResult<String> {
        self.head
            .lock()
            .map(|h| h.last_hash().to_string())
            .map_err(|e| TrustlinkError::AuditWriteFailed {
                reason: format!("audit chain lock poisoned: {}", e),
            })
    }
}

impl AuditWriter for TracingAuditWriter {
    fn write(&self, record: &AuthorizationRecord) -> TrustlinkResult<()> {
        let mut head = self.head.lock().map_err(|e| TrustlinkError::AuditWriteFailed {
            reason: format!("audit chain lock poisoned: {}", e),
        })?;
        let event = head.append(record)?;

        info!(
            target: "trustlink::audit",
            sequence = event.sequence,
            direction = ?record.direction,
            caller = %record.caller,
            callee = %record.callee,
            action = %record.action,
            trace_id = %record.trace_id,
            allow = record.decision.allow,
            reason = record.decision.reason.as_deref().unwrap_or(""),
            timestamp = %record.timestamp.to_rfc3339(),
            prev_hash = %event.prev_hash,
            this_hash = %event.this_hash,
            "authorization decision"
        );
        Ok(())
    }
}
