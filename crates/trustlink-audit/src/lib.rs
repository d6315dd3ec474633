//! # trustlink-audit
//!
//! Append-only, SHA-256 hash-chained authorization audit trail.
//!
//! ## Overview
//!
//! Every policy decision the dispatcher consumes is wrapped in an
//! `AuditEvent` that links to the previous event via its SHA-256 hash.
//! Tampering with any event, even a single byte, breaks the chain and is
//! detected by `verify_chain`.
//!
//! Two sinks are provided: `InMemoryAuditWriter` keeps the whole chain for
//! inspection, `TracingAuditWriter` streams it to the log pipeline.
//!
//! ## Usage
//!
//! ```rust,ignore
//! use trustlink_audit::InMemoryAuditWriter;
//! use trustlink_core::traits::AuditWriter;
//!
//! let writer = InMemoryAuditWriter::new("spiffe://example.org/agents/x");
//! writer.write(&record)?;
//! assert!(writer.verify_integrity());
//! ```

pub mod chain;
pub mod event;
pub mod memory;
pub mod tracing_writer;

pub use chain::{hash_event, verify_chain, ChainHead};
pub use event::{AuditEvent, AuditLog};
pub use memory::InMemoryAuditWriter;
pub use tracing_writer::TracingAuditWriter;

// ── Tests ─────────────────────────────────────────────────────────────────────
