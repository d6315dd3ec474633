//! Policy query and decision types.
//!
//! The dispatcher builds a `PolicyQuery` for every call, in both directions,
//! and consumes the `PolicyDecision` immediately. Decisions are never
//! persisted. Anything other than `allow = true` blocks the call.

use serde::{Deserialize, Serialize};

use crate::identity::AgentId;

/// Which side of the wire a decision was made on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    /// The local agent is the caller.
    Outbound,
    /// The local agent is the callee.
    Inbound,
}

/// Context forwarded to the policy engine alongside the identity triple.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PolicyContext {
    /// Correlation id of the call being authorized.
    pub trace_id: String,
    /// Side of the wire evaluating the query.
    pub direction: Direction,
    /// Free-form attributes; the runtime never inspects them.
    #[serde(default)]
    pub attributes: serde_json::Value,
}

/// The authorization question: may `caller` invoke `action` on `callee`?
///
/// Field names follow the engine's input contract so the query can be
/// serialized as the engine `input` document as-is.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PolicyQuery {
    #[serde(rename = "caller_spiffe_id")]
    pub caller: AgentId,
    #[serde(rename = "callee_spiffe_id")]
    pub callee: AgentId,
    pub action: String,
    pub context: PolicyContext,
}

/// The engine's answer for one query.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyDecision {
    pub allow: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl PolicyDecision {
    /// An allow decision with no reason.
    pub fn allow() -> Self {
        Self {
            allow: true,
            reason: None,
        }
    }

    /// A deny decision with an explanation.
    pub fn deny(reason: impl Into<String>) -> Self {
        Self {
            allow: false,
            reason: Some(reason.into()),
        }
    }

    /// The reason to report for a deny, with a fallback when the engine gave none.
    pub fn denial_reason(&self) -> String {
        self.reason
            .clone()
            .unwrap_or_else(|| "denied by policy".to_string())
    }
}
