//! Authorization audit records.
//!
//! Every policy decision the dispatcher consumes, allow or deny, in either
//! direction, produces exactly one `AuthorizationRecord`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::identity::AgentId;
use crate::policy::{Direction, PolicyDecision};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuthorizationRecord {
    /// Side of the wire the decision was made on.
    pub direction: Direction,
    pub caller: AgentId,
    pub callee: AgentId,
    pub action: String,
    pub trace_id: String,
    /// The decision as consumed (fail-closed denials included).
    pub decision: PolicyDecision,
    /// Wall-clock time the record was created (UTC).
    pub timestamp: DateTime<Utc>,
}
