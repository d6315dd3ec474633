//! The public discovery document.
//!
//! Served unauthenticated to any peer. It reveals identity and capability
//! names only, never authorization outcomes.

use serde::{Deserialize, Serialize};

use crate::capability::CapabilityDescriptor;
use crate::identity::AgentId;

/// Transport requirements a peer must meet to call this agent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransportRequirements {
    /// Always true: plaintext connections are never accepted.
    pub mutual_tls: bool,
    /// Lowest TLS protocol version accepted (`"1.2"` or `"1.3"`).
    pub min_tls_version: String,
    /// Trust domain whose bundle peer certificates must chain to.
    pub trust_domain: String,
    /// Address of the mTLS listener, when advertised.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,
}

/// Identity + capability descriptor for one agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiscoveryDocument {
    /// Operator-facing agent name.
    pub name: String,
    /// The agent's URI-form identity.
    pub identity: AgentId,
    /// Capabilities in name order.
    pub capabilities: Vec<CapabilityDescriptor>,
    /// What a caller needs to connect.
    pub transport: TransportRequirements,
}

impl DiscoveryDocument {
    /// The advertised capability names, in document order.
    pub fn capability_names(&self) -> Vec<&str> {
        self.capabilities.iter().map(|c| c.name.as_str()).collect()
    }
}
