//! Discovery document construction.

use trustlink_contracts::{
    discovery::{DiscoveryDocument, TransportRequirements},
    identity::AgentId,
};

use crate::registry::CapabilityRegistry;

/// Build the public document for this agent.
///
/// Pure: the same inputs always produce the same document, with capabilities
/// in name order.
pub fn build_discovery(
    name: &str,
    identity: &AgentId,
    registry: &CapabilityRegistry,
    transport: TransportRequirements,
) -> DiscoveryDocument {
    DiscoveryDocument {
        name: name.to_string(),
        identity: identity.clone(),
        capabilities: registry.descriptors(),
        transport,
    }
}
