//! Address resolution for peer identities.

use std::collections::HashMap;

use trustlink_contracts::{
    error::{TrustlinkError, TrustlinkResult},
    identity::AgentId,
};

/// A fixed map from peer identity to `host:port`, loaded from configuration.
#[derive(Debug, Clone, Default)]
pub struct StaticPeerDirectory {
    peers: HashMap<AgentId, String>,
}

impl StaticPeerDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace the address for `id`.
    pub fn insert(&mut self, id: AgentId, address: impl Into<String>) {
        self.peers.insert(id, address.into());
    }

    pub fn resolve(&self, id: &AgentId) -> TrustlinkResult<&str> {
        self.peers
            .get(id)
            .map(String::as_str)
            .ok_or_else(|| TrustlinkError::UnknownPeer { id: id.to_string() })
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }
}

impl FromIterator<(AgentId, String)> for StaticPeerDirectory {
    fn from_iter<I: IntoIterator<Item = (AgentId, String)>>(iter: I) -> Self {
        Self {
            peers: iter.into_iter().collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_known_and_unknown() {
        let y = AgentId::parse("spiffe://example.org/agents/y").unwrap();
        let z = AgentId::parse("spiffe://example.org/agents/z").unwrap();

        let directory: StaticPeerDirectory = [(y.clone(), "10.0.0.7:8443".to_string())]
            .into_iter()
            .collect();

        assert_eq!(directory.resolve(&y).unwrap(), "10.0.0.7:8443");
        assert!(matches!(
            directory.resolve(&z),
            Err(TrustlinkError::UnknownPeer { .. })
        ));
    }
}
