//! Capability descriptor types.
//!
//! A capability is a named action an agent exposes to its peers. The
//! descriptor is the public half: it is advertised in the discovery document
//! and carries no authorization information. Handlers are bound to
//! descriptors in `trustlink-core`.

use serde::{Deserialize, Serialize};

/// Content type used when a capability does not declare one.
pub const DEFAULT_CONTENT_TYPE: &str = "application/json";

/// The public description of one capability.
///
/// Capability names should be short and stable: they are matched verbatim by
/// policy rules (e.g. `"greet"`, `"search"`, `"invoice.create"`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CapabilityDescriptor {
    /// Unique name within one agent.
    pub name: String,
    /// Human-readable summary for operators and peers.
    #[serde(default)]
    pub description: String,
    /// Content type of the request payload.
    #[serde(default = "default_content_type")]
    pub input_content_type: String,
    /// Content type of produced artifacts.
    #[serde(default = "default_content_type")]
    pub output_content_type: String,
    /// Optional JSON Schema the request payload must satisfy.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input_schema: Option<serde_json::Value>,
}

impl CapabilityDescriptor {
    /// A JSON-in / JSON-out descriptor with no schema.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: String::new(),
            input_content_type: default_content_type(),
            output_content_type: default_content_type(),
            input_schema: None,
        }
    }
}

fn default_content_type() -> String {
    DEFAULT_CONTENT_TYPE.to_string()
}
