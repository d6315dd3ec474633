//! Capability registry: the closed mapping from action names to handlers.
//!
//! Registration happens on a `RegistryBuilder` during startup. `build()`
//! freezes the map into a `CapabilityRegistry`, which has no mutating API at
//! all, so late registration is unrepresentable and reads need no lock.
//!
//! The registry is not an authorization boundary. The dispatcher only calls
//! `dispatch()` after the policy engine has allowed the action.

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tracing::{debug, warn};

use trustlink_contracts::{
    call::Artifact,
    capability::CapabilityDescriptor,
    error::{TrustlinkError, TrustlinkResult},
};

/// Error type handlers may return. Its text never leaves the process.
pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

/// What a handler produces.
pub type HandlerResult = Result<Vec<Artifact>, HandlerError>;

/// A local implementation of one capability.
#[async_trait]
pub trait CapabilityHandler: Send + Sync {
    async fn handle(&self, payload: Value) -> HandlerResult;
}

/// Adapter turning an async closure into a `CapabilityHandler`.
pub struct FnHandler<F>(F);

#[async_trait]
impl<F, Fut> CapabilityHandler for FnHandler<F>
where
    F: Fn(Value) -> Fut + Send + Sync,
    Fut: Future<Output = HandlerResult> + Send,
{
    async fn handle(&self, payload: Value) -> HandlerResult {
        (self.0)(payload).await
    }
}

/// Wrap an async closure as a shareable handler.
///
/// ```rust,ignore
/// let greet = handler_fn(|payload| async move {
///     let name = payload["name"].as_str().unwrap_or("stranger");
///     Ok(vec![Artifact::json(json!({ "message": format!("Hello, {name}!") }))])
/// });
/// ```
pub fn handler_fn<F, Fut>(f: F) -> Arc<dyn CapabilityHandler>
where
    F: Fn(Value) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = HandlerResult> + Send + 'static,
{
    Arc::new(FnHandler(f))
}

/// A capability declaration: public descriptor plus local handler.
#[derive(Clone)]
pub struct Capability {
    descriptor: CapabilityDescriptor,
    handler: Arc<dyn CapabilityHandler>,
}

impl Capability {
    /// Declare a JSON-in / JSON-out capability named `name`.
    pub fn new(name: impl Into<String>, handler: Arc<dyn CapabilityHandler>) -> Self {
        Self {
            descriptor: CapabilityDescriptor::new(name),
            handler,
        }
    }

    /// Bind `handler` to an already-built descriptor (e.g. one read from config).
    pub fn from_descriptor(
        descriptor: CapabilityDescriptor,
        handler: Arc<dyn CapabilityHandler>,
    ) -> Self {
        Self { descriptor, handler }
    }

    pub fn describe(mut self, description: impl Into<String>) -> Self {
        self.descriptor.description = description.into();
        self
    }

    pub fn input(mut self, content_type: impl Into<String>) -> Self {
        self.descriptor.input_content_type = content_type.into();
        self
    }

    pub fn output(mut self, content_type: impl Into<String>) -> Self {
        self.descriptor.output_content_type = content_type.into();
        self
    }

    /// Require request payloads to satisfy `schema`.
    pub fn input_schema(mut self, schema: Value) -> Self {
        self.descriptor.input_schema = Some(schema);
        self
    }

    pub fn name(&self) -> &str {
        &self.descriptor.name
    }

    pub fn descriptor(&self) -> &CapabilityDescriptor {
        &self.descriptor
    }
}

/// A registered capability with its compiled input validator.
struct Entry {
    capability: Capability,
    validator: Option<jsonschema::Validator>,
}

/// Mutable registration phase. Lives only during startup.
#[derive(Default)]
pub struct RegistryBuilder {
    entries: BTreeMap<String, Entry>,
}

impl RegistryBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register one capability.
    ///
    /// Fails with `DuplicateCapability` if the name is taken, leaving the
    /// existing registration untouched, and with `ConfigError` if the
    /// declared input schema does not compile.
    pub fn register(&mut self, capability: Capability) -> TrustlinkResult<()> {
        let name = capability.name().to_string();
        if name.trim().is_empty() {
            return Err(TrustlinkError::ConfigError {
                reason: "capability name must not be empty".to_string(),
            });
        }
        if self.entries.contains_key(&name) {
            warn!(capability = %name, "duplicate capability registration rejected");
            return Err(TrustlinkError::DuplicateCapability { name });
        }

        let validator = match &capability.descriptor.input_schema {
            Some(schema) => Some(jsonschema::validator_for(schema).map_err(|e| {
                TrustlinkError::ConfigError {
                    reason: format!("input schema for capability '{}' is invalid: {}", name, e),
                }
            })?),
            None => None,
        };

        debug!(capability = %name, "capability registered");
        self.entries.insert(name, Entry { capability, validator });
        Ok(())
    }

    /// True if `name` has been registered.
    pub fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Freeze the registrations.
    pub fn build(self) -> CapabilityRegistry {
        CapabilityRegistry {
            entries: Arc::new(self.entries),
        }
    }
}

/// The frozen registry, cheap to clone and shared read-only across tasks.
#[derive(Clone)]
pub struct CapabilityRegistry {
    entries: Arc<BTreeMap<String, Entry>>,
}

impl CapabilityRegistry {
    /// Invoke the handler registered under `name`.
    ///
    /// # Errors
    ///
    /// - `UnknownCapability` if nothing is registered under `name`
    /// - `InvalidPayload` if the payload violates the declared input schema
    /// - `InternalHandlerError` if the handler itself fails
    pub async fn dispatch(&self, name: &str, payload: Value) -> TrustlinkResult<Vec<Artifact>> {
        let entry = self
            .entries
            .get(name)
            .ok_or_else(|| TrustlinkError::UnknownCapability {
                name: name.to_string(),
            })?;

        if let Some(validator) = &entry.validator {
            let violations: Vec<String> = validator
                .iter_errors(&payload)
                .map(|e| format!("{} at '{}'", e, e.instance_path))
                .collect();
            if !violations.is_empty() {
                return Err(TrustlinkError::InvalidPayload {
                    reason: violations.join("; "),
                });
            }
        }

        entry
            .capability
            .handler
            .handle(payload)
            .await
            .map_err(|e| TrustlinkError::InternalHandlerError {
                reason: e.to_string(),
            })
    }

    /// Descriptors of every registered capability, in name order.
    pub fn descriptors(&self) -> Vec<CapabilityDescriptor> {
        self.entries
            .values()
            .map(|e| e.capability.descriptor.clone())
            .collect()
    }

    /// Registered names, in order.
    pub fn names(&self) -> Vec<&str> {
        self.entries.keys().map(String::as_str).collect()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

// ── Tests ────────────────────────────────────────────────────────────────────
