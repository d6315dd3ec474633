//! Handlers shipped with the agent binary, and the name → handler table the
//! lifecycle controller binds declared capabilities against.

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::{json, Value};

use trustlink_contracts::call::Artifact;
use trustlink_core::registry::{handler_fn, CapabilityHandler};

/// Handlers available for binding, keyed by capability name.
#[derive(Clone, Default)]
pub struct HandlerSet {
    handlers: HashMap<String, Arc<dyn CapabilityHandler>>,
}

impl HandlerSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// `greet` and `echo`.
    pub fn builtin() -> Self {
        Self::new()
            .with("greet", greet_handler())
            .with("echo", echo_handler())
    }

    /// Add or replace the handler for `name`.
    pub fn with(mut self, name: impl Into<String>, handler: Arc<dyn CapabilityHandler>) -> Self {
        self.handlers.insert(name.into(), handler);
        self
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn CapabilityHandler>> {
        self.handlers.get(name).cloned()
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

/// `{"name": "x"}` → `{"message": "Hello, x!"}`.
pub fn greet_handler() -> Arc<dyn CapabilityHandler> {
    handler_fn(|payload: Value| async move {
        let name = payload
            .get("name")
            .and_then(Value::as_str)
            .unwrap_or("stranger");
        Ok(vec![Artifact::json(json!({ "message": format!("Hello, {}!", name) }))])
    })
}

/// Returns the payload unchanged.
pub fn echo_handler() -> Arc<dyn CapabilityHandler> {
    handler_fn(|payload: Value| async move { Ok(vec![Artifact::json(payload)]) })
}
