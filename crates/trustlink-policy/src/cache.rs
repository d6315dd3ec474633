//! Short-lived decision cache for the HTTP client.
//!
//! Keyed on (caller, callee, action, SHA-256 of the canonical context). The
//! trace id is not part of the key: it differs on every call and carries no
//! authorization meaning. Entries live at most `MAX_CACHE_TTL`.

use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use tokio::time::Instant;

use trustlink_contracts::policy::{PolicyDecision, PolicyQuery};

/// Upper bound on how long any decision may be reused.
pub const MAX_CACHE_TTL: Duration = Duration::from_secs(5);

/// Entries kept before expired ones are swept on insert.
const SWEEP_THRESHOLD: usize = 1024;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct CacheKey {
    caller: String,
    callee: String,
    action: String,
    context_digest: String,
}

impl CacheKey {
    fn for_query(query: &PolicyQuery) -> Self {
        let canonical = sorted(&json!({
            "direction": query.context.direction,
            "attributes": query.context.attributes,
        }));
        let digest = Sha256::digest(canonical.to_string().as_bytes());
        Self {
            caller: query.caller.to_string(),
            callee: query.callee.to_string(),
            action: query.action.clone(),
            context_digest: hex::encode(digest),
        }
    }
}

/// Rebuild `value` with every object's keys in lexical order, so equal
/// contexts serialize to equal bytes whatever order their keys arrived in.
fn sorted(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut entries: Vec<_> = map.iter().collect();
            entries.sort_by(|a, b| a.0.cmp(b.0));
            Value::Object(
                entries
                    .into_iter()
                    .map(|(key, inner)| (key.clone(), sorted(inner)))
                    .collect(),
            )
        }
        Value::Array(items) => Value::Array(items.iter().map(sorted).collect()),
        other => other.clone(),
    }
}

#[derive(Debug)]
pub struct DecisionCache {
    ttl: Duration,
    entries: Mutex<HashMap<CacheKey, (PolicyDecision, Instant)>>,
}

impl DecisionCache {
    /// Create a cache; `ttl` is clamped to `MAX_CACHE_TTL`.
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl: ttl.min(MAX_CACHE_TTL),
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// A still-fresh decision for `query`, if any.
    pub fn get(&self, query: &PolicyQuery) -> Option<PolicyDecision> {
        let key = CacheKey::for_query(query);
        let entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        entries
            .get(&key)
            .filter(|(_, stored)| stored.elapsed() < self.ttl)
            .map(|(decision, _)| decision.clone())
    }

    /// Remember an engine answer for `query`.
    pub fn insert(&self, query: &PolicyQuery, decision: &PolicyDecision) {
        let key = CacheKey::for_query(query);
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        if entries.len() >= SWEEP_THRESHOLD {
            let ttl = self.ttl;
            entries.retain(|_, (_, stored)| stored.elapsed() < ttl);
        }
        entries.insert(key, (decision.clone(), Instant::now()));
    }

    pub fn len(&self) -> usize {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
