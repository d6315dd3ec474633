//! Local TOML rule engine.
//!
//! `TomlPolicyEngine` loads a `PolicyConfig` from a TOML string or file and
//! implements the `PolicyDecider` trait from trustlink-core. It stands in for
//! the external engine on single-host deployments and in tests.
//!
//! Evaluation algorithm:
//!
//! 1. Iterate rules in declaration order.
//! 2. The first rule whose caller, callee and action patterns all match
//!    decides.
//! 3. If no rule matched → deny with "denied by default".

use std::path::Path;

use async_trait::async_trait;
use tracing::{debug, warn};

use trustlink_contracts::{
    error::{TrustlinkError, TrustlinkResult},
    policy::{PolicyDecision, PolicyQuery},
};
use trustlink_core::traits::PolicyDecider;

use crate::rule::{PolicyConfig, RuleVerdict};

/// A `PolicyDecider` that reads rules from a TOML document.
///
/// ```rust,ignore
/// use trustlink_policy::TomlPolicyEngine;
///
/// let engine = TomlPolicyEngine::from_file(Path::new("policy.toml"))?;
/// ```
#[derive(Debug)]
pub struct TomlPolicyEngine {
    config: PolicyConfig,
}

impl TomlPolicyEngine {
    /// Parse `s` as TOML and build a `TomlPolicyEngine`.
    ///
    /// Returns `TrustlinkError::ConfigError` if the TOML is malformed or does
    /// not match the expected `PolicyConfig` schema.
    pub fn from_toml_str(s: &str) -> TrustlinkResult<Self> {
        let config: PolicyConfig = toml::from_str(s).map_err(|e| TrustlinkError::ConfigError {
            reason: format!("failed to parse policy TOML: {}", e),
        })?;
        Ok(Self { config })
    }

    /// Read the file at `path` and parse it as TOML policy configuration.
    pub fn from_file(path: &Path) -> TrustlinkResult<Self> {
        let contents = std::fs::read_to_string(path).map_err(|e| TrustlinkError::ConfigError {
            reason: format!("failed to read policy file '{}': {}", path.display(), e),
        })?;
        Self::from_toml_str(&contents)
    }

    pub fn rule_count(&self) -> usize {
        self.config.rules.len()
    }

    /// Evaluate `query` against the loaded rules.
    pub fn decide(&self, query: &PolicyQuery) -> PolicyDecision {
        let caller = query.caller.as_str();
        let callee = query.callee.as_str();
        let action = query.action.as_str();

        for rule in &self.config.rules {
            if !rule.matches(caller, callee, action) {
                continue;
            }

            debug!(
                rule_id = %rule.id,
                caller = %caller,
                callee = %callee,
                action = %action,
                "policy rule matched"
            );

            return match rule.verdict {
                RuleVerdict::Allow => PolicyDecision::allow(),
                RuleVerdict::Deny => PolicyDecision::deny(
                    rule.deny_reason
                        .clone()
                        .unwrap_or_else(|| format!("denied by rule '{}'", rule.id)),
                ),
            };
        }

        warn!(
            caller = %caller,
            callee = %callee,
            action = %action,
            "no policy rule matched; denying by default"
        );

        PolicyDecision::deny(format!(
            "denied by default: no policy rule matched '{}' calling '{}' on '{}'",
            caller, action, callee
        ))
    }
}

#[async_trait]
impl PolicyDecider for TomlPolicyEngine {
    async fn evaluate(&self, query: &PolicyQuery) -> PolicyDecision {
        self.decide(query)
    }
}
