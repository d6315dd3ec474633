//! Local policy rule types and configuration schema.
//!
//! A `PolicyConfig` is deserialized from TOML and holds an ordered list of
//! `PolicyRule`s. Rules are evaluated in declaration order: the first
//! matching rule wins. If no rule matches, the engine denies by default.

use serde::{Deserialize, Serialize};

/// The decision a rule produces when it matches a query.
///
/// Example in TOML:
/// ```toml
/// verdict = "allow"
/// verdict = "deny"
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RuleVerdict {
    Allow,
    Deny,
}

/// A single rule loaded from TOML.
///
/// `caller`, `callee` and `action` are patterns:
/// - `"*"` matches anything
/// - a value ending in `"/*"` matches every identity under that prefix
///   (`"spiffe://example.org/agents/*"`)
/// - anything else must match exactly (case-sensitive)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicyRule {
    /// Stable identifier used in logs and deny reasons.
    pub id: String,

    /// Human-readable explanation of what this rule controls.
    #[serde(default)]
    pub description: String,

    /// Pattern for the calling identity.
    #[serde(default = "wildcard")]
    pub caller: String,

    /// Pattern for the called identity.
    #[serde(default = "wildcard")]
    pub callee: String,

    /// Pattern for the capability name.
    #[serde(default = "wildcard")]
    pub action: String,

    pub verdict: RuleVerdict,

    /// Reported to the caller when `verdict = "deny"`.
    pub deny_reason: Option<String>,
}

fn wildcard() -> String {
    "*".to_string()
}

/// True if `value` satisfies `pattern`.
pub fn pattern_matches(pattern: &str, value: &str) -> bool {
    if pattern == "*" {
        return true;
    }
    match pattern.strip_suffix('*') {
        Some(prefix) if prefix.ends_with('/') => value.starts_with(prefix),
        _ => pattern == value,
    }
}

impl PolicyRule {
    /// Return true if this rule applies to the (caller, callee, action) triple.
    pub fn matches(&self, caller: &str, callee: &str, action: &str) -> bool {
        pattern_matches(&self.caller, caller)
            && pattern_matches(&self.callee, callee)
            && pattern_matches(&self.action, action)
    }
}

/// The top-level structure deserialized from a TOML policy file.
///
/// Example:
/// ```toml
/// [[rules]]
/// id = "x-greets-y"
/// caller = "spiffe://example.org/agents/x"
/// callee = "spiffe://example.org/agents/y"
/// action = "greet"
/// verdict = "allow"
/// ```
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PolicyConfig {
    /// Ordered list of rules. First match wins.
    #[serde(default)]
    pub rules: Vec<PolicyRule>,
}
