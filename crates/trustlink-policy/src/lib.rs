//! # trustlink-policy
//!
//! Policy decision points for TRUSTLINK agents.
//!
//! ## Overview
//!
//! Two implementations of [`PolicyDecider`](trustlink_core::traits::PolicyDecider):
//!
//! - [`HttpPolicyClient`] asks an external OPA-style engine over HTTP and
//!   fails closed on every error. An optional cache keeps engine answers for
//!   at most five seconds.
//! - [`TomlPolicyEngine`] evaluates ordered caller/callee/action rules from a
//!   TOML file, first match wins, deny by default.
//!
//! ## Quick start
//!
//! ```rust,ignore
//! use trustlink_policy::{HttpPolicyClient, HttpPolicyConfig};
//!
//! let policy = HttpPolicyClient::new(HttpPolicyConfig::new(
//!     "http://127.0.0.1:8181/v1/data/a2a/decision",
//! ))?;
//! policy.probe(&local_id).await?;
//! ```

pub mod cache;
pub mod engine;
pub mod http;
pub mod rule;

pub use cache::{DecisionCache, MAX_CACHE_TTL};
pub use engine::TomlPolicyEngine;
pub use http::{HttpPolicyClient, HttpPolicyConfig};
pub use rule::{PolicyConfig, PolicyRule, RuleVerdict};

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use trustlink_contracts::{
        error::TrustlinkError,
        identity::AgentId,
        policy::{Direction, PolicyContext, PolicyDecision, PolicyQuery},
    };
    use trustlink_core::traits::PolicyDecider;

    use crate::TomlPolicyEngine;

    // ── Helpers ───────────────────────────────────────────────────────────────

    fn query(caller: &str, callee: &str, action: &str) -> PolicyQuery {
        PolicyQuery {
            caller: AgentId::parse(caller).unwrap(),
            callee: AgentId::parse(callee).unwrap(),
            action: action.to_string(),
            context: PolicyContext {
                trace_id: "trace-001".to_string(),
                direction: Direction::Inbound,
                attributes: serde_json::Value::Null,
            },
        }
    }

    // ── 1. deny-by-default ────────────────────────────────────────────────────

    /// When no rules exist, every request must be denied.
    #[test]
    fn test_deny_by_default() {
        let engine = TomlPolicyEngine::from_toml_str("rules = []").unwrap();
        let decision = engine.decide(&query("id://dom/x", "id://dom/y", "greet"));

        assert!(!decision.allow);
        let reason = decision.denial_reason();
        assert!(
            reason.contains("denied by default"),
            "expected 'denied by default' in reason, got: {reason}"
        );
    }

    // ── 2. explicit allow ─────────────────────────────────────────────────────

    #[test]
    fn test_explicit_allow() {
        let toml = r#"
            [[rules]]
            id = "x-greets-y"
            description = "x may greet y"
            caller = "id://dom/x"
            callee = "id://dom/y"
            action = "greet"
            verdict = "allow"
        "#;

        let engine = TomlPolicyEngine::from_toml_str(toml).unwrap();
        assert_eq!(
            engine.decide(&query("id://dom/x", "id://dom/y", "greet")),
            PolicyDecision::allow()
        );
        // Same action, different caller: falls through to deny.
        assert!(!engine.decide(&query("id://dom/z", "id://dom/y", "greet")).allow);
    }

    // ── 3. explicit deny ──────────────────────────────────────────────────────

    #[test]
    fn test_explicit_deny() {
        let toml = r#"
            [[rules]]
            id = "no-deletes"
            description = "Nobody deletes through the mesh"
            action = "delete"
            verdict = "deny"
            deny_reason = "deletion is prohibited"
        "#;

        let engine = TomlPolicyEngine::from_toml_str(toml).unwrap();
        let decision = engine.decide(&query("id://dom/x", "id://dom/y", "delete"));
        assert_eq!(decision, PolicyDecision::deny("deletion is prohibited"));
    }

    #[test]
    fn test_deny_rule_without_reason_names_the_rule() {
        let toml = r#"
            [[rules]]
            id = "quarantine"
            caller = "id://dom/untrusted/*"
            verdict = "deny"
        "#;

        let engine = TomlPolicyEngine::from_toml_str(toml).unwrap();
        let decision = engine.decide(&query("id://dom/untrusted/a", "id://dom/y", "greet"));
        assert!(decision.denial_reason().contains("quarantine"));
    }

    // ── 4. wildcard and prefix matching ───────────────────────────────────────

    #[test]
    fn test_wildcard_matching() {
        let toml = r#"
            [[rules]]
            id = "agents-search"
            caller = "id://dom/agents/*"
            callee = "*"
            action = "search"
            verdict = "allow"

            [[rules]]
            id = "deny-rest"
            verdict = "deny"
            deny_reason = "only search is open"
        "#;

        let engine = TomlPolicyEngine::from_toml_str(toml).unwrap();

        assert!(engine.decide(&query("id://dom/agents/a", "id://dom/y", "search")).allow);
        assert!(engine.decide(&query("id://dom/agents/b/c", "id://dom/z", "search")).allow);

        let other = engine.decide(&query("id://dom/other", "id://dom/y", "search"));
        assert_eq!(other.denial_reason(), "only search is open");

        let write = engine.decide(&query("id://dom/agents/a", "id://dom/y", "write"));
        assert_eq!(write.denial_reason(), "only search is open");
    }

    // ── 5. first-match wins ───────────────────────────────────────────────────

    #[test]
    fn test_first_match_wins() {
        let toml = r#"
            [[rules]]
            id = "first-allow"
            action = "greet"
            verdict = "allow"

            [[rules]]
            id = "second-deny"
            action = "greet"
            verdict = "deny"
            deny_reason = "this rule should never fire"
        "#;

        let engine = TomlPolicyEngine::from_toml_str(toml).unwrap();
        assert_eq!(
            engine.decide(&query("id://dom/x", "id://dom/y", "greet")),
            PolicyDecision::allow()
        );
    }

    // ── 6. async trait ────────────────────────────────────────────────────────

    #[tokio::test]
    async fn test_decider_trait_matches_decide() {
        let engine = TomlPolicyEngine::from_toml_str(
            r#"
            [[rules]]
            id = "all"
            verdict = "allow"
            "#,
        )
        .unwrap();
        let q = query("id://dom/x", "id://dom/y", "anything");
        assert_eq!(engine.evaluate(&q).await, engine.decide(&q));
    }

    // ── 7. TOML parse error ───────────────────────────────────────────────────

    #[test]
    fn test_toml_parse_error() {
        let result = TomlPolicyEngine::from_toml_str("this is not valid toml ][[[");

        match result {
            Err(TrustlinkError::ConfigError { reason }) => {
                assert!(
                    reason.contains("failed to parse policy TOML"),
                    "expected parse error message, got: {reason}"
                );
            }
            other => panic!("expected ConfigError, got {:?}", other),
        }
    }
}
