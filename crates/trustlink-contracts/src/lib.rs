//! # trustlink-contracts
//!
//! Shared types, wire envelopes, and the error taxonomy for the TRUSTLINK
//! agent-to-agent runtime.
//!
//! All crates in the workspace import from here. No business logic lives in
//! this crate, only data definitions, validation of identity URIs, and
//! error-to-envelope mapping.

pub mod audit;
pub mod call;
pub mod capability;
pub mod discovery;
pub mod error;
pub mod identity;
pub mod policy;
pub mod wire;

#[cfg(test)]
mod tests {
    use super::*;
    use call::{Artifact, CallResult, CallStatus, ErrorKind};
    use error::TrustlinkError;
    use identity::AgentId;
    use policy::{Direction, PolicyContext, PolicyDecision, PolicyQuery};

    // ── AgentId ──────────────────────────────────────────────────────────────

    #[test]
    fn test_agent_id_parses_components() {
        let id = AgentId::parse("spiffe://example.org/agents/billing").unwrap();
        assert_eq!(id.trust_domain(), "example.org");
        assert_eq!(id.path(), "/agents/billing");
        assert_eq!(id.as_str(), "spiffe://example.org/agents/billing");
    }

    #[test]
    fn test_agent_id_accepts_short_form() {
        let id = AgentId::parse("id://dom/x").unwrap();
        assert_eq!(id.trust_domain(), "dom");
        assert_eq!(id.path(), "/x");
    }

    #[test]
    fn test_agent_id_rejects_malformed_values() {
        for bad in [
            "",
            "example.org/agents/x",
            "://example.org/x",
            "spiffe://",
            "spiffe:///x",
            "spiffe://example.org",
            "spiffe://example.org/",
            "spiffe://example.org//x",
            "spiffe://Example.org/x",
            "spiffe://example.org:8443/x",
            "spiffe://user@example.org/x",
            "spiffe://example.org/x?y=1",
            "spiffe://example.org/x#frag",
        ] {
            let err = AgentId::parse(bad).unwrap_err();
            assert!(
                matches!(err, TrustlinkError::InvalidIdentity { .. }),
                "expected InvalidIdentity for {bad:?}, got {err:?}"
            );
        }
    }

    #[test]
    fn test_agent_id_serializes_as_plain_string() {
        let id = AgentId::parse("spiffe://example.org/a").unwrap();
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, "\"spiffe://example.org/a\"");

        let decoded: AgentId = serde_json::from_str(&json).unwrap();
        assert_eq!(decoded, id);

        let bad: Result<AgentId, _> = serde_json::from_str("\"not-an-id\"");
        assert!(bad.is_err());
    }

    // ── PolicyQuery wire shape ───────────────────────────────────────────────

    #[test]
    fn test_policy_query_uses_engine_field_names() {
        let query = PolicyQuery {
            caller: AgentId::parse("id://dom/x").unwrap(),
            callee: AgentId::parse("id://dom/y").unwrap(),
            action: "greet".to_string(),
            context: PolicyContext {
                trace_id: "t-1".to_string(),
                direction: Direction::Outbound,
                attributes: serde_json::Value::Null,
            },
        };

        let value = serde_json::to_value(&query).unwrap();
        assert_eq!(value["caller_spiffe_id"], "id://dom/x");
        assert_eq!(value["callee_spiffe_id"], "id://dom/y");
        assert_eq!(value["action"], "greet");
        assert_eq!(value["context"]["direction"], "outbound");
    }

    #[test]
    fn test_denial_reason_falls_back_when_engine_gives_none() {
        let decision = PolicyDecision {
            allow: false,
            reason: None,
        };
        assert_eq!(decision.denial_reason(), "denied by policy");
        assert_eq!(PolicyDecision::deny("nope").denial_reason(), "nope");
    }

    // ── CallResult envelope ──────────────────────────────────────────────────

    #[test]
    fn test_call_result_statuses_serialize_snake_case() {
        let done = CallResult::completed(vec![Artifact::json(serde_json::json!({"ok": true}))]);
        let value = serde_json::to_value(&done).unwrap();
        assert_eq!(value["status"], "completed");
        assert!(value.get("error").is_none());

        let rejected = CallResult::rejected("caller not on allow list");
        let value = serde_json::to_value(&rejected).unwrap();
        assert_eq!(value["status"], "rejected");
        assert_eq!(value["error"]["kind"], "PolicyDenied");
        assert_eq!(value["error"]["message"], "caller not on allow list");
    }

    #[test]
    fn test_timeout_envelope_reads_timeout() {
        let result = TrustlinkError::Timeout { after_ms: 2000 }.into_call_result();
        assert_eq!(result.status, CallStatus::Failed);
        assert_eq!(result.error_kind(), Some(ErrorKind::Timeout));
        assert_eq!(result.error.unwrap().message, "Timeout");
    }

    // ── TrustlinkError mapping ───────────────────────────────────────────────

    #[test]
    fn test_handler_errors_are_scrubbed_for_the_wire() {
        let err = TrustlinkError::InternalHandlerError {
            reason: "db password rejected for user admin".to_string(),
        };
        let result = err.into_call_result();
        assert_eq!(result.status, CallStatus::Failed);
        let error = result.error.unwrap();
        assert_eq!(error.kind, ErrorKind::InternalHandlerError);
        assert_eq!(error.message, "internal error");
    }

    #[test]
    fn test_engine_outage_maps_to_rejection() {
        let err = TrustlinkError::PolicyEngineUnreachable {
            reason: "connection refused (127.0.0.1:8181)".to_string(),
        };
        let result = err.into_call_result();
        assert_eq!(result.status, CallStatus::Rejected);
        assert!(!result.error.unwrap().message.contains("127.0.0.1"));
    }

    #[test]
    fn test_only_connect_failures_are_retryable() {
        let connect = TrustlinkError::ConnectFailed {
            destination: "id://dom/y".to_string(),
            reason: "connection refused".to_string(),
        };
        assert!(connect.is_retryable());
        assert!(connect.trips_breaker());

        let mismatch = TrustlinkError::IdentityMismatch {
            expected: "id://dom/y".to_string(),
            presented: "id://dom/z".to_string(),
        };
        assert!(!mismatch.is_retryable());
        assert!(!mismatch.trips_breaker());

        let broken = TrustlinkError::Transport {
            reason: "connection reset".to_string(),
        };
        assert!(!broken.is_retryable());
        assert!(broken.trips_breaker());

        assert!(!TrustlinkError::UnknownCapability { name: "x".to_string() }.is_retryable());
    }

    #[test]
    fn test_local_payload_refusal_never_trips_breaker() {
        let oversized = TrustlinkError::InvalidPayload {
            reason: "frame of 9437200 bytes exceeds 8388608 byte limit".to_string(),
        };
        assert!(!oversized.trips_breaker());
        assert!(!oversized.is_retryable());
        assert_eq!(oversized.kind(), ErrorKind::InvalidPayload);

        let closed = TrustlinkError::ChannelClosed {
            reason: "broken pipe".to_string(),
        };
        assert!(closed.trips_breaker());
        assert_eq!(closed.kind(), ErrorKind::Transport);
    }

    #[test]
    fn test_error_display_messages() {
        let err = TrustlinkError::DuplicateCapability {
            name: "search".to_string(),
        };
        assert!(err.to_string().contains("search"));
        assert!(err.to_string().contains("already registered"));

        let err = TrustlinkError::CircuitOpen {
            destination: "id://dom/y".to_string(),
            retry_after_ms: 1500,
        };
        assert!(err.to_string().contains("circuit open"));
        assert!(err.to_string().contains("1500ms"));
    }
}
