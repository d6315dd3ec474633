//! HTTP policy decision client.
//!
//! Talks to an OPA-style data API:
//!
//! ```text
//! POST <endpoint>
//! {"input": {"caller_spiffe_id": ..., "callee_spiffe_id": ..., "action": ..., "context": {...}}}
//!
//! 200 {"result": {"allow": true}}
//! 200 {"result": {"allow": false, "reason": "..."}}
//! 200 {"result": false}
//! ```
//!
//! The client fails closed. Any failure to obtain a well-formed answer
//! (timeout, refused connection, non-2xx status, unparseable body, undefined
//! result) is a deny. Only genuine engine answers are cached.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, error};

use trustlink_contracts::{
    error::{TrustlinkError, TrustlinkResult},
    identity::AgentId,
    policy::{Direction, PolicyContext, PolicyDecision, PolicyQuery},
};
use trustlink_core::traits::PolicyDecider;

use crate::cache::DecisionCache;

/// Action name used by the startup reachability probe.
pub const PROBE_ACTION: &str = "trustlink.probe";

/// Reason reported for decisions the engine never made.
const ENGINE_UNAVAILABLE: &str = "denied: policy engine unavailable";

/// Connection settings for the remote engine.
#[derive(Debug, Clone)]
pub struct HttpPolicyConfig {
    /// Full decision URL, e.g. `http://127.0.0.1:8181/v1/data/a2a/decision`.
    pub endpoint: String,
    /// Per-request deadline.
    pub timeout: Duration,
    /// Decision cache TTL; zero disables caching.
    pub cache_ttl: Duration,
}

impl HttpPolicyConfig {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            timeout: Duration::from_millis(500),
            cache_ttl: Duration::ZERO,
        }
    }
}

#[derive(Serialize)]
struct EngineRequest<'a> {
    input: &'a PolicyQuery,
}

#[derive(Deserialize)]
struct EngineResponse {
    result: Option<EngineResult>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum EngineResult {
    Bool(bool),
    Decision(PolicyDecision),
}

/// Client for an external policy engine.
#[derive(Debug)]
pub struct HttpPolicyClient {
    endpoint: String,
    client: reqwest::Client,
    cache: Option<DecisionCache>,
}

impl HttpPolicyClient {
    /// Build a client.
    ///
    /// Returns `ConfigError` if the endpoint is not an http(s) URL or the
    /// HTTP client cannot be constructed.
    pub fn new(config: HttpPolicyConfig) -> TrustlinkResult<Self> {
        if !(config.endpoint.starts_with("http://") || config.endpoint.starts_with("https://")) {
            return Err(TrustlinkError::ConfigError {
                reason: format!("policy endpoint '{}' is not an http(s) URL", config.endpoint),
            });
        }

        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .connect_timeout(config.timeout)
            .build()
            .map_err(|e| TrustlinkError::ConfigError {
                reason: format!("failed to build policy HTTP client: {}", e),
            })?;

        let cache = (!config.cache_ttl.is_zero()).then(|| DecisionCache::new(config.cache_ttl));

        Ok(Self {
            endpoint: config.endpoint,
            client,
            cache,
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    pub fn cache(&self) -> Option<&DecisionCache> {
        self.cache.as_ref()
    }

    /// Ask the engine, surfacing why no decision could be obtained.
    ///
    /// # Errors
    ///
    /// `PolicyEngineUnreachable` for every failure mode. Callers that need a
    /// decision regardless should use `PolicyDecider::evaluate`, which turns
    /// this error into a deny.
    pub async fn try_evaluate(&self, query: &PolicyQuery) -> TrustlinkResult<PolicyDecision> {
        if let Some(decision) = self.cache.as_ref().and_then(|c| c.get(query)) {
            debug!(action = %query.action, "policy decision served from cache");
            return Ok(decision);
        }

        let decision = self.request(query).await?;

        if let Some(cache) = &self.cache {
            cache.insert(query, &decision);
        }
        Ok(decision)
    }

    async fn request(&self, query: &PolicyQuery) -> TrustlinkResult<PolicyDecision> {
        let engine_down = |reason: String| TrustlinkError::PolicyEngineUnreachable { reason };

        let response = self
            .client
            .post(self.endpoint.as_str())
            .json(&EngineRequest { input: query })
            .send()
            .await
            .map_err(|e| engine_down(format!("request to {} failed: {}", self.endpoint, e)))?;

        let status = response.status();
        if !status.is_success() {
            return Err(engine_down(format!("engine answered HTTP {}", status)));
        }

        let body: EngineResponse = response
            .json()
            .await
            .map_err(|e| engine_down(format!("malformed engine response: {}", e)))?;

        match body.result {
            Some(EngineResult::Decision(decision)) => Ok(decision),
            Some(EngineResult::Bool(true)) => Ok(PolicyDecision::allow()),
            Some(EngineResult::Bool(false)) => Ok(PolicyDecision {
                allow: false,
                reason: None,
            }),
            None => Err(engine_down("engine returned an undefined result".to_string())),
        }
    }

    /// Check that the engine answers at all.
    ///
    /// Sends a synthetic query on behalf of `local`. The answer itself is
    /// ignored: allow and deny both prove the engine is up.
    pub async fn probe(&self, local: &AgentId) -> TrustlinkResult<()> {
        let query = PolicyQuery {
            caller: local.clone(),
            callee: local.clone(),
            action: PROBE_ACTION.to_string(),
            context: PolicyContext {
                trace_id: "startup-probe".to_string(),
                direction: Direction::Outbound,
                attributes: Value::Null,
            },
        };
        self.request(&query).await.map(|_| ())
    }
}

#[async_trait]
impl PolicyDecider for HttpPolicyClient {
    async fn evaluate(&self, query: &PolicyQuery) -> PolicyDecision {
        match self.try_evaluate(query).await {
            Ok(decision) => decision,
            Err(e) => {
                error!(
                    trace_id = %query.context.trace_id,
                    caller = %query.caller,
                    callee = %query.callee,
                    action = %query.action,
                    error = %e,
                    "policy engine unreachable, failing closed"
                );
                PolicyDecision::deny(ENGINE_UNAVAILABLE)
            }
        }
    }
}

// ── Tests ────────────────────────────────────────────────────────────────────
