//! Agent configuration.
//!
//! Loaded once from TOML at startup, validated, then treated as immutable.
//! Every section except `[agent]`, `[identity]` and `[policy]` may be
//! omitted and falls back to the defaults below.

use std::collections::HashSet;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use trustlink_contracts::{
    capability::CapabilityDescriptor,
    error::{TrustlinkError, TrustlinkResult},
    identity::AgentId,
};
use trustlink_core::{BreakerConfig, DispatchSettings, PoolConfig, RetryPolicy};
use trustlink_policy::{HttpPolicyConfig, MAX_CACHE_TTL};
use trustlink_transport::{StaticPeerDirectory, TlsVersion};

fn invalid(reason: impl Into<String>) -> TrustlinkError {
    TrustlinkError::ConfigError {
        reason: reason.into(),
    }
}

// ── Sections ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AgentSection {
    /// Operator-facing name, advertised in the discovery document.
    pub name: String,
    /// The identity issued to this agent must belong to this domain.
    pub trust_domain: String,
    /// mTLS listener for peer calls.
    pub listen_addr: SocketAddr,
    /// Plain HTTP listener for the discovery document; omitted = not served.
    #[serde(default)]
    pub discovery_addr: Option<SocketAddr>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct IdentitySection {
    pub cert_path: PathBuf,
    pub key_path: PathBuf,
    pub bundle_path: PathBuf,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PolicyMode {
    /// External engine over HTTP.
    #[default]
    Remote,
    /// Rules file evaluated in process.
    Local,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PolicySection {
    #[serde(default)]
    pub mode: PolicyMode,
    #[serde(default)]
    pub endpoint: Option<String>,
    #[serde(default = "default_policy_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default)]
    pub cache_ttl_ms: u64,
    #[serde(default)]
    pub rules_path: Option<PathBuf>,
}

fn default_policy_timeout_ms() -> u64 {
    500
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TransportSection {
    pub min_tls_version: TlsVersion,
    pub connect_timeout_ms: u64,
    pub idle_timeout_secs: u64,
    pub max_idle_per_peer: usize,
    pub drain_grace_ms: u64,
}

impl Default for TransportSection {
    fn default() -> Self {
        Self {
            min_tls_version: TlsVersion::Tls13,
            connect_timeout_ms: 2_000,
            idle_timeout_secs: 90,
            max_idle_per_peer: 8,
            drain_grace_ms: 30_000,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BreakerSection {
    pub failure_threshold: u32,
    pub cooldown_secs: u64,
    pub failure_window_secs: u64,
}

impl Default for BreakerSection {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            cooldown_secs: 30,
            failure_window_secs: 60,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RetrySection {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub multiplier: f64,
}

impl Default for RetrySection {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 100,
            multiplier: 2.0,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TimeoutSection {
    pub default_call_ms: u64,
}

impl Default for TimeoutSection {
    fn default() -> Self {
        Self {
            default_call_ms: 10_000,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PeerEntry {
    pub id: AgentId,
    pub address: String,
}

// ── Root ──────────────────────────────────────────────────────────────────────

/// The whole configuration file.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AgentConfig {
    pub agent: AgentSection,
    pub identity: IdentitySection,
    pub policy: PolicySection,
    #[serde(default)]
    pub transport: TransportSection,
    #[serde(default)]
    pub breaker: BreakerSection,
    #[serde(default)]
    pub retry: RetrySection,
    #[serde(default)]
    pub timeouts: TimeoutSection,
    #[serde(default)]
    pub capabilities: Vec<CapabilityDescriptor>,
    #[serde(default)]
    pub peers: Vec<PeerEntry>,
}

impl AgentConfig {
    /// Parse and validate a TOML document.
    pub fn from_toml_str(s: &str) -> TrustlinkResult<Self> {
        let config: Self =
            toml::from_str(s).map_err(|e| invalid(format!("failed to parse agent TOML: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> TrustlinkResult<Self> {
        let contents = std::fs::read_to_string(path).map_err(|e| {
            invalid(format!("failed to read config file '{}': {}", path.display(), e))
        })?;
        Self::from_toml_str(&contents)
    }

    /// Check every cross-field constraint the types cannot express.
    pub fn validate(&self) -> TrustlinkResult<()> {
        if self.agent.name.trim().is_empty() {
            return Err(invalid("agent.name must not be empty"));
        }

        let probe = format!("spiffe://{}/agent", self.agent.trust_domain);
        match AgentId::parse(&probe) {
            Ok(id) if id.trust_domain() == self.agent.trust_domain => {}
            _ => {
                return Err(invalid(format!(
                    "agent.trust_domain '{}' is not a valid trust domain",
                    self.agent.trust_domain
                )))
            }
        }

        self.validate_policy()?;

        let t = &self.transport;
        if t.connect_timeout_ms == 0 {
            return Err(invalid("transport.connect_timeout_ms must be positive"));
        }
        if t.idle_timeout_secs == 0 {
            return Err(invalid("transport.idle_timeout_secs must be positive"));
        }

        let b = &self.breaker;
        if b.failure_threshold == 0 {
            return Err(invalid("breaker.failure_threshold must be at least 1"));
        }
        if b.cooldown_secs == 0 || b.failure_window_secs == 0 {
            return Err(invalid("breaker.cooldown_secs and breaker.failure_window_secs must be positive"));
        }

        if self.retry.max_attempts == 0 {
            return Err(invalid("retry.max_attempts must be at least 1"));
        }
        if self.retry.multiplier.is_nan() || self.retry.multiplier < 1.0 {
            return Err(invalid("retry.multiplier must be at least 1"));
        }

        if self.timeouts.default_call_ms == 0 {
            return Err(invalid("timeouts.default_call_ms must be positive"));
        }

        let mut names = HashSet::new();
        for capability in &self.capabilities {
            if capability.name.trim().is_empty() {
                return Err(invalid("capability name must not be empty"));
            }
            if !names.insert(capability.name.as_str()) {
                return Err(invalid(format!(
                    "capability '{}' is declared more than once",
                    capability.name
                )));
            }
        }

        let mut peers = HashSet::new();
        for peer in &self.peers {
            if peer.address.trim().is_empty() {
                return Err(invalid(format!("peer '{}' has an empty address", peer.id)));
            }
            if !peers.insert(&peer.id) {
                return Err(invalid(format!("peer '{}' is listed more than once", peer.id)));
            }
        }

        Ok(())
    }

    fn validate_policy(&self) -> TrustlinkResult<()> {
        let p = &self.policy;
        match p.mode {
            PolicyMode::Remote => {
                let endpoint = p
                    .endpoint
                    .as_deref()
                    .ok_or_else(|| invalid("policy.endpoint is required in remote mode"))?;
                if !(endpoint.starts_with("http://") || endpoint.starts_with("https://")) {
                    return Err(invalid(format!(
                        "policy.endpoint '{}' is not an http(s) URL",
                        endpoint
                    )));
                }
            }
            PolicyMode::Local => {
                if p.rules_path.is_none() {
                    return Err(invalid("policy.rules_path is required in local mode"));
                }
            }
        }

        if p.timeout_ms == 0 {
            return Err(invalid("policy.timeout_ms must be positive"));
        }
        if Duration::from_millis(p.cache_ttl_ms) > MAX_CACHE_TTL {
            return Err(invalid(format!(
                "policy.cache_ttl_ms must not exceed {}",
                MAX_CACHE_TTL.as_millis()
            )));
        }
        Ok(())
    }

    // ── Derived settings ─────────────────────────────────────────────────────

    pub fn http_policy_config(&self) -> TrustlinkResult<HttpPolicyConfig> {
        let endpoint = self
            .policy
            .endpoint
            .clone()
            .ok_or_else(|| invalid("policy.endpoint is required in remote mode"))?;
        Ok(HttpPolicyConfig {
            endpoint,
            timeout: Duration::from_millis(self.policy.timeout_ms),
            cache_ttl: Duration::from_millis(self.policy.cache_ttl_ms),
        })
    }

    pub fn breaker_config(&self) -> BreakerConfig {
        BreakerConfig {
            failure_threshold: self.breaker.failure_threshold,
            cooldown: Duration::from_secs(self.breaker.cooldown_secs),
            failure_window: Duration::from_secs(self.breaker.failure_window_secs),
        }
    }

    pub fn pool_config(&self) -> PoolConfig {
        PoolConfig {
            max_idle_per_peer: self.transport.max_idle_per_peer,
            idle_timeout: Duration::from_secs(self.transport.idle_timeout_secs),
            breaker: self.breaker_config(),
        }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.retry.max_attempts,
            base_delay: Duration::from_millis(self.retry.base_delay_ms),
            multiplier: self.retry.multiplier,
            ..RetryPolicy::default()
        }
    }

    pub fn dispatch_settings(&self) -> DispatchSettings {
        DispatchSettings {
            default_timeout: Duration::from_millis(self.timeouts.default_call_ms),
            drain_grace: Duration::from_millis(self.transport.drain_grace_ms),
        }
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.transport.connect_timeout_ms)
    }

    pub fn peer_directory(&self) -> StaticPeerDirectory {
        self.peers
            .iter()
            .map(|peer| (peer.id.clone(), peer.address.clone()))
            .collect()
    }
}

// ── Tests ────────────────────────────────────────────────────────────────────
