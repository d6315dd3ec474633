//! Startup and shutdown of one agent.
//!
//! Startup order:
//!
//!   Config → Identity → Trust domain check → Policy (probed) → Registry →
//!   Dispatcher → mTLS listener + discovery endpoint → refresh + reaper
//!
//! Any failure before the listeners open aborts startup. Shutdown runs the
//! listeners, the discovery endpoint and the background tasks down in that
//! order, then drains the connection pool.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use trustlink_audit::TracingAuditWriter;
use trustlink_contracts::{
    capability::CapabilityDescriptor,
    discovery::{DiscoveryDocument, TransportRequirements},
    error::{TrustlinkError, TrustlinkResult},
    identity::{AgentId, AgentIdentity},
};
use trustlink_core::traits::{IdentityProvider, PolicyDecider};
use trustlink_core::{
    build_discovery, retry_with_backoff, Capability, CapabilityRegistry, ConnectionManager,
    Dispatcher, RegistryBuilder,
};
use trustlink_identity::{FileIdentityFetcher, IdentityClient};
use trustlink_policy::{HttpPolicyClient, TomlPolicyEngine};
use trustlink_transport::{TlsConnector, TlsContext, TlsListener};

use crate::builtin::HandlerSet;
use crate::config::{AgentConfig, PolicyMode};
use crate::discovery::router;

/// Floor on the idle reaper period.
const MIN_REAP_INTERVAL: Duration = Duration::from_secs(1);

// ── Assembly ──────────────────────────────────────────────────────────────────

/// A fully assembled agent that is not yet accepting connections.
///
/// Also usable on its own for outbound-only work (the `call` command).
pub struct AgentRuntime {
    config: AgentConfig,
    identity: Arc<IdentityClient>,
    tls: Arc<TlsContext>,
    dispatcher: Arc<Dispatcher>,
}

impl AgentRuntime {
    /// Run every startup step up to and including the dispatcher.
    ///
    /// # Errors
    ///
    /// - `ConfigError` for invalid configuration, an identity outside the
    ///   configured trust domain, or a declared capability with no handler
    /// - `IdentityUnavailable` when no valid identity document can be loaded
    /// - `PolicyEngineUnreachable` when the remote engine never answers the probe
    /// - `DuplicateCapability`, `Tls` for unusable registry or TLS material
    pub async fn build(config: AgentConfig, handlers: HandlerSet) -> TrustlinkResult<Self> {
        config.validate()?;

        let fetcher = FileIdentityFetcher::new(
            &config.identity.cert_path,
            &config.identity.key_path,
            &config.identity.bundle_path,
        );
        let identity = Arc::new(IdentityClient::bootstrap(Arc::new(fetcher)).await?);
        let local = identity.current()?;

        if local.trust_domain() != config.agent.trust_domain {
            return Err(TrustlinkError::ConfigError {
                reason: format!(
                    "identity '{}' does not belong to trust domain '{}'",
                    local.id, config.agent.trust_domain
                ),
            });
        }

        let policy = build_policy(&config, &local.id).await?;
        let registry = build_registry(&config.capabilities, &handlers)?;

        let tls = Arc::new(TlsContext::new(
            Arc::clone(&identity),
            config.transport.min_tls_version,
        ));
        tls.server()?;

        let connector = TlsConnector::new(Arc::clone(&tls), Arc::new(config.peer_directory()))
            .with_connect_timeout(config.connect_timeout());
        let connections = Arc::new(ConnectionManager::new(
            Arc::new(connector),
            config.pool_config(),
        ));
        let audit = Arc::new(TracingAuditWriter::new(local.id.to_string()));

        let dispatcher = Dispatcher::new(
            Arc::clone(&identity) as Arc<dyn IdentityProvider>,
            policy,
            registry,
            connections,
            audit,
        )
        .with_retry(config.retry_policy())
        .with_settings(config.dispatch_settings());

        info!(
            agent = %config.agent.name,
            identity = %local.id,
            capabilities = dispatcher.registry().len(),
            peers = config.peers.len(),
            "agent assembled"
        );

        Ok(Self {
            config,
            identity,
            tls,
            dispatcher: Arc::new(dispatcher),
        })
    }

    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    pub fn identity(&self) -> TrustlinkResult<AgentIdentity> {
        self.identity.current()
    }

    /// Open the listeners and spawn the background tasks.
    pub async fn start(self) -> TrustlinkResult<RunningAgent> {
        let local = self.identity.current()?;

        let listener = TlsListener::bind(
            &self.config.agent.listen_addr.to_string(),
            Arc::clone(&self.tls),
            Arc::clone(&self.dispatcher),
        )
        .await?;
        let listen_addr = listener.local_addr()?;

        let document = build_discovery(
            &self.config.agent.name,
            &local.id,
            self.dispatcher.registry(),
            TransportRequirements {
                mutual_tls: true,
                min_tls_version: self.config.transport.min_tls_version.to_string(),
                trust_domain: local.trust_domain().to_string(),
                endpoint: Some(listen_addr.to_string()),
            },
        );

        let discovery_listener = match self.config.agent.discovery_addr {
            Some(addr) => Some(TcpListener::bind(addr).await.map_err(|e| {
                TrustlinkError::ConfigError {
                    reason: format!("cannot serve discovery on {}: {}", addr, e),
                }
            })?),
            None => None,
        };

        let (shutdown, shutdown_rx) = watch::channel(false);
        let mut tasks: Vec<(&'static str, JoinHandle<()>)> = Vec::new();

        tasks.push(("mTLS listener", tokio::spawn(listener.serve(shutdown_rx.clone()))));

        let mut discovery_addr = None;
        if let Some(discovery_listener) = discovery_listener {
            let addr = discovery_listener.local_addr().map_err(|e| TrustlinkError::Transport {
                reason: e.to_string(),
            })?;
            let app = router(document.clone());
            let stop = stopped(shutdown_rx.clone());
            tasks.push((
                "discovery endpoint",
                tokio::spawn(async move {
                    if let Err(e) = axum::serve(discovery_listener, app)
                        .with_graceful_shutdown(stop)
                        .await
                    {
                        error!(error = %e, "discovery endpoint failed");
                    }
                }),
            ));
            info!(addr = %addr, "discovery endpoint serving");
            discovery_addr = Some(addr);
        }

        tasks.push((
            "identity refresh",
            tokio::spawn(Arc::clone(&self.identity).refresh_loop(shutdown_rx.clone())),
        ));

        let reap_every = (self.config.pool_config().idle_timeout / 2).max(MIN_REAP_INTERVAL);
        tasks.push((
            "idle reaper",
            tokio::spawn(
                Arc::clone(self.dispatcher.connections()).run_reaper(reap_every, shutdown_rx),
            ),
        ));

        info!(
            agent = %self.config.agent.name,
            identity = %local.id,
            listen_addr = %listen_addr,
            "agent started"
        );

        Ok(RunningAgent {
            dispatcher: self.dispatcher,
            document,
            listen_addr,
            discovery_addr,
            shutdown,
            tasks,
        })
    }
}

async fn build_policy(
    config: &AgentConfig,
    local: &AgentId,
) -> TrustlinkResult<Arc<dyn PolicyDecider>> {
    match config.policy.mode {
        PolicyMode::Remote => {
            let client = HttpPolicyClient::new(config.http_policy_config()?)?;
            let (probe, attempts) = retry_with_backoff(
                &config.retry_policy(),
                "policy engine probe",
                |_: &TrustlinkError| true,
                |_| client.probe(local),
            )
            .await;
            probe?;
            info!(endpoint = %client.endpoint(), attempts, "policy engine reachable");
            Ok(Arc::new(client))
        }
        PolicyMode::Local => {
            let path = config
                .policy
                .rules_path
                .as_deref()
                .ok_or_else(|| TrustlinkError::ConfigError {
                    reason: "policy.rules_path is required in local mode".to_string(),
                })?;
            let engine = TomlPolicyEngine::from_file(path)?;
            info!(rules = engine.rule_count(), path = %path.display(), "local policy rules loaded");
            Ok(Arc::new(engine))
        }
    }
}

/// Bind every declared capability to its handler and freeze the registry.
fn build_registry(
    declared: &[CapabilityDescriptor],
    handlers: &HandlerSet,
) -> TrustlinkResult<CapabilityRegistry> {
    let mut builder = RegistryBuilder::new();
    for descriptor in declared {
        let handler = handlers
            .get(&descriptor.name)
            .ok_or_else(|| TrustlinkError::ConfigError {
                reason: format!(
                    "capability '{}' is declared but no handler is bound to it",
                    descriptor.name
                ),
            })?;
        builder.register(Capability::from_descriptor(descriptor.clone(), handler))?;
    }
    Ok(builder.build())
}

/// Resolves once `shutdown` is true or its sender is gone.
async fn stopped(mut shutdown: watch::Receiver<bool>) {
    while !*shutdown.borrow() {
        if shutdown.changed().await.is_err() {
            break;
        }
    }
}

// ── Running agent ─────────────────────────────────────────────────────────────

/// An agent accepting calls. Dropping it without `shutdown` leaves the
/// spawned tasks running until the runtime exits.
pub struct RunningAgent {
    dispatcher: Arc<Dispatcher>,
    document: DiscoveryDocument,
    listen_addr: SocketAddr,
    discovery_addr: Option<SocketAddr>,
    shutdown: watch::Sender<bool>,
    tasks: Vec<(&'static str, JoinHandle<()>)>,
}

impl RunningAgent {
    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    pub fn discovery_document(&self) -> &DiscoveryDocument {
        &self.document
    }

    /// Bound address of the mTLS listener.
    pub fn listen_addr(&self) -> SocketAddr {
        self.listen_addr
    }

    pub fn discovery_addr(&self) -> Option<SocketAddr> {
        self.discovery_addr
    }

    /// Stop accepting, stop background work, then drain the pool.
    pub async fn shutdown(self) {
        info!(identity = %self.document.identity, "agent shutting down");
        let _ = self.shutdown.send(true);

        for (name, task) in self.tasks {
            match task.await {
                Ok(()) => debug!(task = name, "stopped"),
                Err(e) => error!(task = name, error = %e, "task ended abnormally"),
            }
        }

        let closed = self.dispatcher.connections().shutdown();
        info!(identity = %self.document.identity, closed, "agent stopped");
    }
}

// ── Tests ────────────────────────────────────────────────────────────────────
