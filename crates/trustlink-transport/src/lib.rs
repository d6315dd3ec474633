//! # trustlink-transport
//!
//! Mutually authenticated transport between TRUSTLINK agents.
//!
//! - `tls`: rustls client and server configurations built from the held
//!   identity document, rebuilt when the identity rotates
//! - `connector`: `TlsConnector`, the `Connector` the connection manager
//!   dials through
//! - `listener`: `TlsListener`, one task per inbound connection feeding the
//!   dispatcher
//! - `codec`: 4-byte big-endian length prefix + JSON frames
//! - `directory`: static identity to address map
//!
//! Peers are identified only by the URI SAN of the certificate they present.
//! The outbound side compares it to the dialled identity (in the connection
//! manager); the inbound side hands it to the dispatcher as the caller.

pub mod codec;
pub mod connector;
pub mod directory;
pub mod listener;
pub mod tls;

pub use codec::{read_frame, write_frame};
pub use connector::{TlsChannel, TlsConnector, DEFAULT_CONNECT_TIMEOUT};
pub use directory::StaticPeerDirectory;
pub use listener::{TlsListener, DEFAULT_HANDSHAKE_TIMEOUT};
pub use tls::{client_config, server_config, TlsContext, TlsVersion};

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use std::net::SocketAddr;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    use async_trait::async_trait;
    use rcgen::{
        string::Ia5String, BasicConstraints, CertificateParams, DnType, IsCa, Issuer, KeyPair,
        SanType,
    };
    use serde_json::{json, Value};
    use tokio::sync::watch;
    use tokio::task::JoinHandle;
    use zeroize::Zeroizing;

    use trustlink_contracts::{
        audit::AuthorizationRecord,
        call::{Artifact, ErrorKind},
        error::{TrustlinkError, TrustlinkResult},
        identity::AgentId,
        policy::{PolicyDecision, PolicyQuery},
        wire::WireRequest,
    };
    use trustlink_core::traits::{AuditWriter, Connector, PolicyDecider};
    use trustlink_core::{
        handler_fn, BreakerState, Capability, CapabilityRegistry, ConnectionManager, Dispatcher, PoolConfig,
        RegistryBuilder, RetryPolicy,
    };
    use trustlink_identity::{IdentityClient, IdentityDocument, IdentityFetcher};

    use super::*;

    // ── PKI ───────────────────────────────────────────────────────────────────

    struct TestCa {
        key: KeyPair,
        pem: String,
    }

    impl TestCa {
        fn new(name: &str) -> Self {
            let key = KeyPair::generate().unwrap();
            let mut params = CertificateParams::default();
            params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
            params.distinguished_name.push(DnType::CommonName, name);
            let pem = params.self_signed(&key).unwrap().pem();
            Self { key, pem }
        }

        /// An SVID for `uri` signed by this CA, trusting `bundle`.
        fn issue_trusting(&self, uri: &str, bundle: &str) -> IdentityDocument {
            let leaf_key = KeyPair::generate().unwrap();
            let mut params = CertificateParams::default();
            params.subject_alt_names =
                vec![SanType::URI(Ia5String::try_from(uri.to_string()).unwrap())];
            let issuer = Issuer::from_ca_cert_pem(&self.pem, &self.key).unwrap();
            let chain = params.signed_by(&leaf_key, &issuer).unwrap().pem();

            IdentityDocument::from_pem(
                chain,
                Zeroizing::new(leaf_key.serialize_pem()),
                bundle.to_string(),
            )
            .unwrap()
        }

        fn issue(&self, uri: &str) -> IdentityDocument {
            self.issue_trusting(uri, &self.pem)
        }
    }

    // ── Mocks ─────────────────────────────────────────────────────────────────

    struct NoRefresh;

    #[async_trait]
    impl IdentityFetcher for NoRefresh {
        async fn fetch_identity(&self) -> TrustlinkResult<IdentityDocument> {
            Err(TrustlinkError::IdentityUnavailable {
                reason: "no provider in tests".to_string(),
            })
        }
    }

    #[derive(Default)]
    struct AllowAll {
        queries: Mutex<Vec<PolicyQuery>>,
    }

    #[async_trait]
    impl PolicyDecider for AllowAll {
        async fn evaluate(&self, query: &PolicyQuery) -> PolicyDecision {
            self.queries.lock().unwrap().push(query.clone());
            PolicyDecision::allow()
        }
    }

    struct NullAudit;

    impl AuditWriter for NullAudit {
        fn write(&self, _record: &AuthorizationRecord) -> TrustlinkResult<()> {
            Ok(())
        }
    }

    // ── Fixture ───────────────────────────────────────────────────────────────

    const X: &str = "spiffe://example.org/agents/x";
    const Y: &str = "spiffe://example.org/agents/y";

    fn id(s: &str) -> AgentId {
        AgentId::parse(s).unwrap()
    }

    fn tls_for(document: IdentityDocument) -> (Arc<IdentityClient>, Arc<TlsContext>) {
        let identity = Arc::new(IdentityClient::with_document(Arc::new(NoRefresh), document));
        let tls = Arc::new(TlsContext::new(identity.clone(), TlsVersion::Tls13));
        (identity, tls)
    }

    fn greeter(calls: Arc<AtomicU32>) -> CapabilityRegistry {
        let greet = handler_fn(move |payload: Value| {
            calls.fetch_add(1, Ordering::SeqCst);
            async move {
                let name = payload["name"].as_str().unwrap_or("stranger").to_string();
                Ok(vec![Artifact::json(json!({ "message": format!("Hello, {name}!") }))])
            }
        });
        let mut builder = RegistryBuilder::new();
        builder.register(Capability::new("greet", greet)).unwrap();
        builder.build()
    }

    fn dispatcher(
        document: IdentityDocument,
        peers: StaticPeerDirectory,
        registry: CapabilityRegistry,
        policy: Arc<AllowAll>,
    ) -> (Arc<Dispatcher>, Arc<TlsContext>) {
        let (identity, tls) = tls_for(document);
        let connector = TlsConnector::new(tls.clone(), Arc::new(peers));
        let pool = Arc::new(ConnectionManager::new(Arc::new(connector), PoolConfig::default()));
        let dispatcher = Dispatcher::new(identity, policy, registry, pool, Arc::new(NullAudit))
            .with_retry(RetryPolicy::single_attempt());
        (Arc::new(dispatcher), tls)
    }

    struct Server {
        addr: SocketAddr,
        policy: Arc<AllowAll>,
        handler_calls: Arc<AtomicU32>,
        shutdown: watch::Sender<bool>,
        task: JoinHandle<()>,
    }

    /// Agent y, listening on an ephemeral port.
    async fn serve_y(ca: &TestCa) -> Server {
        serve_y_at(ca, "127.0.0.1:0").await
    }

    async fn serve_y_at(ca: &TestCa, addr: &str) -> Server {
        let handler_calls = Arc::new(AtomicU32::new(0));
        let policy = Arc::new(AllowAll::default());
        let (dispatcher, tls) = dispatcher(
            ca.issue(Y),
            StaticPeerDirectory::new(),
            greeter(handler_calls.clone()),
            policy.clone(),
        );

        let listener = TlsListener::bind(addr, tls, dispatcher).await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (shutdown, rx) = watch::channel(false);
        let task = tokio::spawn(listener.serve(rx));

        Server {
            addr,
            policy,
            handler_calls,
            shutdown,
            task,
        }
    }

    fn directory(entries: &[(&str, SocketAddr)]) -> StaticPeerDirectory {
        entries
            .iter()
            .map(|(peer, addr)| (id(peer), addr.to_string()))
            .collect()
    }

    // ── Tests ─────────────────────────────────────────────────────────────────

    #[tokio::test]
    async fn test_greet_over_mtls() {
        let ca = TestCa::new("example.org ca");
        let server = serve_y(&ca).await;

        let (x, _) = dispatcher(
            ca.issue(X),
            directory(&[(Y, server.addr)]),
            RegistryBuilder::new().build(),
            Arc::new(AllowAll::default()),
        );

        let result = x.call(Y, "greet", json!({ "name": "x" }), None).await;
        assert!(result.is_completed(), "{:?}", result.error);
        assert_eq!(result.artifacts[0].data["message"], "Hello, x!");

        // The callee saw the caller's certificate identity.
        let queries = server.policy.queries.lock().unwrap().clone();
        assert_eq!(queries.len(), 1);
        assert_eq!(queries[0].caller, id(X));
        assert_eq!(queries[0].callee, id(Y));
        assert_eq!(queries[0].action, "greet");

        // A second call rides the pooled connection.
        let again = x.call(Y, "greet", json!({ "name": "x" }), None).await;
        assert!(again.is_completed());
        assert_eq!(x.connections().connect_attempts(), 1);
        assert_eq!(server.handler_calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_call_after_peer_restart_uses_a_fresh_connection() {
        let ca = TestCa::new("example.org ca");
        let server = serve_y(&ca).await;

        let (x, _) = dispatcher(
            ca.issue(X),
            directory(&[(Y, server.addr)]),
            RegistryBuilder::new().build(),
            Arc::new(AllowAll::default()),
        );
        let first = x.call(Y, "greet", json!({ "name": "x" }), None).await;
        assert!(first.is_completed(), "{:?}", first.error);
        assert_eq!(x.connections().idle_count(&id(Y)), 1);

        // y goes away, closing the pooled connection, and comes back on the
        // same address.
        server.shutdown.send(true).unwrap();
        server.task.await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        let restarted = serve_y_at(&ca, &server.addr.to_string()).await;

        let second = x.call(Y, "greet", json!({ "name": "x" }), None).await;
        assert!(second.is_completed(), "{:?}", second.error);
        assert_eq!(second.artifacts[0].data["message"], "Hello, x!");
        assert_eq!(x.connections().connect_attempts(), 2);
        assert_eq!(restarted.handler_calls.load(Ordering::SeqCst), 1);
        assert_eq!(x.connections().breaker_state(&id(Y)), BreakerState::Closed);
    }

    #[tokio::test]
    async fn test_wrong_peer_identity_is_mismatch() {
        let ca = TestCa::new("example.org ca");
        let server = serve_y(&ca).await;

        let z = "spiffe://example.org/agents/z";
        let (x, _) = dispatcher(
            ca.issue(X),
            directory(&[(z, server.addr)]),
            RegistryBuilder::new().build(),
            Arc::new(AllowAll::default()),
        );

        let result = x.call(z, "greet", json!({}), None).await;
        assert_eq!(result.error_kind(), Some(ErrorKind::IdentityMismatch));
        assert_eq!(server.handler_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_server_outside_trust_bundle_is_refused() {
        let ca = TestCa::new("example.org ca");
        let rogue = TestCa::new("rogue ca");
        let server = serve_y(&ca).await;

        let (_, tls) = tls_for(rogue.issue(X));
        let connector = TlsConnector::new(tls, Arc::new(directory(&[(Y, server.addr)])));

        let result = connector.connect(&id(Y)).await;
        assert!(matches!(result, Err(TrustlinkError::ConnectFailed { .. })));
    }

    #[tokio::test]
    async fn test_client_outside_trust_bundle_is_refused() {
        let ca = TestCa::new("example.org ca");
        let rogue = TestCa::new("rogue ca");
        let server = serve_y(&ca).await;

        // Trusts the real CA, but holds a certificate the server cannot verify.
        let (_, tls) = tls_for(rogue.issue_trusting(X, &ca.pem));
        let connector = TlsConnector::new(tls, Arc::new(directory(&[(Y, server.addr)])));

        let request = WireRequest {
            action: "greet".to_string(),
            payload: json!({}),
            trace_id: "t-rogue".to_string(),
            timeout_ms: None,
        };
        let outcome = match connector.connect(&id(Y)).await {
            Err(e) => Err(e),
            Ok(mut channel) => channel.call(&request).await,
        };

        assert!(outcome.is_err());
        assert_eq!(server.handler_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_unknown_peer_has_no_address() {
        let ca = TestCa::new("example.org ca");
        let (_, tls) = tls_for(ca.issue(X));
        let connector = TlsConnector::new(tls, Arc::new(StaticPeerDirectory::new()));

        let result = connector.connect(&id(Y)).await;
        assert!(matches!(result, Err(TrustlinkError::UnknownPeer { .. })));
    }

    #[tokio::test]
    async fn test_listener_stops_on_shutdown() {
        let ca = TestCa::new("example.org ca");
        let server = serve_y(&ca).await;

        server.shutdown.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(5), server.task)
            .await
            .expect("listener did not stop")
            .unwrap();
    }
}
