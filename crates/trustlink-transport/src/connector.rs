//! Outbound mTLS connections.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rustls::pki_types::ServerName;
use tokio::net::TcpStream;
use tokio_rustls::client::TlsStream;
use tracing::debug;

use trustlink_contracts::{
    call::CallResult,
    error::{TrustlinkError, TrustlinkResult},
    identity::AgentId,
    wire::WireRequest,
};
use trustlink_core::traits::{Channel, Connector};
use trustlink_identity::peer_identity;

use crate::codec::{read_frame, write_frame};
use crate::directory::StaticPeerDirectory;
use crate::tls::TlsContext;

/// SNI sent when the trust domain is not a valid DNS name.
const FALLBACK_SERVER_NAME: &str = "peer.trustlink.invalid";

pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(2);

/// Dials peers listed in a `StaticPeerDirectory` over mutual TLS.
pub struct TlsConnector {
    tls: Arc<TlsContext>,
    peers: Arc<StaticPeerDirectory>,
    connect_timeout: Duration,
}

impl TlsConnector {
    pub fn new(tls: Arc<TlsContext>, peers: Arc<StaticPeerDirectory>) -> Self {
        Self {
            tls,
            peers,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
        }
    }

    /// Bound on dial plus handshake.
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }
}

#[async_trait]
impl Connector for TlsConnector {
    async fn connect(&self, target: &AgentId) -> TrustlinkResult<Box<dyn Channel>> {
        let address = self.peers.resolve(target)?.to_string();
        let config = self.tls.client()?;
        let server_name = ServerName::try_from(target.trust_domain().to_string())
            .or_else(|_| ServerName::try_from(FALLBACK_SERVER_NAME))
            .map_err(|e| TrustlinkError::Tls {
                reason: format!("no usable server name: {}", e),
            })?;

        let failed = |reason: String| TrustlinkError::ConnectFailed {
            destination: target.to_string(),
            reason,
        };

        let handshake = async {
            let tcp = TcpStream::connect(&address)
                .await
                .map_err(|e| failed(format!("dial {}: {}", address, e)))?;
            let _ = tcp.set_nodelay(true);
            tokio_rustls::TlsConnector::from(config)
                .connect(server_name, tcp)
                .await
                .map_err(|e| failed(format!("TLS handshake with {}: {}", address, e)))
        };

        let stream = tokio::time::timeout(self.connect_timeout, handshake)
            .await
            .map_err(|_| {
                failed(format!(
                    "no handshake with {} within {}ms",
                    address,
                    self.connect_timeout.as_millis()
                ))
            })??;

        let presented = stream
            .get_ref()
            .1
            .peer_certificates()
            .and_then(|chain| chain.first())
            .ok_or_else(|| failed("peer presented no certificate".to_string()))
            .and_then(|cert| {
                peer_identity(cert.as_ref()).map_err(|e| TrustlinkError::IdentityMismatch {
                    expected: target.to_string(),
                    presented: format!("<unusable certificate: {}>", e),
                })
            })?;

        debug!(target = %target, presented = %presented, address = %address, "mTLS channel established");
        Ok(Box::new(TlsChannel {
            peer: presented,
            stream,
        }))
    }
}

/// One authenticated connection to a peer, carrying one exchange at a time.
pub struct TlsChannel {
    peer: AgentId,
    stream: TlsStream<TcpStream>,
}

#[async_trait]
impl Channel for TlsChannel {
    fn peer(&self) -> &AgentId {
        &self.peer
    }

    async fn call(&mut self, request: &WireRequest) -> TrustlinkResult<CallResult> {
        write_frame(&mut self.stream, request).await?;
        read_frame(&mut self.stream)
            .await?
            .ok_or_else(|| TrustlinkError::ChannelClosed {
                reason: format!("{} closed the connection", self.peer),
            })
    }
}
