//! Inbound mTLS listener.
//!
//! Every accepted connection runs on its own task. The caller's identity is
//! taken from its client certificate once, at handshake time, and passed to
//! the dispatcher with every frame read from that connection.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, error, info, warn};

use trustlink_contracts::{
    error::{TrustlinkError, TrustlinkResult},
    identity::AgentId,
    wire::WireRequest,
};
use trustlink_core::Dispatcher;
use trustlink_identity::peer_identity;

use crate::codec::{read_frame, write_frame};
use crate::tls::TlsContext;

pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);

pub struct TlsListener {
    listener: TcpListener,
    tls: Arc<TlsContext>,
    dispatcher: Arc<Dispatcher>,
    handshake_timeout: Duration,
}

impl TlsListener {
    /// Bind the listening socket. Nothing is accepted until `serve` runs.
    pub async fn bind(
        addr: &str,
        tls: Arc<TlsContext>,
        dispatcher: Arc<Dispatcher>,
    ) -> TrustlinkResult<Self> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| TrustlinkError::ConfigError {
                reason: format!("cannot listen on {}: {}", addr, e),
            })?;
        Ok(Self {
            listener,
            tls,
            dispatcher,
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
        })
    }

    pub fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    pub fn local_addr(&self) -> TrustlinkResult<SocketAddr> {
        self.listener
            .local_addr()
            .map_err(|e| TrustlinkError::Transport {
                reason: e.to_string(),
            })
    }

    /// Accept connections until `shutdown` flips to true.
    ///
    /// Connection tasks stop reading new frames on shutdown; a request
    /// already being handled still gets its response.
    pub async fn serve(self, mut shutdown: watch::Receiver<bool>) {
        if let Ok(addr) = self.listener.local_addr() {
            info!(addr = %addr, "mTLS listener accepting");
        }

        loop {
            tokio::select! {
                accepted = self.listener.accept() => match accepted {
                    Ok((tcp, remote)) => {
                        tokio::spawn(serve_connection(
                            tcp,
                            remote,
                            Arc::clone(&self.tls),
                            Arc::clone(&self.dispatcher),
                            self.handshake_timeout,
                            shutdown.clone(),
                        ));
                    }
                    Err(e) => warn!(error = %e, "accept failed"),
                },
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        info!("mTLS listener stopped");
    }
}

async fn authenticate(
    tcp: TcpStream,
    remote: SocketAddr,
    tls: &TlsContext,
    handshake_timeout: Duration,
) -> Option<(tokio_rustls::server::TlsStream<TcpStream>, AgentId)> {
    let config = match tls.server() {
        Ok(config) => config,
        Err(e) => {
            error!(remote = %remote, error = %e, "no TLS configuration for inbound connection");
            return None;
        }
    };

    let stream = match tokio::time::timeout(handshake_timeout, TlsAcceptor::from(config).accept(tcp)).await {
        Ok(Ok(stream)) => stream,
        Ok(Err(e)) => {
            warn!(remote = %remote, error = %e, "inbound TLS handshake failed");
            return None;
        }
        Err(_) => {
            warn!(remote = %remote, "inbound TLS handshake timed out");
            return None;
        }
    };

    let caller = stream
        .get_ref()
        .1
        .peer_certificates()
        .and_then(|chain| chain.first())
        .map(|cert| peer_identity(cert.as_ref()));

    match caller {
        Some(Ok(caller)) => Some((stream, caller)),
        Some(Err(e)) => {
            warn!(remote = %remote, error = %e, "client certificate carries no usable identity");
            None
        }
        None => {
            warn!(remote = %remote, "client presented no certificate");
            None
        }
    }
}

async fn serve_connection(
    tcp: TcpStream,
    remote: SocketAddr,
    tls: Arc<TlsContext>,
    dispatcher: Arc<Dispatcher>,
    handshake_timeout: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let _ = tcp.set_nodelay(true);
    let Some((mut stream, caller)) = authenticate(tcp, remote, &tls, handshake_timeout).await else {
        return;
    };
    debug!(caller = %caller, remote = %remote, "inbound connection authenticated");

    loop {
        let frame = tokio::select! {
            frame = read_frame::<_, WireRequest>(&mut stream) => frame,
            _ = shutdown.changed() => break,
        };

        let request = match frame {
            Ok(Some(request)) => request,
            Ok(None) => break,
            Err(e) => {
                warn!(caller = %caller, error = %e, "unreadable frame, closing connection");
                if matches!(e, TrustlinkError::Codec { .. }) {
                    let _ = write_frame(&mut stream, &e.into_call_result()).await;
                }
                break;
            }
        };

        let result = dispatcher.handle_inbound(&caller, request).await;
        let written = match write_frame(&mut stream, &result).await {
            Err(TrustlinkError::InvalidPayload { reason }) => {
                warn!(caller = %caller, reason = %reason, "response too large to send");
                let scrubbed = TrustlinkError::InternalHandlerError { reason }.into_call_result();
                write_frame(&mut stream, &scrubbed.with_metadata(result.metadata)).await
            }
            other => other,
        };
        if let Err(e) = written {
            debug!(caller = %caller, error = %e, "response not delivered");
            break;
        }
    }

    let _ = stream.shutdown().await;
    debug!(caller = %caller, remote = %remote, "inbound connection closed");
}
