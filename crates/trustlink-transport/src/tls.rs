//! rustls configuration built from the agent's identity document.
//!
//! Both directions validate the peer's chain against the trust bundle. The
//! server name is not part of the check: peers are identified by the URI SAN
//! of their certificate, which the connector compares to the dialled
//! identity after the handshake.

use std::fmt;
use std::str::FromStr;
use std::sync::{Arc, Mutex, PoisonError};

use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::client::WebPkiServerVerifier;
use rustls::crypto::CryptoProvider;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName, UnixTime};
use rustls::server::WebPkiClientVerifier;
use rustls::{
    CertificateError, ClientConfig, DigitallySignedStruct, RootCertStore, ServerConfig,
    SignatureScheme, SupportedProtocolVersion,
};
use serde::{Deserialize, Serialize};
use tracing::debug;

use trustlink_contracts::error::{TrustlinkError, TrustlinkResult};
use trustlink_identity::{IdentityClient, IdentityDocument};

fn tls_error(context: &str) -> impl Fn(rustls::Error) -> TrustlinkError + '_ {
    move |e| TrustlinkError::Tls {
        reason: format!("{}: {}", context, e),
    }
}

// ── Protocol version ──────────────────────────────────────────────────────────

static TLS13_ONLY: &[&SupportedProtocolVersion] = &[&rustls::version::TLS13];

/// Lowest TLS version accepted on either side of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum TlsVersion {
    Tls12,
    #[default]
    Tls13,
}

impl TlsVersion {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Tls12 => "1.2",
            Self::Tls13 => "1.3",
        }
    }

    fn protocol_versions(&self) -> &'static [&'static SupportedProtocolVersion] {
        match self {
            Self::Tls12 => rustls::ALL_VERSIONS,
            Self::Tls13 => TLS13_ONLY,
        }
    }
}

impl fmt::Display for TlsVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TlsVersion {
    type Err = TrustlinkError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "1.2" => Ok(Self::Tls12),
            "1.3" => Ok(Self::Tls13),
            other => Err(TrustlinkError::ConfigError {
                reason: format!("unsupported TLS version '{}', expected \"1.2\" or \"1.3\"", other),
            }),
        }
    }
}

impl TryFrom<String> for TlsVersion {
    type Error = TrustlinkError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<TlsVersion> for String {
    fn from(version: TlsVersion) -> Self {
        version.as_str().to_string()
    }
}

// ── Verifiers ─────────────────────────────────────────────────────────────────

/// Validates the server chain but not its DNS name.
#[derive(Debug)]
struct TrustBundleServerVerifier {
    inner: Arc<WebPkiServerVerifier>,
}

impl ServerCertVerifier for TrustBundleServerVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        intermediates: &[CertificateDer<'_>],
        server_name: &ServerName<'_>,
        ocsp_response: &[u8],
        now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        // The name check runs after chain validation, so a name error means
        // the chain itself was accepted.
        match self
            .inner
            .verify_server_cert(end_entity, intermediates, server_name, ocsp_response, now)
        {
            Ok(verified) => Ok(verified),
            Err(rustls::Error::InvalidCertificate(CertificateError::NotValidForName))
            | Err(rustls::Error::InvalidCertificate(CertificateError::NotValidForNameContext {
                ..
            })) => Ok(ServerCertVerified::assertion()),
            Err(e) => Err(e),
        }
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        self.inner.verify_tls12_signature(message, cert, dss)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        self.inner.verify_tls13_signature(message, cert, dss)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.inner.supported_verify_schemes()
    }
}

// ── Config builders ───────────────────────────────────────────────────────────

fn provider() -> Arc<CryptoProvider> {
    Arc::new(rustls::crypto::aws_lc_rs::default_provider())
}

fn certificate_chain(document: &IdentityDocument) -> TrustlinkResult<Vec<CertificateDer<'static>>> {
    rustls_pemfile::certs(&mut document.cert_chain_pem.as_bytes())
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| TrustlinkError::Tls {
            reason: format!("invalid certificate chain: {}", e),
        })
}

fn private_key(document: &IdentityDocument) -> TrustlinkResult<PrivateKeyDer<'static>> {
    rustls_pemfile::private_key(&mut document.private_key_pem.as_bytes())
        .map_err(|e| TrustlinkError::Tls {
            reason: format!("invalid private key: {}", e),
        })?
        .ok_or_else(|| TrustlinkError::Tls {
            reason: "no private key found".to_string(),
        })
}

fn trust_roots(document: &IdentityDocument) -> TrustlinkResult<Arc<RootCertStore>> {
    let mut roots = RootCertStore::empty();
    for cert in rustls_pemfile::certs(&mut document.trust_bundle_pem.as_bytes()) {
        let cert = cert.map_err(|e| TrustlinkError::Tls {
            reason: format!("invalid trust bundle: {}", e),
        })?;
        roots.add(cert).map_err(tls_error("trust bundle certificate rejected"))?;
    }
    if roots.is_empty() {
        return Err(TrustlinkError::Tls {
            reason: "trust bundle is empty".to_string(),
        });
    }
    Ok(Arc::new(roots))
}

/// Client side: present our SVID, validate the server against the bundle.
pub fn client_config(
    document: &IdentityDocument,
    min_version: TlsVersion,
) -> TrustlinkResult<Arc<ClientConfig>> {
    let provider = provider();
    let inner = WebPkiServerVerifier::builder_with_provider(trust_roots(document)?, provider.clone())
        .build()
        .map_err(|e| TrustlinkError::Tls {
            reason: format!("cannot build server verifier: {}", e),
        })?;

    let config = ClientConfig::builder_with_provider(provider)
        .with_protocol_versions(min_version.protocol_versions())
        .map_err(tls_error("unsupported protocol versions"))?
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(TrustBundleServerVerifier { inner }))
        .with_client_auth_cert(certificate_chain(document)?, private_key(document)?)
        .map_err(tls_error("client certificate rejected"))?;

    Ok(Arc::new(config))
}

/// Server side: present our SVID, require and validate a client certificate.
pub fn server_config(
    document: &IdentityDocument,
    min_version: TlsVersion,
) -> TrustlinkResult<Arc<ServerConfig>> {
    let provider = provider();
    let verifier = WebPkiClientVerifier::builder_with_provider(trust_roots(document)?, provider.clone())
        .build()
        .map_err(|e| TrustlinkError::Tls {
            reason: format!("cannot build client verifier: {}", e),
        })?;

    let config = ServerConfig::builder_with_provider(provider)
        .with_protocol_versions(min_version.protocol_versions())
        .map_err(tls_error("unsupported protocol versions"))?
        .with_client_cert_verifier(verifier)
        .with_single_cert(certificate_chain(document)?, private_key(document)?)
        .map_err(tls_error("server certificate rejected"))?;

    Ok(Arc::new(config))
}

// ── Rotation-aware context ────────────────────────────────────────────────────

struct Built {
    document: Arc<IdentityDocument>,
    client: Arc<ClientConfig>,
    server: Arc<ServerConfig>,
}

/// TLS configurations for the identity currently held.
///
/// Rebuilt lazily whenever the identity client has swapped in a new
/// document; connections already established keep their old session.
pub struct TlsContext {
    identity: Arc<IdentityClient>,
    min_version: TlsVersion,
    built: Mutex<Option<Built>>,
}

impl TlsContext {
    pub fn new(identity: Arc<IdentityClient>, min_version: TlsVersion) -> Self {
        Self {
            identity,
            min_version,
            built: Mutex::new(None),
        }
    }

    pub fn min_version(&self) -> TlsVersion {
        self.min_version
    }

    fn current(&self) -> TrustlinkResult<(Arc<ClientConfig>, Arc<ServerConfig>)> {
        let document = self.identity.document()?;
        let mut built = self.built.lock().unwrap_or_else(PoisonError::into_inner);

        if let Some(b) = built.as_ref() {
            if Arc::ptr_eq(&b.document, &document) {
                return Ok((b.client.clone(), b.server.clone()));
            }
        }

        let client = client_config(&document, self.min_version)?;
        let server = server_config(&document, self.min_version)?;
        debug!(
            identity = %document.identity.id,
            min_tls_version = %self.min_version,
            "TLS configuration built"
        );
        *built = Some(Built {
            document,
            client: client.clone(),
            server: server.clone(),
        });
        Ok((client, server))
    }

    pub fn client(&self) -> TrustlinkResult<Arc<ClientConfig>> {
        self.current().map(|(client, _)| client)
    }

    pub fn server(&self) -> TrustlinkResult<Arc<ServerConfig>> {
        self.current().map(|(_, server)| server)
    }
}

// ── Tests ────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tls_version_parsing() {
        assert_eq!("1.3".parse::<TlsVersion>().unwrap(), TlsVersion::Tls13);
        assert_eq!("1.2".parse::<TlsVersion>().unwrap(), TlsVersion::Tls12);
        assert!(matches!(
            "1.1".parse::<TlsVersion>(),
            Err(TrustlinkError::ConfigError { .. })
        ));
        assert_eq!(TlsVersion::default(), TlsVersion::Tls13);
    }

    #[test]
    fn test_tls13_minimum_excludes_tls12() {
        let versions = TlsVersion::Tls13.protocol_versions();
        assert_eq!(versions.len(), 1);
        assert_eq!(versions[0].version, rustls::ProtocolVersion::TLSv1_3);
        assert!(TlsVersion::Tls12.protocol_versions().len() >= 2);
    }
}
