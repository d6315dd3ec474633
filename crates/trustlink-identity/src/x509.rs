//! Identity extraction from X.509 certificates.
//!
//! An SVID names its workload in exactly one URI subject alternative name.
//! The same extraction is applied to our own leaf certificate and to the
//! certificate a peer presents during the handshake.

use chrono::{DateTime, Utc};
use x509_parser::extensions::GeneralName;
use x509_parser::prelude::*;

use trustlink_contracts::{
    error::{TrustlinkError, TrustlinkResult},
    identity::{AgentId, AgentIdentity},
};

fn parse_der(der: &[u8]) -> TrustlinkResult<X509Certificate<'_>> {
    let (_, cert) = X509Certificate::from_der(der).map_err(|e| TrustlinkError::Tls {
        reason: format!("failed to parse certificate: {}", e),
    })?;
    Ok(cert)
}

fn uri_san(cert: &X509Certificate<'_>) -> TrustlinkResult<AgentId> {
    let not_an_svid = |reason: &str| TrustlinkError::InvalidIdentity {
        value: cert.subject().to_string(),
        reason: reason.to_string(),
    };

    let san = cert
        .subject_alternative_name()
        .map_err(|e| not_an_svid(&format!("unreadable subjectAltName: {}", e)))?
        .ok_or_else(|| not_an_svid("certificate has no subjectAltName"))?;

    let mut uris = san.value.general_names.iter().filter_map(|name| match name {
        GeneralName::URI(uri) => Some(*uri),
        _ => None,
    });

    let uri = uris
        .next()
        .ok_or_else(|| not_an_svid("certificate has no URI subjectAltName"))?;
    if uris.next().is_some() {
        return Err(not_an_svid("certificate has more than one URI subjectAltName"));
    }

    AgentId::parse(uri)
}

/// The identity named by a DER certificate's URI SAN.
pub fn peer_identity(der: &[u8]) -> TrustlinkResult<AgentId> {
    uri_san(&parse_der(der)?)
}

/// The identity and `notAfter` of a DER leaf certificate.
pub fn leaf_identity(der: &[u8]) -> TrustlinkResult<AgentIdentity> {
    let cert = parse_der(der)?;
    let id = uri_san(&cert)?;

    let not_after = cert.validity().not_after.timestamp();
    let expires_at = DateTime::<Utc>::from_timestamp(not_after, 0).ok_or_else(|| {
        TrustlinkError::Tls {
            reason: format!("certificate notAfter {} is out of range", not_after),
        }
    })?;

    Ok(AgentIdentity::new(id, expires_at))
}

/// Decode every certificate in a PEM bundle, leaf first.
pub fn pem_certificates(pem: &str) -> TrustlinkResult<Vec<Vec<u8>>> {
    let certs = rustls_pemfile::certs(&mut pem.as_bytes())
        .map(|cert| cert.map(|der| der.as_ref().to_vec()))
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| TrustlinkError::Tls {
            reason: format!("invalid PEM certificate data: {}", e),
        })?;

    if certs.is_empty() {
        return Err(TrustlinkError::Tls {
            reason: "no certificates found in PEM data".to_string(),
        });
    }
    Ok(certs)
}

/// The identity of the first certificate of a PEM chain.
pub fn identity_from_pem(chain_pem: &str) -> TrustlinkResult<AgentIdentity> {
    let chain = pem_certificates(chain_pem)?;
    leaf_identity(&chain[0])
}

// ── Tests ────────────────────────────────────────────────────────────────────
