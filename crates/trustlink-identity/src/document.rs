//! The identity document held by a running agent.

use std::fmt;

use chrono::Utc;
use zeroize::Zeroizing;

use trustlink_contracts::{
    error::{TrustlinkError, TrustlinkResult},
    identity::AgentIdentity,
};

use crate::x509::{identity_from_pem, pem_certificates};

/// An SVID: certificate chain, private key and the trust bundle peers are
/// validated against. The identity is derived from the leaf certificate.
///
/// The private key is wiped from memory when the document is dropped.
pub struct IdentityDocument {
    pub identity: AgentIdentity,
    pub cert_chain_pem: String,
    pub private_key_pem: Zeroizing<String>,
    pub trust_bundle_pem: String,
}

impl IdentityDocument {
    /// Assemble a document from PEM material, validating every part.
    pub fn from_pem(
        cert_chain_pem: String,
        private_key_pem: Zeroizing<String>,
        trust_bundle_pem: String,
    ) -> TrustlinkResult<Self> {
        let unusable = |e: TrustlinkError| TrustlinkError::IdentityUnavailable {
            reason: e.to_string(),
        };

        let identity = identity_from_pem(&cert_chain_pem).map_err(unusable)?;
        pem_certificates(&trust_bundle_pem).map_err(unusable)?;

        match rustls_pemfile::private_key(&mut private_key_pem.as_bytes()) {
            Ok(Some(_)) => {}
            Ok(None) => {
                return Err(TrustlinkError::IdentityUnavailable {
                    reason: "no private key found in PEM data".to_string(),
                })
            }
            Err(e) => {
                return Err(TrustlinkError::IdentityUnavailable {
                    reason: format!("invalid private key PEM: {}", e),
                })
            }
        }

        Ok(Self {
            identity,
            cert_chain_pem,
            private_key_pem,
            trust_bundle_pem,
        })
    }

    pub fn is_expired(&self) -> bool {
        self.identity.is_expired(Utc::now())
    }
}

impl fmt::Debug for IdentityDocument {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IdentityDocument")
            .field("identity", &self.identity)
            .field("cert_chain_pem", &format_args!("<{} bytes>", self.cert_chain_pem.len()))
            .field("private_key_pem", &"<redacted>")
            .field("trust_bundle_pem", &format_args!("<{} bytes>", self.trust_bundle_pem.len()))
            .finish()
    }
}
