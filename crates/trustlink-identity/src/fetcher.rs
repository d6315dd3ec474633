//! Sources of identity documents.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tracing::debug;
use zeroize::Zeroizing;

use trustlink_contracts::error::{TrustlinkError, TrustlinkResult};

use crate::document::IdentityDocument;

/// Fetches the current identity document from the identity provider.
#[async_trait]
pub trait IdentityFetcher: Send + Sync {
    async fn fetch_identity(&self) -> TrustlinkResult<IdentityDocument>;
}

/// Reads the SVID files kept up to date by a local identity agent helper.
#[derive(Debug, Clone)]
pub struct FileIdentityFetcher {
    cert_path: PathBuf,
    key_path: PathBuf,
    bundle_path: PathBuf,
}

impl FileIdentityFetcher {
    pub fn new(
        cert_path: impl Into<PathBuf>,
        key_path: impl Into<PathBuf>,
        bundle_path: impl Into<PathBuf>,
    ) -> Self {
        Self {
            cert_path: cert_path.into(),
            key_path: key_path.into(),
            bundle_path: bundle_path.into(),
        }
    }
}

async fn read(path: &Path) -> TrustlinkResult<String> {
    tokio::fs::read_to_string(path)
        .await
        .map_err(|e| TrustlinkError::IdentityUnavailable {
            reason: format!("cannot read {}: {}", path.display(), e),
        })
}

#[async_trait]
impl IdentityFetcher for FileIdentityFetcher {
    async fn fetch_identity(&self) -> TrustlinkResult<IdentityDocument> {
        let cert_chain_pem = read(&self.cert_path).await?;
        let private_key_pem = Zeroizing::new(read(&self.key_path).await?);
        let trust_bundle_pem = read(&self.bundle_path).await?;

        let document = IdentityDocument::from_pem(cert_chain_pem, private_key_pem, trust_bundle_pem)?;
        debug!(
            identity = %document.identity.id,
            expires_at = %document.identity.expires_at,
            cert_path = %self.cert_path.display(),
            "identity document loaded"
        );
        Ok(document)
    }
}
