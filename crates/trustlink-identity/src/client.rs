//! The identity provider client.
//!
//! Holds the agent's current identity document and keeps it fresh. Readers
//! take an `Arc` snapshot of the document; a refresh builds the replacement
//! completely before swapping it in, so a reader never observes a
//! half-updated identity.

use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use chrono::Utc;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use trustlink_contracts::{
    error::{TrustlinkError, TrustlinkResult},
    identity::AgentIdentity,
};
use trustlink_core::retry::{retry_with_backoff, RetryPolicy};
use trustlink_core::traits::IdentityProvider;

use crate::document::IdentityDocument;
use crate::fetcher::IdentityFetcher;

/// Floor on the delay between refresh rounds.
pub const MIN_REFRESH_INTERVAL: Duration = Duration::from_secs(1);

fn refresh_retry() -> RetryPolicy {
    RetryPolicy {
        max_attempts: 0,
        base_delay: Duration::from_secs(1),
        multiplier: 2.0,
        max_delay: Duration::from_secs(30),
    }
}

pub struct IdentityClient {
    fetcher: Arc<dyn IdentityFetcher>,
    current: RwLock<Arc<IdentityDocument>>,
    retry: RetryPolicy,
}

impl IdentityClient {
    /// Fetch the first identity document. Failure here is fatal to startup.
    pub async fn bootstrap(fetcher: Arc<dyn IdentityFetcher>) -> TrustlinkResult<Self> {
        let document = fetcher.fetch_identity().await?;
        if document.is_expired() {
            return Err(TrustlinkError::IdentityUnavailable {
                reason: format!(
                    "identity '{}' expired at {}",
                    document.identity.id, document.identity.expires_at
                ),
            });
        }

        info!(
            identity = %document.identity.id,
            expires_at = %document.identity.expires_at,
            "identity acquired"
        );
        Ok(Self::with_document(fetcher, document))
    }

    /// Wrap an already fetched document without validating it.
    pub fn with_document(fetcher: Arc<dyn IdentityFetcher>, document: IdentityDocument) -> Self {
        Self {
            fetcher,
            current: RwLock::new(Arc::new(document)),
            retry: refresh_retry(),
        }
    }

    /// Override the backoff used between failed refresh attempts.
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    fn held(&self) -> Arc<IdentityDocument> {
        self.current
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// The current document, or `IdentityUnavailable` once it has expired.
    pub fn document(&self) -> TrustlinkResult<Arc<IdentityDocument>> {
        let document = self.held();
        if document.is_expired() {
            return Err(TrustlinkError::IdentityUnavailable {
                reason: format!(
                    "identity '{}' expired at {}",
                    document.identity.id, document.identity.expires_at
                ),
            });
        }
        Ok(document)
    }

    /// Fetch a replacement document and swap it in.
    ///
    /// The replacement must name the same identity and must not already be
    /// expired; otherwise the held document stays in place.
    pub async fn refresh(&self) -> TrustlinkResult<AgentIdentity> {
        let fresh = self.fetcher.fetch_identity().await?;
        let held = self.held();

        if fresh.identity.id != held.identity.id {
            return Err(TrustlinkError::IdentityUnavailable {
                reason: format!(
                    "identity provider issued '{}' to agent '{}'",
                    fresh.identity.id, held.identity.id
                ),
            });
        }
        if fresh.is_expired() {
            return Err(TrustlinkError::IdentityUnavailable {
                reason: format!("refreshed identity expired at {}", fresh.identity.expires_at),
            });
        }

        let identity = fresh.identity.clone();
        *self.current.write().unwrap_or_else(PoisonError::into_inner) = Arc::new(fresh);

        info!(
            identity = %identity.id,
            expires_at = %identity.expires_at,
            "identity refreshed"
        );
        Ok(identity)
    }

    /// Time until the next refresh: half the remaining lifetime.
    pub fn refresh_delay(&self) -> Duration {
        let remaining = self.held().identity.expires_at - Utc::now();
        let half = remaining.to_std().unwrap_or_default() / 2;
        half.max(MIN_REFRESH_INTERVAL)
    }

    /// Refresh at half the remaining lifetime until `shutdown` flips to true.
    ///
    /// A failed refresh is retried with backoff for as long as the held
    /// document is still valid. Past expiry `current()` reports
    /// `IdentityUnavailable` and refresh rounds continue at the minimum
    /// interval.
    pub async fn refresh_loop(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let client = &*self;
        loop {
            if *shutdown.borrow() {
                break;
            }

            let delay = client.refresh_delay();
            debug!(delay_secs = delay.as_secs(), "next identity refresh scheduled");

            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                    continue;
                }
            }

            let round = retry_with_backoff(
                &client.retry,
                "identity refresh",
                move |_: &TrustlinkError| client.document().is_ok(),
                move |_| client.refresh(),
            );

            tokio::select! {
                (outcome, attempts) = round => {
                    if let Err(e) = outcome {
                        if client.document().is_err() {
                            error!(error = %e, attempts, "identity expired and could not be refreshed");
                        } else {
                            warn!(error = %e, attempts, "identity refresh failed");
                        }
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        debug!("identity refresh loop stopped");
    }
}

impl IdentityProvider for IdentityClient {
    fn current(&self) -> TrustlinkResult<AgentIdentity> {
        self.document().map(|document| document.identity.clone())
    }
}

// ── Tests ────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;

    use async_trait::async_trait;
    use chrono::{DateTime, Duration as TimeDelta};
    use zeroize::Zeroizing;

    use trustlink_contracts::identity::AgentId;

    use super::*;

    // ── Helpers ───────────────────────────────────────────────────────────────

    fn document(id: &str, expires_at: DateTime<Utc>, tag: &str) -> IdentityDocument {
        IdentityDocument {
            identity: AgentIdentity::new(AgentId::parse(id).unwrap(), expires_at),
            cert_chain_pem: tag.to_string(),
            private_key_pem: Zeroizing::new(String::new()),
            trust_bundle_pem: String::new(),
        }
    }

    fn valid(tag: &str) -> IdentityDocument {
        document("spiffe://example.org/agents/x", Utc::now() + TimeDelta::seconds(60), tag)
    }

    /// Hands out queued results, then fails.
    struct QueueFetcher {
        queue: Mutex<VecDeque<TrustlinkResult<IdentityDocument>>>,
        calls: AtomicU32,
    }

    impl QueueFetcher {
        fn new(results: Vec<TrustlinkResult<IdentityDocument>>) -> Arc<Self> {
            Arc::new(Self {
                queue: Mutex::new(results.into()),
                calls: AtomicU32::new(0),
            })
        }

        fn calls(&self) -> u32 {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl IdentityFetcher for QueueFetcher {
        async fn fetch_identity(&self) -> TrustlinkResult<IdentityDocument> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.queue.lock().unwrap().pop_front().unwrap_or_else(|| {
                Err(TrustlinkError::IdentityUnavailable {
                    reason: "provider down".to_string(),
                })
            })
        }
    }

    fn provider_down() -> TrustlinkResult<IdentityDocument> {
        Err(TrustlinkError::IdentityUnavailable {
            reason: "provider down".to_string(),
        })
    }

    // ── Tests ─────────────────────────────────────────────────────────────────

    #[tokio::test]
    async fn test_bootstrap_holds_identity() {
        let fetcher = QueueFetcher::new(vec![Ok(valid("first"))]);
        let client = IdentityClient::bootstrap(fetcher).await.unwrap();

        let identity = client.current().unwrap();
        assert_eq!(identity.id.as_str(), "spiffe://example.org/agents/x");
        assert_eq!(identity.trust_domain(), "example.org");
    }

    #[tokio::test]
    async fn test_bootstrap_failure_is_fatal() {
        let fetcher = QueueFetcher::new(vec![provider_down()]);
        let result = IdentityClient::bootstrap(fetcher).await;
        assert!(matches!(result, Err(TrustlinkError::IdentityUnavailable { .. })));
    }

    #[tokio::test]
    async fn test_bootstrap_rejects_expired_document() {
        let expired = document(
            "spiffe://example.org/agents/x",
            Utc::now() - TimeDelta::seconds(1),
            "old",
        );
        let fetcher = QueueFetcher::new(vec![Ok(expired)]);
        assert!(IdentityClient::bootstrap(fetcher).await.is_err());
    }

    #[test]
    fn test_expired_identity_is_never_handed_out() {
        let expired = document(
            "spiffe://example.org/agents/x",
            Utc::now() - TimeDelta::seconds(1),
            "old",
        );
        let client = IdentityClient::with_document(QueueFetcher::new(vec![]), expired);

        assert!(matches!(
            client.current(),
            Err(TrustlinkError::IdentityUnavailable { .. })
        ));
        assert!(client.document().is_err());
    }

    #[tokio::test]
    async fn test_refresh_swaps_document() {
        let fetcher = QueueFetcher::new(vec![Ok(valid("first")), Ok(valid("second"))]);
        let client = IdentityClient::bootstrap(fetcher).await.unwrap();

        let before = client.document().unwrap();
        client.refresh().await.unwrap();
        let after = client.document().unwrap();

        assert_eq!(before.cert_chain_pem, "first");
        assert_eq!(after.cert_chain_pem, "second");
    }

    #[tokio::test]
    async fn test_refresh_keeps_document_when_identity_changes() {
        let other = document(
            "spiffe://example.org/agents/impostor",
            Utc::now() + TimeDelta::seconds(60),
            "other",
        );
        let fetcher = QueueFetcher::new(vec![Ok(valid("first")), Ok(other)]);
        let client = IdentityClient::bootstrap(fetcher).await.unwrap();

        assert!(client.refresh().await.is_err());
        assert_eq!(client.document().unwrap().cert_chain_pem, "first");
    }

    #[test]
    fn test_refresh_delay_is_half_remaining_lifetime() {
        let doc = document(
            "spiffe://example.org/agents/x",
            Utc::now() + TimeDelta::seconds(100),
            "d",
        );
        let client = IdentityClient::with_document(QueueFetcher::new(vec![]), doc);

        let delay = client.refresh_delay();
        assert!(delay <= Duration::from_secs(50));
        assert!(delay >= Duration::from_secs(49));
    }

    #[test]
    fn test_refresh_delay_has_a_floor() {
        let doc = document(
            "spiffe://example.org/agents/x",
            Utc::now() - TimeDelta::seconds(5),
            "d",
        );
        let client = IdentityClient::with_document(QueueFetcher::new(vec![]), doc);
        assert_eq!(client.refresh_delay(), MIN_REFRESH_INTERVAL);
    }

    /// A failed refresh is retried while the held document is still valid.
    #[tokio::test(start_paused = true)]
    async fn test_refresh_loop_retries_then_stops() {
        let fetcher = QueueFetcher::new(vec![
            Ok(valid("first")),
            provider_down(),
            Ok(valid("second")),
        ]);
        let client = Arc::new(IdentityClient::bootstrap(fetcher.clone()).await.unwrap());
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let task = tokio::spawn(client.clone().refresh_loop(shutdown_rx));

        tokio::time::sleep(Duration::from_secs(40)).await;
        assert_eq!(fetcher.calls(), 3, "bootstrap, one failure, one retry");
        assert_eq!(client.document().unwrap().cert_chain_pem, "second");

        shutdown_tx.send(true).unwrap();
        task.await.unwrap();
    }
}
