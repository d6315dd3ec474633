//! Connection manager: pooled authenticated channels and per-destination
//! circuit breakers.
//!
//! Each destination has its own `PeerState` behind its own mutex. The outer
//! map lock is only held to look up or insert a destination, and no lock is
//! ever held across an await: connects and exchanges run unlocked, and
//! results are recorded afterwards.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, error, info};

use trustlink_contracts::{
    error::{TrustlinkError, TrustlinkResult},
    identity::AgentId,
};

use crate::breaker::{Admission, BreakerConfig, BreakerState, CircuitBreaker};
use crate::traits::{Channel, Connector};

/// Pool and breaker settings.
#[derive(Debug, Clone, Copy)]
pub struct PoolConfig {
    /// Idle channels kept per destination; extras are closed on check-in.
    pub max_idle_per_peer: usize,
    /// Idle channels older than this are closed by the reaper.
    pub idle_timeout: Duration,
    pub breaker: BreakerConfig,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_idle_per_peer: 8,
            idle_timeout: Duration::from_secs(90),
            breaker: BreakerConfig::default(),
        }
    }
}

struct IdleChannel {
    channel: Box<dyn Channel>,
    since: Instant,
}

/// Everything known about one destination.
struct PeerState {
    idle: Vec<IdleChannel>,
    breaker: CircuitBreaker,
}

type SharedPeer = Arc<Mutex<PeerState>>;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Permission to make one call to a destination, granted by its breaker.
///
/// Report the outcome with `succeed` or `fail`. Dropping the permit without
/// reporting records nothing, but gives back a half-open trial slot so the
/// next caller can take it.
pub struct BreakerPermit {
    peer: SharedPeer,
    admission: Admission,
    reported: bool,
}

impl BreakerPermit {
    pub fn admission(&self) -> Admission {
        self.admission
    }

    /// True when this call is the single half-open trial.
    pub fn is_trial(&self) -> bool {
        self.admission == Admission::Trial
    }

    /// The exchange reached the peer and a response came back.
    pub fn succeed(mut self) {
        self.reported = true;
        lock(&self.peer).breaker.on_success(self.admission);
    }

    /// The destination failed at the transport level.
    pub fn fail(mut self) {
        self.reported = true;
        lock(&self.peer).breaker.on_failure(self.admission, Instant::now());
    }
}

impl Drop for BreakerPermit {
    fn drop(&mut self) {
        if !self.reported && self.admission == Admission::Trial {
            lock(&self.peer).breaker.release_trial();
        }
    }
}

/// A channel handed out by `ConnectionManager::checkout`.
pub struct Checkout {
    pub channel: Box<dyn Channel>,
    /// True when the channel came from the idle list rather than a new dial.
    pub reused: bool,
}

/// Pooled, identity-verified channels keyed by destination identity.
pub struct ConnectionManager {
    connector: Arc<dyn Connector>,
    config: PoolConfig,
    peers: Mutex<HashMap<AgentId, SharedPeer>>,
    connect_attempts: AtomicU64,
    closed: AtomicBool,
}

impl ConnectionManager {
    pub fn new(connector: Arc<dyn Connector>, config: PoolConfig) -> Self {
        Self {
            connector,
            config,
            peers: Mutex::new(HashMap::new()),
            connect_attempts: AtomicU64::new(0),
            closed: AtomicBool::new(false),
        }
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    fn peer(&self, target: &AgentId) -> SharedPeer {
        let mut peers = lock(&self.peers);
        peers
            .entry(target.clone())
            .or_insert_with(|| {
                Arc::new(Mutex::new(PeerState {
                    idle: Vec::new(),
                    breaker: CircuitBreaker::new(self.config.breaker),
                }))
            })
            .clone()
    }

    /// Ask the destination's breaker for permission to call it.
    ///
    /// # Errors
    ///
    /// `CircuitOpen` while the breaker is open or its trial is taken.
    pub fn admit(&self, target: &AgentId) -> TrustlinkResult<BreakerPermit> {
        let peer = self.peer(target);
        let admitted = lock(&peer).breaker.try_admit(Instant::now());
        match admitted {
            Ok(admission) => {
                if admission == Admission::Trial {
                    info!(destination = %target, "circuit half-open, admitting trial call");
                }
                Ok(BreakerPermit {
                    peer,
                    admission,
                    reported: false,
                })
            }
            Err(remaining) => {
                debug!(destination = %target, "circuit open, call refused");
                Err(TrustlinkError::CircuitOpen {
                    destination: target.to_string(),
                    retry_after_ms: remaining.as_millis() as u64,
                })
            }
        }
    }

    /// Take an idle channel to `target`, or dial a new one.
    ///
    /// A fresh channel is only handed out after the identity the peer proved
    /// during the handshake matches `target` exactly. An idle channel may
    /// have been closed by the peer since it was checked in; the returned
    /// `Checkout` says which kind it is.
    ///
    /// # Errors
    ///
    /// - `ConnectFailed` / `UnknownPeer` from the connector
    /// - `IdentityMismatch` if the peer proved a different identity
    pub async fn checkout(&self, target: &AgentId) -> TrustlinkResult<Checkout> {
        self.ensure_open()?;

        let peer = self.peer(target);
        let reused = {
            let mut state = lock(&peer);
            let now = Instant::now();
            let idle_timeout = self.config.idle_timeout;
            state
                .idle
                .retain(|c| now.saturating_duration_since(c.since) < idle_timeout);
            state.idle.pop()
        };
        if let Some(idle) = reused {
            debug!(destination = %target, "reusing pooled connection");
            return Ok(Checkout {
                channel: idle.channel,
                reused: true,
            });
        }

        self.dial(target).await
    }

    /// Dial a new channel to `target`, bypassing the idle list.
    pub async fn dial(&self, target: &AgentId) -> TrustlinkResult<Checkout> {
        self.ensure_open()?;

        self.connect_attempts.fetch_add(1, Ordering::SeqCst);
        let channel = self.connector.connect(target).await?;

        if channel.peer() != target {
            error!(
                expected = %target,
                presented = %channel.peer(),
                "peer presented an unexpected identity, connection dropped"
            );
            return Err(TrustlinkError::IdentityMismatch {
                expected: target.to_string(),
                presented: channel.peer().to_string(),
            });
        }

        debug!(destination = %target, "connection established");
        Ok(Checkout {
            channel,
            reused: false,
        })
    }

    /// Close every idle channel to `target`. Returns how many were closed.
    pub fn discard_idle(&self, target: &AgentId) -> usize {
        let peer = self.peer(target);
        let discarded = lock(&peer).idle.drain(..).count();
        if discarded > 0 {
            debug!(destination = %target, discarded, "idle connections discarded");
        }
        discarded
    }

    fn ensure_open(&self) -> TrustlinkResult<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(TrustlinkError::Transport {
                reason: "connection manager is shut down".to_string(),
            });
        }
        Ok(())
    }

    /// Return a healthy channel to the pool.
    pub fn checkin(&self, target: &AgentId, channel: Box<dyn Channel>) {
        if self.closed.load(Ordering::SeqCst) {
            return;
        }
        let peer = self.peer(target);
        let mut state = lock(&peer);
        if state.idle.len() < self.config.max_idle_per_peer {
            state.idle.push(IdleChannel {
                channel,
                since: Instant::now(),
            });
        }
    }

    /// Close every idle channel past the idle timeout. Returns how many were closed.
    pub fn reap_idle(&self) -> usize {
        let now = Instant::now();
        let idle_timeout = self.config.idle_timeout;
        let mut peers = lock(&self.peers);
        let mut reaped = 0;

        peers.retain(|_, peer| {
            let mut state = lock(peer);
            let before = state.idle.len();
            state
                .idle
                .retain(|c| now.saturating_duration_since(c.since) < idle_timeout);
            reaped += before - state.idle.len();
            // Forget destinations with nothing worth keeping and no permit outstanding.
            let forgettable = state.idle.is_empty() && state.breaker.is_pristine();
            drop(state);
            !(forgettable && Arc::strong_count(peer) == 1)
        });

        if reaped > 0 {
            debug!(reaped, "idle connections closed");
        }
        reaped
    }

    /// Run `reap_idle` on a fixed interval until `shutdown` flips to true.
    pub async fn run_reaper(self: Arc<Self>, interval: Duration, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(interval);
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.reap_idle();
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        debug!("idle reaper stopped");
                        return;
                    }
                }
            }
        }
    }

    /// Idle channels currently pooled for `target`.
    pub fn idle_count(&self, target: &AgentId) -> usize {
        let peers = lock(&self.peers);
        peers.get(target).map(|p| lock(p).idle.len()).unwrap_or(0)
    }

    /// Breaker state for `target` (`Closed` for destinations never seen).
    pub fn breaker_state(&self, target: &AgentId) -> BreakerState {
        let peers = lock(&self.peers);
        peers
            .get(target)
            .map(|p| lock(p).breaker.state())
            .unwrap_or(BreakerState::Closed)
    }

    /// Total connect attempts made through this manager.
    pub fn connect_attempts(&self) -> u64 {
        self.connect_attempts.load(Ordering::SeqCst)
    }

    /// Refuse new checkouts and close every pooled channel. Returns how many were closed.
    pub fn shutdown(&self) -> usize {
        self.closed.store(true, Ordering::SeqCst);
        let mut peers = lock(&self.peers);
        let drained: usize = peers.values().map(|p| lock(p).idle.drain(..).count()).sum();
        peers.clear();
        debug!(drained, "connection pool drained");
        drained
    }
}

// ── Tests ────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use trustlink_contracts::{call::CallResult, wire::WireRequest};

    use super::*;

    struct NullChannel {
        peer: AgentId,
    }

    #[async_trait]
    impl Channel for NullChannel {
        fn peer(&self) -> &AgentId {
            &self.peer
        }

        async fn call(&mut self, _request: &WireRequest) -> TrustlinkResult<CallResult> {
            Ok(CallResult::completed(Vec::new()))
        }
    }

    /// Connects to whoever is asked for, presenting `presents` if set.
    struct FakeConnector {
        presents: Option<AgentId>,
    }

    #[async_trait]
    impl Connector for FakeConnector {
        async fn connect(&self, target: &AgentId) -> TrustlinkResult<Box<dyn Channel>> {
            let peer = self.presents.clone().unwrap_or_else(|| target.clone());
            Ok(Box::new(NullChannel { peer }))
        }
    }

    fn id(s: &str) -> AgentId {
        AgentId::parse(s).unwrap()
    }

    fn manager(presents: Option<AgentId>, config: PoolConfig) -> ConnectionManager {
        ConnectionManager::new(Arc::new(FakeConnector { presents }), config)
    }

    #[tokio::test]
    async fn test_checked_in_channel_is_reused() {
        let pool = manager(None, PoolConfig::default());
        let target = id("id://dom/y");

        let first = pool.checkout(&target).await.unwrap();
        assert!(!first.reused);
        pool.checkin(&target, first.channel);
        assert_eq!(pool.idle_count(&target), 1);

        let second = pool.checkout(&target).await.unwrap();
        assert!(second.reused);
        assert_eq!(pool.connect_attempts(), 1);
        assert_eq!(pool.idle_count(&target), 0);
    }

    #[tokio::test]
    async fn test_mismatched_peer_is_rejected() {
        let pool = manager(Some(id("id://dom/z")), PoolConfig::default());
        let target = id("id://dom/y");

        match pool.checkout(&target).await {
            Err(TrustlinkError::IdentityMismatch { expected, presented }) => {
                assert_eq!(expected, "id://dom/y");
                assert_eq!(presented, "id://dom/z");
            }
            Err(other) => panic!("expected IdentityMismatch, got {other:?}"),
            Ok(_) => panic!("expected IdentityMismatch, got a channel"),
        }
        assert_eq!(pool.idle_count(&target), 0);
    }

    #[tokio::test]
    async fn test_checkin_respects_idle_limit() {
        let config = PoolConfig {
            max_idle_per_peer: 1,
            ..PoolConfig::default()
        };
        let pool = manager(None, config);
        let target = id("id://dom/y");

        let a = pool.checkout(&target).await.unwrap();
        let b = pool.checkout(&target).await.unwrap();
        pool.checkin(&target, a.channel);
        pool.checkin(&target, b.channel);
        assert_eq!(pool.idle_count(&target), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reaper_closes_expired_idle_channels() {
        let config = PoolConfig {
            idle_timeout: Duration::from_secs(10),
            ..PoolConfig::default()
        };
        let pool = manager(None, config);
        let target = id("id://dom/y");

        let checkout = pool.checkout(&target).await.unwrap();
        pool.checkin(&target, checkout.channel);

        tokio::time::advance(Duration::from_secs(5)).await;
        assert_eq!(pool.reap_idle(), 0);

        tokio::time::advance(Duration::from_secs(6)).await;
        assert_eq!(pool.reap_idle(), 1);
        assert_eq!(pool.idle_count(&target), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropped_trial_permit_frees_the_slot() {
        let config = PoolConfig {
            breaker: BreakerConfig {
                failure_threshold: 1,
                cooldown: Duration::from_secs(30),
                failure_window: Duration::from_secs(60),
            },
            ..PoolConfig::default()
        };
        let pool = manager(None, config);
        let target = id("id://dom/y");

        pool.admit(&target).unwrap().fail();
        assert_eq!(pool.breaker_state(&target), BreakerState::Open);
        assert!(matches!(
            pool.admit(&target),
            Err(TrustlinkError::CircuitOpen { .. })
        ));

        tokio::time::advance(Duration::from_secs(30)).await;
        let trial = pool.admit(&target).unwrap();
        assert!(trial.is_trial());
        assert!(pool.admit(&target).is_err());

        drop(trial);
        let retaken = pool.admit(&target).unwrap();
        retaken.succeed();
        assert_eq!(pool.breaker_state(&target), BreakerState::Closed);
    }

    #[tokio::test]
    async fn test_shutdown_drains_and_refuses_checkout() {
        let pool = manager(None, PoolConfig::default());
        let target = id("id://dom/y");

        let checkout = pool.checkout(&target).await.unwrap();
        pool.checkin(&target, checkout.channel);
        assert_eq!(pool.shutdown(), 1);
        assert!(pool.checkout(&target).await.is_err());
    }

    #[tokio::test]
    async fn test_dial_bypasses_idle_channels_and_discard_empties_them() {
        let pool = manager(None, PoolConfig::default());
        let target = id("id://dom/y");

        let a = pool.checkout(&target).await.unwrap();
        let b = pool.checkout(&target).await.unwrap();
        pool.checkin(&target, a.channel);
        pool.checkin(&target, b.channel);

        let fresh = pool.dial(&target).await.unwrap();
        assert!(!fresh.reused);
        assert_eq!(pool.connect_attempts(), 3);
        assert_eq!(pool.idle_count(&target), 2);

        assert_eq!(pool.discard_idle(&target), 2);
        assert_eq!(pool.idle_count(&target), 0);
    }
}
