//! The TRUSTLINK dispatcher: the policy-gated request router.
//!
//! Outbound, one call runs:
//!
//!   Target check → Breaker → Policy → Audit → Connect (retried) → Send → Result
//!
//! Inbound, one request runs:
//!
//!   Policy → Audit → Registry dispatch (isolated task, deadline-bounded) → Result
//!
//! The security invariant is that no connection is opened for an outbound
//! call, and no handler runs for an inbound one, unless the policy decider
//! allowed that exact (caller, callee, action) triple and the decision was
//! written to the audit sink. Both entry points return a `CallResult` for
//! every request; errors never escape as `Err`.

use std::any::Any;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde_json::Value;
use tokio::sync::oneshot;
use tokio::task::JoinError;
use tokio::time::{timeout, timeout_at, Instant};
use tracing::{debug, error, info, warn};

use trustlink_contracts::{
    audit::AuthorizationRecord,
    call::{Artifact, CallContext, CallMetadata, CallRequest, CallResult},
    error::{TrustlinkError, TrustlinkResult},
    identity::AgentId,
    policy::{Direction, PolicyContext, PolicyDecision, PolicyQuery},
    wire::{encode_frame, WireRequest},
};

use crate::pool::{Checkout, ConnectionManager};
use crate::registry::CapabilityRegistry;
use crate::retry::{retry_with_backoff, RetryPolicy};
use crate::traits::{AuditWriter, IdentityProvider, PolicyDecider};

/// Deadlines applied by the dispatcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DispatchSettings {
    /// Call deadline when the request carries none. Also bounds inbound
    /// handlers when the frame carries no deadline.
    pub default_timeout: Duration,
    /// How long a timed-out exchange may keep draining its late response
    /// before the connection is closed instead of returned to the pool.
    pub drain_grace: Duration,
}

impl Default for DispatchSettings {
    fn default() -> Self {
        Self {
            default_timeout: Duration::from_secs(10),
            drain_grace: Duration::from_secs(30),
        }
    }
}

/// Stand-in deadline for budgets too large to represent as an `Instant`.
const FAR_FUTURE: Duration = Duration::from_secs(86_400 * 365 * 30);

/// `start + budget`, capped instead of overflowing for huge budgets.
fn instant_after(start: Instant, budget: Duration) -> Instant {
    start
        .checked_add(budget)
        .unwrap_or_else(|| start + FAR_FUTURE)
}

/// Routes outbound calls to peers and inbound requests to local handlers.
///
/// One dispatcher serves the whole agent and is shared behind an `Arc`.
pub struct Dispatcher {
    identity: Arc<dyn IdentityProvider>,
    policy: Arc<dyn PolicyDecider>,
    registry: CapabilityRegistry,
    connections: Arc<ConnectionManager>,
    audit: Arc<dyn AuditWriter>,
    retry: RetryPolicy,
    settings: DispatchSettings,
}

impl Dispatcher {
    /// Create a dispatcher with default retry and deadline settings.
    pub fn new(
        identity: Arc<dyn IdentityProvider>,
        policy: Arc<dyn PolicyDecider>,
        registry: CapabilityRegistry,
        connections: Arc<ConnectionManager>,
        audit: Arc<dyn AuditWriter>,
    ) -> Self {
        Self {
            identity,
            policy,
            registry,
            connections,
            audit,
            retry: RetryPolicy::default(),
            settings: DispatchSettings::default(),
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_settings(mut self, settings: DispatchSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn registry(&self) -> &CapabilityRegistry {
        &self.registry
    }

    pub fn connections(&self) -> &Arc<ConnectionManager> {
        &self.connections
    }

    // ── Outbound ─────────────────────────────────────────────────────────────

    /// Convenience entry point taking the target as a string.
    ///
    /// A target that does not parse as an identity yields a `failed`
    /// result with kind `InvalidTarget`.
    pub async fn call(
        &self,
        target: &str,
        action: &str,
        payload: Value,
        timeout: Option<Duration>,
    ) -> CallResult {
        let target_id = match AgentId::parse(target) {
            Ok(id) => id,
            Err(e) => {
                let context = CallContext::new();
                let err = TrustlinkError::InvalidTarget {
                    reason: e.to_string(),
                };
                log_failure(Direction::Outbound, &context.trace_id, target, action, &err);
                return err.into_call_result().with_metadata(CallMetadata {
                    trace_id: context.trace_id,
                    ..CallMetadata::default()
                });
            }
        };

        let mut request = CallRequest::new(target_id, action, payload);
        request.context.timeout = timeout;
        self.submit_outbound(request).await
    }

    /// Submit one call to a remote agent.
    ///
    /// Always returns exactly one `CallResult`:
    ///
    /// - `rejected` when policy denies the call (no connection is attempted)
    /// - `failed` for an invalid target, an open circuit, connect failures
    ///   after retries, identity mismatch, transport errors, or timeout
    /// - whatever envelope the peer produced otherwise
    pub async fn submit_outbound(&self, request: CallRequest) -> CallResult {
        let started = Instant::now();
        let mut attempts = 0u32;

        let result = match self.outbound(&request, &mut attempts).await {
            Ok(result) => {
                debug!(
                    trace_id = %request.context.trace_id,
                    target = %request.target,
                    action = %request.action,
                    status = ?result.status,
                    attempts,
                    "outbound call finished"
                );
                result
            }
            Err(e) => {
                log_failure(
                    Direction::Outbound,
                    &request.context.trace_id,
                    request.target.as_str(),
                    &request.action,
                    &e,
                );
                e.into_call_result()
            }
        };

        result.with_metadata(CallMetadata {
            trace_id: request.context.trace_id.clone(),
            attempts,
            duration_ms: started.elapsed().as_millis() as u64,
        })
    }

    async fn outbound(
        &self,
        request: &CallRequest,
        attempts: &mut u32,
    ) -> TrustlinkResult<CallResult> {
        let local = self.identity.current()?;
        if request.target == local.id {
            return Err(TrustlinkError::InvalidTarget {
                reason: "target is this agent".to_string(),
            });
        }

        let budget = request
            .context
            .timeout
            .unwrap_or(self.settings.default_timeout);
        let budget_ms = u64::try_from(budget.as_millis()).unwrap_or(u64::MAX);
        let deadline = instant_after(Instant::now(), budget);

        // The frame is checked before anything touches the destination, so an
        // oversized payload is the caller's failure and never the peer's.
        let mut wire = WireRequest::from_call(request, Some(budget_ms));
        encode_frame(&wire)?;

        // ── Breaker ──────────────────────────────────────────────────────────
        let permit = self.connections.admit(&request.target)?;

        // ── Policy ───────────────────────────────────────────────────────────
        //
        // No connection exists yet. A deny returns before the transport is
        // touched.
        let query = PolicyQuery {
            caller: local.id.clone(),
            callee: request.target.clone(),
            action: request.action.clone(),
            context: PolicyContext {
                trace_id: request.context.trace_id.clone(),
                direction: Direction::Outbound,
                attributes: Value::Null,
            },
        };
        let decision = timeout_at(deadline, self.policy.evaluate(&query))
            .await
            .map_err(|_| TrustlinkError::Timeout { after_ms: budget_ms })?;

        self.record(Direction::Outbound, &query, &decision)?;
        if !decision.allow {
            return Err(TrustlinkError::PolicyDenied {
                reason: decision.denial_reason(),
            });
        }

        // Only connect-level failures are retried. The half-open trial is a
        // single bare attempt.
        let retry = if permit.is_trial() {
            RetryPolicy::single_attempt()
        } else {
            self.retry
        };
        let drain_until = instant_after(deadline, self.settings.drain_grace);
        let mut dial_only = false;

        loop {
            // ── Connect ──────────────────────────────────────────────────────
            let connections = &self.connections;
            let target = &request.target;
            let dialled = *attempts;
            let connect = retry_with_backoff(
                &retry,
                "connect",
                TrustlinkError::is_retryable,
                |attempt| {
                    *attempts = dialled + attempt;
                    async move {
                        if dial_only {
                            connections.dial(target).await
                        } else {
                            connections.checkout(target).await
                        }
                    }
                },
            );
            let Checkout { mut channel, reused } = match timeout_at(deadline, connect).await {
                Ok((Ok(checkout), _)) => checkout,
                Ok((Err(e), _)) => {
                    if e.trips_breaker() {
                        permit.fail();
                    }
                    return Err(e);
                }
                Err(_) => return Err(TrustlinkError::Timeout { after_ms: budget_ms }),
            };

            // ── Send ─────────────────────────────────────────────────────────
            //
            // The exchange runs in its own task. If the caller's deadline
            // passes first, the task keeps reading so the late response is
            // consumed and the connection goes back to the pool in a clean
            // state.
            let remaining = deadline.saturating_duration_since(Instant::now());
            wire.timeout_ms = Some(u64::try_from(remaining.as_millis()).unwrap_or(u64::MAX));
            let frame = wire.clone();
            let (tx, rx) = oneshot::channel();
            let pool = Arc::clone(&self.connections);
            let destination = request.target.clone();

            tokio::spawn(async move {
                let outcome = timeout_at(drain_until, channel.call(&frame)).await;
                match outcome {
                    Ok(Ok(result)) => {
                        pool.checkin(&destination, channel);
                        let _ = tx.send(Ok(result));
                    }
                    Ok(Err(e)) => {
                        let _ = tx.send(Err(e));
                    }
                    Err(_) => {
                        debug!(destination = %destination, "no response within drain window, connection closed");
                    }
                }
            });

            match timeout_at(deadline, rx).await {
                Ok(Ok(Ok(result))) => {
                    // Application-level failures from the peer still prove the
                    // destination healthy.
                    permit.succeed();
                    return Ok(result);
                }
                Ok(Ok(Err(TrustlinkError::ChannelClosed { reason }))) if reused && !dial_only => {
                    // The peer closed this pooled connection while it sat idle,
                    // e.g. across a restart. Its siblings are likely dead too.
                    debug!(
                        destination = %request.target,
                        reason = %reason,
                        "pooled connection was closed by the peer, dialling a new one"
                    );
                    self.connections.discard_idle(&request.target);
                    dial_only = true;
                }
                Ok(Ok(Err(e))) => {
                    if e.trips_breaker() {
                        permit.fail();
                    }
                    return Err(e);
                }
                Ok(Err(_)) => {
                    return Err(TrustlinkError::Transport {
                        reason: "exchange ended without a response".to_string(),
                    })
                }
                Err(_) => return Err(TrustlinkError::Timeout { after_ms: budget_ms }),
            }
        }
    }

    // ── Inbound ──────────────────────────────────────────────────────────────

    /// Handle one request received from `caller`.
    ///
    /// `caller` must be the identity proven by the peer certificate; the
    /// frame itself carries no identity.
    pub async fn handle_inbound(&self, caller: &AgentId, request: WireRequest) -> CallResult {
        let started = Instant::now();
        let trace_id = request.trace_id.clone();
        let action = request.action.clone();

        let result = match self.inbound(caller, request).await {
            Ok(artifacts) => {
                info!(
                    trace_id = %trace_id,
                    caller = %caller,
                    action = %action,
                    artifacts = artifacts.len(),
                    "inbound call completed"
                );
                CallResult::completed(artifacts)
            }
            Err(e) => {
                log_failure(Direction::Inbound, &trace_id, caller.as_str(), &action, &e);
                e.into_call_result()
            }
        };

        result.with_metadata(CallMetadata {
            trace_id,
            attempts: 0,
            duration_ms: started.elapsed().as_millis() as u64,
        })
    }

    async fn inbound(&self, caller: &AgentId, request: WireRequest) -> TrustlinkResult<Vec<Artifact>> {
        let local = self.identity.current()?;

        let query = PolicyQuery {
            caller: caller.clone(),
            callee: local.id,
            action: request.action.clone(),
            context: PolicyContext {
                trace_id: request.trace_id.clone(),
                direction: Direction::Inbound,
                attributes: Value::Null,
            },
        };
        let decision = self.policy.evaluate(&query).await;

        self.record(Direction::Inbound, &query, &decision)?;
        if !decision.allow {
            return Err(TrustlinkError::PolicyDenied {
                reason: decision.denial_reason(),
            });
        }

        debug!(
            trace_id = %request.trace_id,
            caller = %caller,
            action = %request.action,
            "policy allowed inbound call, dispatching"
        );

        // The handler runs in its own task so a panic cannot take down the
        // connection task, and so it can be cancelled at the deadline.
        let deadline = request
            .timeout_ms
            .map(Duration::from_millis)
            .unwrap_or(self.settings.default_timeout);
        let registry = self.registry.clone();
        let WireRequest { action, payload, .. } = request;
        let mut handle = tokio::spawn(async move { registry.dispatch(&action, payload).await });

        match timeout(deadline, &mut handle).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(join_error)) => Err(TrustlinkError::InternalHandlerError {
                reason: join_failure(join_error),
            }),
            Err(_) => {
                handle.abort();
                Err(TrustlinkError::Timeout {
                    after_ms: deadline.as_millis() as u64,
                })
            }
        }
    }

    // ── Audit ────────────────────────────────────────────────────────────────

    /// Write the authorization record for `decision`.
    ///
    /// A failed write is fatal for an allowed call. For a denied call the
    /// deny stands and the failure is only logged.
    fn record(
        &self,
        direction: Direction,
        query: &PolicyQuery,
        decision: &PolicyDecision,
    ) -> TrustlinkResult<()> {
        let record = AuthorizationRecord {
            direction,
            caller: query.caller.clone(),
            callee: query.callee.clone(),
            action: query.action.clone(),
            trace_id: query.context.trace_id.clone(),
            decision: decision.clone(),
            timestamp: Utc::now(),
        };

        match self.audit.write(&record) {
            Ok(()) => Ok(()),
            Err(e) if decision.allow => {
                error!(
                    trace_id = %record.trace_id,
                    error = %e,
                    "audit write failed, allowed call blocked"
                );
                Err(e)
            }
            Err(e) => {
                error!(
                    trace_id = %record.trace_id,
                    error = %e,
                    "audit write failed for denied call"
                );
                Ok(())
            }
        }
    }
}

fn log_failure(direction: Direction, trace_id: &str, peer: &str, action: &str, err: &TrustlinkError) {
    match err {
        TrustlinkError::PolicyDenied { reason } => warn!(
            ?direction,
            trace_id = %trace_id,
            peer = %peer,
            action = %action,
            reason = %reason,
            "policy denied call"
        ),
        TrustlinkError::IdentityMismatch { .. }
        | TrustlinkError::InternalHandlerError { .. }
        | TrustlinkError::AuditWriteFailed { .. }
        | TrustlinkError::IdentityUnavailable { .. } => error!(
            ?direction,
            trace_id = %trace_id,
            peer = %peer,
            action = %action,
            error = %err,
            "call failed"
        ),
        _ => warn!(
            ?direction,
            trace_id = %trace_id,
            peer = %peer,
            action = %action,
            error = %err,
            "call failed"
        ),
    }
}

fn join_failure(err: JoinError) -> String {
    if !err.is_panic() {
        return format!("handler task cancelled: {err}");
    }
    match panic_text(&*err.into_panic()) {
        Some(text) => format!("handler panicked: {text}"),
        None => "handler panicked".to_string(),
    }
}

fn panic_text(payload: &(dyn Any + Send)) -> Option<String> {
    payload
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
}

// ── Tests ────────────────────────────────────────────────────────────────────
