//! Admission decision coordinator.
//!
//! Fans each request out to a snapshot of the active rule pipelines, waits
//! for one verdict per rule on a per-request completion handle, and
//! aggregates them with logical OR. Waiting is bounded; when the verdicts
//! cannot be collected the configured [`FailurePolicy`] decides.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{timeout_at, Instant};
use tracing::{debug, info, warn};

use super::cache::ThrottleStateCache;
use super::decision::{DecisionRegistry, Resolution};
use super::registry::RuleRegistry;
use super::request::{RequestEnvelope, ThrottleKey};
use super::verdict::{CorrelationId, Verdict};
use crate::config::{AdmissionConfig, FailurePolicy};
use crate::error::{Result, TollgateError};

/// Receives requests that were let through.
///
/// Implementations must not block: this runs on the request path.
pub trait ServedNotifier: Send + Sync {
    fn notify_served(&self, request: &RequestEnvelope, keys: &[ThrottleKey]);
}

/// The outcome of one admission decision.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Decision {
    pub throttled: bool,
    /// Keys resolved by eligible rules
    pub keys: Vec<ThrottleKey>,
    /// Number of rules the request was evaluated against
    pub rules: usize,
}

impl Decision {
    fn unrestricted() -> Self {
        Self {
            throttled: false,
            keys: Vec::new(),
            rules: 0,
        }
    }
}

/// Counters describing coordinator activity.
#[derive(Debug, Default)]
pub struct CoordinatorStats {
    decisions: AtomicU64,
    throttled: AtomicU64,
    timeouts: AtomicU64,
    cancelled: AtomicU64,
}

impl CoordinatorStats {
    pub fn decisions(&self) -> u64 {
        self.decisions.load(Ordering::Relaxed)
    }

    pub fn throttled(&self) -> u64 {
        self.throttled.load(Ordering::Relaxed)
    }

    pub fn timeouts(&self) -> u64 {
        self.timeouts.load(Ordering::Relaxed)
    }

    pub fn cancelled(&self) -> u64 {
        self.cancelled.load(Ordering::Relaxed)
    }
}

/// Drain the shared verdict channel into the decision registry.
pub fn spawn_verdict_barrier(
    decisions: Arc<DecisionRegistry>,
    mut verdicts: mpsc::Receiver<Verdict>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(verdict) = verdicts.recv().await {
            decisions.deliver(verdict);
        }
        debug!("Verdict channel closed");
    })
}

/// Retires the decision when the waiting future goes away, including when
/// the caller abandons it mid-wait.
struct RetireGuard<'a> {
    decisions: &'a DecisionRegistry,
    id: CorrelationId,
}

impl Drop for RetireGuard<'_> {
    fn drop(&mut self) {
        if self.decisions.retire(&self.id).is_some() {
            debug!(correlation_id = %self.id, "Pending decision cancelled by caller");
        }
    }
}

/// The synchronization barrier between callers and rule pipelines.
pub struct AdmissionCoordinator {
    rules: Arc<RuleRegistry>,
    decisions: Arc<DecisionRegistry>,
    cache: Arc<ThrottleStateCache>,
    notifier: Arc<dyn ServedNotifier>,
    timeout: Duration,
    policy: FailurePolicy,
    accepting: AtomicBool,
    stats: CoordinatorStats,
}

impl std::fmt::Debug for AdmissionCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdmissionCoordinator")
            .field("rules", &self.rules)
            .field("pending", &self.decisions.len())
            .field("timeout", &self.timeout)
            .field("policy", &self.policy)
            .finish()
    }
}

impl AdmissionCoordinator {
    pub fn new(
        rules: Arc<RuleRegistry>,
        decisions: Arc<DecisionRegistry>,
        cache: Arc<ThrottleStateCache>,
        notifier: Arc<dyn ServedNotifier>,
        config: &AdmissionConfig,
    ) -> Self {
        Self {
            rules,
            decisions,
            cache,
            notifier,
            timeout: config.decision_timeout(),
            policy: config.failure_policy,
            accepting: AtomicBool::new(true),
            stats: CoordinatorStats::default(),
        }
    }

    /// Decide whether `request` is throttled.
    ///
    /// Runtime failures never surface here; they resolve per the failure policy.
    pub async fn evaluate(&self, request: RequestEnvelope) -> bool {
        match self.try_evaluate(request).await {
            Ok(decision) => decision.throttled,
            Err(err) => {
                let fallback = self.policy.throttled();
                warn!(error = %err, policy = ?self.policy, throttled = fallback, "Applying failure policy");
                fallback
            }
        }
    }

    /// Decide whether `request` is throttled, reporting why a decision could
    /// not be reached.
    pub async fn try_evaluate(&self, request: RequestEnvelope) -> Result<Decision> {
        if !self.accepting.load(Ordering::Acquire) {
            return Err(TollgateError::ShuttingDown);
        }

        let deadline = Instant::now() + self.timeout;
        if !self.cache.is_ready() {
            timeout_at(deadline, self.cache.wait_ready())
                .await
                .map_err(|_| TollgateError::Timeout(self.timeout))?;
        }

        let snapshot = self.rules.snapshot();
        if snapshot.is_empty() {
            return Ok(Decision::unrestricted());
        }

        let id = CorrelationId::new();
        let mut completion = self.decisions.register(id, snapshot.rule_ids().collect())?;
        let _guard = RetireGuard {
            decisions: &self.decisions,
            id,
        };
        let request = Arc::new(request);

        let outcome = timeout_at(deadline, async {
            for pipeline in snapshot.pipelines() {
                if let Err(err) = pipeline.dispatch(id, request.clone()).await {
                    warn!(correlation_id = %id, rule = %pipeline.id(), error = %err, "Dispatch failed");
                }
            }
            (&mut completion).await
        })
        .await;

        let resolution = match outcome {
            Ok(Ok(resolution)) => resolution,
            Ok(Err(_)) => {
                self.stats.cancelled.fetch_add(1, Ordering::Relaxed);
                return Err(TollgateError::Cancelled);
            }
            Err(_) => self.resolve_expired(id, &mut completion)?,
        };

        let decision = Decision {
            throttled: resolution.throttled,
            keys: resolution.keys,
            rules: snapshot.len(),
        };

        self.stats.decisions.fetch_add(1, Ordering::Relaxed);
        if decision.throttled {
            self.stats.throttled.fetch_add(1, Ordering::Relaxed);
        } else {
            self.notifier.notify_served(&request, &decision.keys);
        }

        debug!(
            correlation_id = %id,
            throttled = decision.throttled,
            rules = decision.rules,
            "Admission decision made"
        );
        Ok(decision)
    }

    /// The deadline passed: whoever removes the pending entry first decides
    /// the outcome.
    fn resolve_expired(
        &self,
        id: CorrelationId,
        completion: &mut tokio::sync::oneshot::Receiver<Resolution>,
    ) -> Result<Resolution> {
        match self.decisions.retire(&id) {
            Some(pending) if pending.is_complete() => Ok(pending.resolution()),
            Some(pending) => {
                self.stats.timeouts.fetch_add(1, Ordering::Relaxed);
                warn!(
                    correlation_id = %id,
                    received = pending.received(),
                    expected = pending.expected(),
                    "Decision timed out"
                );
                // OR is monotonic: one throttled verdict already settles it.
                if pending.throttled() {
                    return Ok(pending.resolution());
                }
                Err(TollgateError::Timeout(self.timeout))
            }
            None => completion.try_recv().map_err(|_| {
                self.stats.cancelled.fetch_add(1, Ordering::Relaxed);
                TollgateError::Cancelled
            }),
        }
    }

    /// Stop accepting decisions, give in-flight ones `grace` to finish, then
    /// cancel the rest.
    pub async fn shutdown(&self, grace: Duration) {
        self.accepting.store(false, Ordering::Release);

        let deadline = Instant::now() + grace;
        while !self.decisions.is_empty() && Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        let cancelled = self.decisions.cancel_all();
        if cancelled > 0 {
            warn!(cancelled, "Cancelled in-flight decisions at shutdown");
        }
        info!(decisions = self.stats.decisions(), "Admission coordinator stopped");
    }

    pub fn is_accepting(&self) -> bool {
        self.accepting.load(Ordering::Acquire)
    }

    pub fn pending(&self) -> usize {
        self.decisions.len()
    }

    pub fn stats(&self) -> &CoordinatorStats {
        &self.stats
    }
}
