//! Pending decision bookkeeping.
//!
//! Every in-flight admission decision has exactly one [`PendingDecision`] in
//! the [`DecisionRegistry`], keyed by its correlation id. Verdicts reach it
//! only through [`DecisionRegistry::deliver`]. An entry leaves the registry
//! exactly once: whichever of completion, timeout, cancellation or shutdown
//! removes it first owns it, and later attempts are no-ops.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::sync::oneshot;
use tracing::{error, trace, warn};

use super::request::ThrottleKey;
use super::verdict::{CorrelationId, RuleId, Verdict};
use crate::error::{Result, TollgateError};

/// Aggregated outcome of a completed decision.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resolution {
    /// `true` if any verdict reported the request as throttled
    pub throttled: bool,
    /// Throttle keys resolved by eligible rules
    pub keys: Vec<ThrottleKey>,
    /// Number of verdicts aggregated
    pub verdicts: usize,
}

/// Verdict collection state for one correlation id.
#[derive(Debug)]
pub struct PendingDecision {
    expected: HashSet<RuleId>,
    received: HashSet<RuleId>,
    throttled: bool,
    keys: Vec<ThrottleKey>,
    completion: Option<oneshot::Sender<Resolution>>,
}

impl PendingDecision {
    fn new(expected: HashSet<RuleId>) -> (Self, oneshot::Receiver<Resolution>) {
        let (tx, rx) = oneshot::channel();
        let decision = Self {
            expected,
            received: HashSet::new(),
            throttled: false,
            keys: Vec::new(),
            completion: Some(tx),
        };
        (decision, rx)
    }

    fn record(&mut self, verdict: Verdict) -> Result<()> {
        if !self.expected.contains(&verdict.rule_id) {
            return Err(TollgateError::InternalInvariant(format!(
                "verdict from {} which is not part of decision {}",
                verdict.rule_id, verdict.correlation_id
            )));
        }
        if self.received.len() >= self.expected.len() {
            return Err(TollgateError::InternalInvariant(format!(
                "decision {} already has all {} verdicts",
                verdict.correlation_id,
                self.expected.len()
            )));
        }
        if !self.received.insert(verdict.rule_id) {
            return Err(TollgateError::InternalInvariant(format!(
                "duplicate verdict from {} for decision {}",
                verdict.rule_id, verdict.correlation_id
            )));
        }

        self.throttled |= verdict.throttled;
        if let Some(key) = verdict.key.filter(|_| verdict.eligible) {
            if !self.keys.contains(&key) {
                self.keys.push(key);
            }
        }
        Ok(())
    }

    pub fn is_complete(&self) -> bool {
        self.received.len() == self.expected.len()
    }

    /// Whether any verdict received so far reported throttled.
    pub fn throttled(&self) -> bool {
        self.throttled
    }

    pub fn expected(&self) -> usize {
        self.expected.len()
    }

    pub fn received(&self) -> usize {
        self.received.len()
    }

    pub fn resolution(&self) -> Resolution {
        Resolution {
            throttled: self.throttled,
            keys: self.keys.clone(),
            verdicts: self.received.len(),
        }
    }

    fn complete(mut self) {
        if let Some(tx) = self.completion.take() {
            // The waiter may already be gone (cancelled); nothing to do then.
            let _ = tx.send(self.resolution());
        }
    }
}

/// Result of handing a verdict to the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// Counted; more verdicts are outstanding
    Recorded,
    /// Counted and the decision is now complete
    Completed,
    /// No pending decision for this id (retired or never registered)
    Late,
    /// Refused because it would break the decision's bookkeeping
    Rejected,
}

/// Concurrent registry of in-flight decisions.
#[derive(Debug, Default)]
pub struct DecisionRegistry {
    pending: DashMap<CorrelationId, PendingDecision>,
    late_verdicts: AtomicU64,
    invariant_violations: AtomicU64,
}

impl DecisionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a decision expecting one verdict from each of `expected`.
    pub fn register(
        &self,
        id: CorrelationId,
        expected: HashSet<RuleId>,
    ) -> Result<oneshot::Receiver<Resolution>> {
        match self.pending.entry(id) {
            Entry::Occupied(_) => Err(TollgateError::InternalInvariant(format!(
                "correlation id {} is already pending",
                id
            ))),
            Entry::Vacant(slot) => {
                let (decision, rx) = PendingDecision::new(expected);
                slot.insert(decision);
                Ok(rx)
            }
        }
    }

    /// The only entry point through which verdicts mutate a pending decision.
    pub fn deliver(&self, verdict: Verdict) -> Delivery {
        let id = verdict.correlation_id;
        let rule_id = verdict.rule_id;

        let Some(mut decision) = self.pending.get_mut(&id) else {
            self.late_verdicts.fetch_add(1, Ordering::Relaxed);
            warn!(
                correlation_id = %id,
                rule = %rule_id,
                "Verdict for unknown or retired decision"
            );
            return Delivery::Late;
        };

        if let Err(err) = decision.record(verdict) {
            drop(decision);
            self.invariant_violations.fetch_add(1, Ordering::Relaxed);
            error!(correlation_id = %id, rule = %rule_id, error = %err, "Rejected verdict");
            return Delivery::Rejected;
        }

        trace!(
            correlation_id = %id,
            rule = %rule_id,
            received = decision.received(),
            expected = decision.expected(),
            "Verdict recorded"
        );

        let complete = decision.is_complete();
        drop(decision);
        if !complete {
            return Delivery::Recorded;
        }

        match self.pending.remove_if(&id, |_, d| d.is_complete()) {
            Some((_, decision)) => {
                decision.complete();
                Delivery::Completed
            }
            // Retired concurrently; the retiring side owns the outcome.
            None => Delivery::Recorded,
        }
    }

    /// Record a verdict without completing the decision, leaving it in the
    /// state `deliver` passes through between recording and removal.
    #[cfg(test)]
    pub(crate) fn record_only(&self, verdict: Verdict) -> Result<()> {
        let id = verdict.correlation_id;
        self.pending
            .get_mut(&id)
            .ok_or_else(|| TollgateError::InternalInvariant(format!("{} is not pending", id)))?
            .record(verdict)
    }

    /// Remove a decision. Returns `None` if it was already removed.
    pub fn retire(&self, id: &CorrelationId) -> Option<PendingDecision> {
        self.pending.remove(id).map(|(_, decision)| decision)
    }

    pub fn is_pending(&self, id: &CorrelationId) -> bool {
        self.pending.contains_key(id)
    }

    /// Drop every pending decision; their waiters observe cancellation.
    pub fn cancel_all(&self) -> usize {
        let ids: Vec<CorrelationId> = self.pending.iter().map(|e| *e.key()).collect();
        ids.iter().filter(|id| self.retire(id).is_some()).count()
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Verdicts that arrived after their decision was retired.
    pub fn late_verdicts(&self) -> u64 {
        self.late_verdicts.load(Ordering::Relaxed)
    }

    /// Verdicts refused for breaking bookkeeping invariants.
    pub fn invariant_violations(&self) -> u64 {
        self.invariant_violations.load(Ordering::Relaxed)
    }
}
