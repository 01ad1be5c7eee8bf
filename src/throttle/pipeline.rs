//! Rule pipelines.
//!
//! A pipeline couples one rule with a task that owns its evaluator. Requests
//! arrive on the pipeline's job queue; verdicts leave through the shared
//! verdict channel that feeds the decision registry.

use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, trace, warn};

use super::cache::ThrottleStateCache;
use super::decision::DecisionRegistry;
use super::evaluator::RuleEvaluator;
use super::request::RequestEnvelope;
use super::verdict::{CorrelationId, Rule, RuleId, Verdict};
use crate::error::{Result, TollgateError};

/// A request tagged with the decision it belongs to.
#[derive(Debug)]
struct Job {
    correlation_id: CorrelationId,
    request: Arc<RequestEnvelope>,
}

/// Handle to a running rule pipeline.
///
/// The task exits once every handle has been dropped and its queue drained,
/// which lets decisions that snapshotted a removed rule still complete.
#[derive(Debug)]
pub struct RulePipeline {
    rule: Rule,
    jobs: mpsc::Sender<Job>,
}

impl RulePipeline {
    /// Spawn the pipeline task for `rule`.
    pub fn spawn(
        rule: Rule,
        evaluator: Box<dyn RuleEvaluator>,
        cache: Arc<ThrottleStateCache>,
        decisions: Arc<DecisionRegistry>,
        verdicts: mpsc::Sender<Verdict>,
        capacity: usize,
    ) -> Self {
        let (jobs, rx) = mpsc::channel(capacity);
        tokio::spawn(run(rule.id, evaluator, rx, cache, decisions, verdicts));
        debug!(rule = %rule.id, tier = %rule.tier, strategy = %rule.strategy, "Pipeline started");
        Self { rule, jobs }
    }

    pub fn rule(&self) -> &Rule {
        &self.rule
    }

    pub fn id(&self) -> RuleId {
        self.rule.id
    }

    /// Queue `request` for evaluation under `correlation_id`.
    pub async fn dispatch(
        &self,
        correlation_id: CorrelationId,
        request: Arc<RequestEnvelope>,
    ) -> Result<()> {
        self.jobs
            .send(Job {
                correlation_id,
                request,
            })
            .await
            .map_err(|_| {
                TollgateError::InternalInvariant(format!("pipeline for {} is closed", self.rule.id))
            })
    }
}

async fn run(
    rule_id: RuleId,
    mut evaluator: Box<dyn RuleEvaluator>,
    mut jobs: mpsc::Receiver<Job>,
    cache: Arc<ThrottleStateCache>,
    decisions: Arc<DecisionRegistry>,
    verdicts: mpsc::Sender<Verdict>,
) {
    while let Some(job) = jobs.recv().await {
        // Skip work for decisions that timed out or were cancelled.
        if !decisions.is_pending(&job.correlation_id) {
            trace!(rule = %rule_id, correlation_id = %job.correlation_id, "Skipping retired decision");
            continue;
        }

        match evaluator.evaluate(&job.request, &cache) {
            Ok(eligibility) => {
                let verdict = Verdict::new(rule_id, job.correlation_id, eligibility);
                if verdicts.send(verdict).await.is_err() {
                    warn!(rule = %rule_id, "Verdict channel closed, stopping pipeline");
                    break;
                }
            }
            Err(err) => {
                warn!(
                    rule = %rule_id,
                    correlation_id = %job.correlation_id,
                    error = %err,
                    "Rule evaluation failed, no verdict emitted"
                );
            }
        }
    }

    debug!(rule = %rule_id, "Pipeline stopped");
}
