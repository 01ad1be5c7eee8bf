//! Registry of active rules.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use tokio::sync::mpsc;
use tracing::info;

use super::cache::ThrottleStateCache;
use super::decision::DecisionRegistry;
use super::evaluator::{RuleEvaluator, TierEvaluator};
use super::pipeline::RulePipeline;
use super::template::TemplateStore;
use super::verdict::{Rule, RuleId, Verdict};
use crate::error::{Result, TollgateError};

/// A consistent view of the active rules at one instant.
#[derive(Debug, Clone, Default)]
pub struct RuleSnapshot {
    pipelines: Vec<Arc<RulePipeline>>,
}

impl RuleSnapshot {
    pub fn len(&self) -> usize {
        self.pipelines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pipelines.is_empty()
    }

    pub fn pipelines(&self) -> &[Arc<RulePipeline>] {
        &self.pipelines
    }

    pub fn rule_ids(&self) -> impl Iterator<Item = RuleId> + '_ {
        self.pipelines.iter().map(|p| p.id())
    }
}

/// Owns the active rule pipelines.
pub struct RuleRegistry {
    templates: TemplateStore,
    pipelines: RwLock<Vec<Arc<RulePipeline>>>,
    next_id: AtomicU64,
    cache: Arc<ThrottleStateCache>,
    decisions: Arc<DecisionRegistry>,
    verdicts: mpsc::Sender<Verdict>,
    queue_capacity: usize,
}

impl std::fmt::Debug for RuleRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RuleRegistry")
            .field("rules", &self.rule_count())
            .field("templates", &self.templates.len())
            .finish()
    }
}

impl RuleRegistry {
    pub fn new(
        templates: TemplateStore,
        cache: Arc<ThrottleStateCache>,
        decisions: Arc<DecisionRegistry>,
        verdicts: mpsc::Sender<Verdict>,
        queue_capacity: usize,
    ) -> Self {
        Self {
            templates,
            pipelines: RwLock::new(Vec::new()),
            next_id: AtomicU64::new(1),
            cache,
            decisions,
            verdicts,
            queue_capacity,
        }
    }

    /// Deploy a rule for `tier` from its template.
    ///
    /// Nothing is registered if the tier is unknown or its template is invalid.
    pub fn add_rule(&self, tier: &str) -> Result<RuleId> {
        let (evaluator, level, strategy) = {
            let template = self.templates.get(tier).ok_or_else(|| {
                TollgateError::Config(format!("no template for tier '{}'", tier))
            })?;
            let evaluator = TierEvaluator::from_template(template)?;
            (evaluator, template.level, template.strategy.name().to_string())
        };

        let rule = Rule {
            id: self.allocate_id(),
            tier: tier.to_string(),
            level: Some(level),
            strategy,
        };
        Ok(self.register(rule, Box::new(evaluator)))
    }

    /// Deploy a rule backed by a custom evaluator.
    pub fn add_evaluator(
        &self,
        tier: &str,
        strategy: &str,
        evaluator: Box<dyn RuleEvaluator>,
    ) -> RuleId {
        let rule = Rule {
            id: self.allocate_id(),
            tier: tier.to_string(),
            level: None,
            strategy: strategy.to_string(),
        };
        self.register(rule, evaluator)
    }

    /// Remove a rule from future decisions.
    ///
    /// Decisions that already snapshotted the rule still get its verdict;
    /// the pipeline stops once they have all released it.
    pub fn remove_rule(&self, id: RuleId) -> Result<Rule> {
        let mut pipelines = self.pipelines.write();
        let index = pipelines
            .iter()
            .position(|p| p.id() == id)
            .ok_or_else(|| TollgateError::Config(format!("unknown rule {}", id)))?;
        let pipeline = pipelines.remove(index);
        info!(rule = %id, tier = %pipeline.rule().tier, remaining = pipelines.len(), "Rule removed");
        Ok(pipeline.rule().clone())
    }

    /// Remove every rule.
    pub fn clear(&self) -> usize {
        let mut pipelines = self.pipelines.write();
        let removed = pipelines.len();
        pipelines.clear();
        removed
    }

    /// Snapshot the active rules; count and pipelines come from one read.
    pub fn snapshot(&self) -> RuleSnapshot {
        RuleSnapshot {
            pipelines: self.pipelines.read().clone(),
        }
    }

    pub fn rule_count(&self) -> usize {
        self.pipelines.read().len()
    }

    pub fn rules(&self) -> Vec<Rule> {
        self.pipelines.read().iter().map(|p| p.rule().clone()).collect()
    }

    fn allocate_id(&self) -> RuleId {
        RuleId(self.next_id.fetch_add(1, Ordering::Relaxed))
    }

    fn register(&self, rule: Rule, evaluator: Box<dyn RuleEvaluator>) -> RuleId {
        let id = rule.id;
        let tier = rule.tier.clone();
        let pipeline = RulePipeline::spawn(
            rule,
            evaluator,
            self.cache.clone(),
            self.decisions.clone(),
            self.verdicts.clone(),
            self.queue_capacity,
        );

        let mut pipelines = self.pipelines.write();
        pipelines.push(Arc::new(pipeline));
        info!(rule = %id, tier = %tier, rules = pipelines.len(), "Rule added");
        id
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::throttle::request::RequestEnvelope;
    use crate::throttle::verdict::Eligibility;

    fn registry(templates: TemplateStore) -> RuleRegistry {
        let (tx, _rx) = mpsc::channel(16);
        RuleRegistry::new(
            templates,
            Arc::new(ThrottleStateCache::new()),
            Arc::new(DecisionRegistry::new()),
            tx,
            16,
        )
    }

    fn gold_templates() -> TemplateStore {
        TemplateStore::from_yaml("name: gold\ntier: Gold\nlevel: app\n").unwrap()
    }

    #[tokio::test]
    async fn test_add_rule_from_template() {
        let registry = registry(gold_templates());
        let id = registry.add_rule("Gold").unwrap();

        assert_eq!(registry.rule_count(), 1);
        let rules = registry.rules();
        assert_eq!(rules[0].id, id);
        assert_eq!(rules[0].strategy, "global");
    }

    #[tokio::test]
    async fn test_unknown_tier_registers_nothing() {
        let registry = registry(gold_templates());
        let result = registry.add_rule("Platinum");

        assert!(matches!(result, Err(TollgateError::Config(_))));
        assert_eq!(registry.rule_count(), 0);
    }

    #[tokio::test]
    async fn test_remove_rule() {
        let registry = registry(gold_templates());
        let first = registry.add_rule("Gold").unwrap();
        let second = registry.add_rule("Gold").unwrap();
        assert_ne!(first, second);

        let removed = registry.remove_rule(first).unwrap();
        assert_eq!(removed.id, first);
        assert_eq!(registry.rule_count(), 1);
        assert!(registry.remove_rule(first).is_err());
    }

    #[tokio::test]
    async fn test_snapshot_is_stable() {
        let registry = registry(gold_templates());
        registry.add_rule("Gold").unwrap();

        let snapshot = registry.snapshot();
        registry.add_evaluator(
            "Any",
            "custom",
            Box::new(|_: &RequestEnvelope, _: &ThrottleStateCache| -> Result<Eligibility> {
                Ok(Eligibility::not_eligible())
            }),
        );

        assert_eq!(snapshot.len(), 1);
        assert_eq!(registry.rule_count(), 2);
    }
}
