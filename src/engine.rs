//! The throttling engine.
//!
//! [`Throttler`] wires the cache, rule registry, coordinator and sync client
//! together. Construct it once at startup and share it by `Arc`.
//!
//! Lifecycle: `new` → `start` → `add_rule`/`is_throttled` → `stop`.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::info;

use crate::config::TollgateConfig;
use crate::error::Result;
use crate::sync::{bootstrap_cache, BootstrapSource, GlobalSyncClient, JsonFileSource};
use crate::throttle::{
    spawn_verdict_barrier, AdmissionCoordinator, DecisionRegistry, RequestEnvelope, Rule,
    RuleEvaluator, RuleId, RuleRegistry, TemplateStore, ThrottleStateCache,
};

/// Distributed admission control engine.
pub struct Throttler {
    config: TollgateConfig,
    cache: Arc<ThrottleStateCache>,
    rules: Arc<RuleRegistry>,
    coordinator: Arc<AdmissionCoordinator>,
    sync: Arc<GlobalSyncClient>,
    bootstrap: Mutex<Option<Box<dyn BootstrapSource>>>,
    barrier: Mutex<Option<JoinHandle<()>>>,
    started: AtomicBool,
}

impl std::fmt::Debug for Throttler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Throttler")
            .field("coordinator", &self.coordinator)
            .field("sync", &self.sync)
            .field("started", &self.started.load(Ordering::Relaxed))
            .finish()
    }
}

impl Throttler {
    /// Build an engine from configuration, loading templates and the
    /// bootstrap source it names. Must be called inside a Tokio runtime.
    pub fn new(config: TollgateConfig) -> Result<Self> {
        let templates = match &config.rules.templates_path {
            Some(path) => TemplateStore::from_file(path)?,
            None => TemplateStore::new(),
        };
        let bootstrap = config
            .bootstrap
            .path
            .as_ref()
            .map(|path| Box::new(JsonFileSource::new(path)) as Box<dyn BootstrapSource>);

        let throttler = Self::with_templates(config, templates);
        *throttler.bootstrap.lock() = bootstrap;
        Ok(throttler)
    }

    /// Build an engine with an explicit template store and no bootstrap source.
    pub fn with_templates(config: TollgateConfig, templates: TemplateStore) -> Self {
        let cache = Arc::new(ThrottleStateCache::new());
        let decisions = Arc::new(DecisionRegistry::new());
        let (verdict_tx, verdict_rx) = mpsc::channel(config.admission.verdict_queue_capacity);
        let barrier = spawn_verdict_barrier(decisions.clone(), verdict_rx);

        let rules = Arc::new(RuleRegistry::new(
            templates,
            cache.clone(),
            decisions.clone(),
            verdict_tx,
            config.admission.pipeline_queue_capacity,
        ));
        let sync = Arc::new(GlobalSyncClient::new(config.sync.clone(), cache.clone()));
        let coordinator = Arc::new(AdmissionCoordinator::new(
            rules.clone(),
            decisions,
            cache.clone(),
            sync.clone(),
            &config.admission,
        ));

        Self {
            config,
            cache,
            rules,
            coordinator,
            sync,
            bootstrap: Mutex::new(None),
            barrier: Mutex::new(Some(barrier)),
            started: AtomicBool::new(false),
        }
    }

    /// Replace the bootstrap source used by `start`.
    pub fn with_bootstrap_source(self, source: Box<dyn BootstrapSource>) -> Self {
        *self.bootstrap.lock() = Some(source);
        self
    }

    /// Seed the cache, open the authority connection and deploy the
    /// configured tiers. Calling it again is a no-op.
    pub async fn start(&self) -> Result<()> {
        if self.started.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        let source = self.bootstrap.lock().take();
        bootstrap_cache(&self.cache, source.as_deref()).await;

        self.sync.start();

        for tier in &self.config.rules.active_tiers {
            self.rules.add_rule(tier)?;
        }

        info!(
            rules = self.rules.rule_count(),
            cached_keys = self.cache.len(),
            "Throttler started"
        );
        Ok(())
    }

    /// Deploy a rule for `tier` from its template.
    pub fn add_rule(&self, tier: &str) -> Result<RuleId> {
        self.rules.add_rule(tier)
    }

    /// Deploy a rule backed by a custom evaluator.
    pub fn add_evaluator(
        &self,
        tier: &str,
        strategy: &str,
        evaluator: Box<dyn RuleEvaluator>,
    ) -> RuleId {
        self.rules.add_evaluator(tier, strategy, evaluator)
    }

    /// Remove a rule; decisions already in flight still count it.
    pub fn remove_rule(&self, id: RuleId) -> Result<Rule> {
        self.rules.remove_rule(id)
    }

    /// Whether `request` must be rejected.
    pub async fn is_throttled(&self, request: RequestEnvelope) -> bool {
        self.coordinator.evaluate(request).await
    }

    /// Apply a throttle state change pushed by the rate authority.
    pub fn on_global_update(&self, key: &str, throttled: bool) {
        self.sync.on_global_update(key, throttled);
    }

    /// Stop accepting decisions, settle in-flight ones and flush outbound
    /// notifications.
    pub async fn stop(&self) {
        let grace = self.config.admission.shutdown_grace();
        self.coordinator.shutdown(grace).await;
        let removed = self.rules.clear();
        self.sync.shutdown(grace).await;

        if let Some(barrier) = self.barrier.lock().take() {
            barrier.abort();
        }
        info!(rules_removed = removed, "Throttler stopped");
    }

    pub fn cache(&self) -> &Arc<ThrottleStateCache> {
        &self.cache
    }

    pub fn coordinator(&self) -> &Arc<AdmissionCoordinator> {
        &self.coordinator
    }

    pub fn sync_client(&self) -> &Arc<GlobalSyncClient> {
        &self.sync
    }

    pub fn rules(&self) -> Vec<Rule> {
        self.rules.rules()
    }

    pub fn config(&self) -> &TollgateConfig {
        &self.config
    }
}
