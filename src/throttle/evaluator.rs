//! Rule evaluators.
//!
//! An evaluator decides whether its rule applies to a request, builds the
//! throttle key and resolves it against the throttle state cache. Tier
//! evaluators can additionally enforce a node-local bound per key.

use std::collections::HashMap;
use std::time::{Instant, SystemTime};
use tracing::{debug, trace};

use super::cache::ThrottleStateCache;
use super::counter::{FixedWindowCounter, QuotaCounter, SlidingWindowLog, TimeWindow};
use super::request::{RequestEnvelope, RequestField, ThrottleKey};
use super::template::{StrategyConfig, TierTemplate};
use super::verdict::Eligibility;
use crate::error::Result;

/// Evaluates one rule against requests.
///
/// Each evaluator is owned by a single pipeline task, so `evaluate` takes
/// `&mut self` and state needs no locking. Returning an error means the
/// pipeline emits no verdict for that request.
pub trait RuleEvaluator: Send + 'static {
    fn evaluate(&mut self, request: &RequestEnvelope, cache: &ThrottleStateCache)
        -> Result<Eligibility>;
}

impl<F> RuleEvaluator for F
where
    F: FnMut(&RequestEnvelope, &ThrottleStateCache) -> Result<Eligibility> + Send + 'static,
{
    fn evaluate(
        &mut self,
        request: &RequestEnvelope,
        cache: &ThrottleStateCache,
    ) -> Result<Eligibility> {
        self(request, cache)
    }
}

/// Tracked keys below which expired local state is left in place.
const PRUNE_THRESHOLD: usize = 1024;

/// Per-key local state for a strategy.
#[derive(Debug)]
enum LocalLimit {
    Global,
    FixedWindow {
        limit: u64,
        unit: TimeWindow,
        counters: HashMap<ThrottleKey, FixedWindowCounter>,
    },
    SlidingWindow {
        limit: u64,
        unit: TimeWindow,
        logs: HashMap<ThrottleKey, SlidingWindowLog>,
    },
    Quota {
        quota: u64,
        period: TimeWindow,
        counters: HashMap<ThrottleKey, QuotaCounter>,
    },
}

impl LocalLimit {
    fn from_strategy(strategy: &StrategyConfig) -> Self {
        match strategy {
            StrategyConfig::Global => LocalLimit::Global,
            StrategyConfig::FixedWindow { requests_per_unit, unit } => LocalLimit::FixedWindow {
                limit: *requests_per_unit,
                unit: *unit,
                counters: HashMap::new(),
            },
            StrategyConfig::SlidingWindow { requests_per_unit, unit } => LocalLimit::SlidingWindow {
                limit: *requests_per_unit,
                unit: *unit,
                logs: HashMap::new(),
            },
            StrategyConfig::Quota { quota, period } => LocalLimit::Quota {
                quota: *quota,
                period: *period,
                counters: HashMap::new(),
            },
        }
    }

    /// Record a hit for `key`; `false` when the local bound is exhausted.
    fn admit(&mut self, key: &ThrottleKey, now: Instant, wall: SystemTime) -> bool {
        match self {
            LocalLimit::Global => true,
            LocalLimit::FixedWindow { limit, unit, counters } => counters
                .entry(key.clone())
                .or_insert_with(|| FixedWindowCounter::new(*limit, *unit))
                .hit(now),
            LocalLimit::SlidingWindow { limit, unit, logs } => logs
                .entry(key.clone())
                .or_insert_with(|| SlidingWindowLog::new(*limit, *unit))
                .hit(now),
            LocalLimit::Quota { quota, period, counters } => counters
                .entry(key.clone())
                .or_insert_with(|| QuotaCounter::new(*quota, *period))
                .consume(wall),
        }
    }

    /// Drop state for keys whose window or period has passed; a dropped key
    /// starts over exactly as if it had been reset in place.
    fn prune(&mut self, now: Instant, wall: SystemTime) -> usize {
        let before = self.tracked();
        match self {
            LocalLimit::Global => {}
            LocalLimit::FixedWindow { counters, .. } => counters.retain(|_, c| !c.is_expired(now)),
            LocalLimit::SlidingWindow { logs, .. } => logs.retain(|_, l| !l.is_expired(now)),
            LocalLimit::Quota { counters, .. } => counters.retain(|_, c| !c.is_expired(wall)),
        }
        before - self.tracked()
    }

    fn tracked(&self) -> usize {
        match self {
            LocalLimit::Global => 0,
            LocalLimit::FixedWindow { counters, .. } => counters.len(),
            LocalLimit::SlidingWindow { logs, .. } => logs.len(),
            LocalLimit::Quota { counters, .. } => counters.len(),
        }
    }
}

/// Evaluator built from a tier template.
#[derive(Debug)]
pub struct TierEvaluator {
    template: TierTemplate,
    key_fields: Vec<RequestField>,
    local: LocalLimit,
    /// Tracked-key count at which the next prune runs
    prune_at: usize,
}

impl TierEvaluator {
    pub fn from_template(template: &TierTemplate) -> Result<Self> {
        template.validate()?;
        Ok(Self {
            template: template.clone(),
            key_fields: template.key_fields(),
            local: LocalLimit::from_strategy(&template.strategy),
            prune_at: PRUNE_THRESHOLD,
        })
    }

    /// Keys currently holding local limit state.
    pub fn tracked_keys(&self) -> usize {
        self.local.tracked()
    }

    fn maybe_prune(&mut self, now: Instant, wall: SystemTime) {
        if self.local.tracked() < self.prune_at {
            return;
        }
        let removed = self.local.prune(now, wall);
        // Re-arm at twice the live key count.
        self.prune_at = (self.local.tracked() * 2).max(PRUNE_THRESHOLD);
        debug!(
            tier = %self.template.tier,
            removed,
            tracked = self.local.tracked(),
            "Pruned expired local limit state"
        );
    }
}

impl RuleEvaluator for TierEvaluator {
    fn evaluate(
        &mut self,
        request: &RequestEnvelope,
        cache: &ThrottleStateCache,
    ) -> Result<Eligibility> {
        if !self.template.is_eligible(request) {
            return Ok(Eligibility::not_eligible());
        }

        let key = ThrottleKey::from_fields(request, &self.key_fields);
        // Read once; the verdict is computed from this value only.
        let globally_throttled = cache.get(key.as_str());
        let (now, wall) = (Instant::now(), SystemTime::now());
        let throttled = globally_throttled || !self.local.admit(&key, now, wall);
        self.maybe_prune(now, wall);

        trace!(
            tier = %self.template.tier,
            key = %key,
            globally_throttled,
            throttled,
            "Resolved throttle key"
        );

        Ok(Eligibility::resolved(key, throttled))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::throttle::template::TemplateStore;
    use std::time::Duration;

    fn gold_request() -> RequestEnvelope {
        RequestEnvelope {
            app_key: "user1".to_string(),
            api_key: "api1".to_string(),
            resource_key: "/items".to_string(),
            app_tier: "Silver".to_string(),
            api_tier: "Gold".to_string(),
            resource_tier: "Unlimited".to_string(),
        }
    }

    fn evaluator(yaml: &str) -> TierEvaluator {
        let store = TemplateStore::from_yaml(yaml).unwrap();
        TierEvaluator::from_template(store.get("Gold").unwrap()).unwrap()
    }

    #[test]
    fn test_ineligible_request() {
        let mut eval = evaluator("name: g\ntier: Gold\nlevel: app\n");
        let cache = ThrottleStateCache::new();

        let result = eval.evaluate(&gold_request(), &cache).unwrap();
        assert_eq!(result, Eligibility::not_eligible());
    }

    #[test]
    fn test_unknown_key_not_throttled() {
        let mut eval = evaluator("name: g\ntier: Gold\nlevel: api\n");
        let cache = ThrottleStateCache::new();

        let result = eval.evaluate(&gold_request(), &cache).unwrap();
        assert!(result.eligible);
        assert!(!result.throttled);
        assert_eq!(result.key, Some(ThrottleKey::new("api1:user1")));
    }

    #[test]
    fn test_cached_state_throttles() {
        let mut eval = evaluator("name: g\ntier: Gold\nlevel: api\n");
        let cache = ThrottleStateCache::new();
        cache.put("api1:user1", true);

        let result = eval.evaluate(&gold_request(), &cache).unwrap();
        assert!(result.throttled);

        cache.put("api1:user1", false);
        let result = eval.evaluate(&gold_request(), &cache).unwrap();
        assert!(!result.throttled);
    }

    #[test]
    fn test_local_fixed_window_bound() {
        let mut eval = evaluator(
            r#"
name: g
tier: Gold
level: api
strategy:
  kind: fixed_window
  requests_per_unit: 2
  unit: minute
"#,
        );
        let cache = ThrottleStateCache::new();
        let request = gold_request();

        assert!(!eval.evaluate(&request, &cache).unwrap().throttled);
        assert!(!eval.evaluate(&request, &cache).unwrap().throttled);
        assert!(eval.evaluate(&request, &cache).unwrap().throttled);

        // A different key has its own counter
        let mut other = request.clone();
        other.app_key = "user2".to_string();
        assert!(!eval.evaluate(&other, &cache).unwrap().throttled);
    }

    #[test]
    fn test_local_quota_bound() {
        let mut eval = evaluator(
            r#"
name: g
tier: Gold
level: api
strategy:
  kind: quota
  quota: 1
  period: day
"#,
        );
        let cache = ThrottleStateCache::new();

        assert!(!eval.evaluate(&gold_request(), &cache).unwrap().throttled);
        assert!(eval.evaluate(&gold_request(), &cache).unwrap().throttled);
    }

    #[test]
    fn test_prune_drops_expired_keys() {
        let mut limit = LocalLimit::from_strategy(&StrategyConfig::FixedWindow {
            requests_per_unit: 5,
            unit: TimeWindow::Second,
        });
        let start = Instant::now();
        let wall = SystemTime::now();

        for i in 0..100 {
            assert!(limit.admit(&ThrottleKey::new(format!("user{}", i)), start, wall));
        }
        let later = start + Duration::from_secs(2);
        assert!(limit.admit(&ThrottleKey::new("fresh"), later, wall));
        assert_eq!(limit.tracked(), 101);

        assert_eq!(limit.prune(later, wall), 100);
        assert_eq!(limit.tracked(), 1);
    }

    #[test]
    fn test_prune_keeps_live_sliding_logs_and_quotas() {
        let start = Instant::now();
        let wall = SystemTime::now();

        let mut sliding = LocalLimit::from_strategy(&StrategyConfig::SlidingWindow {
            requests_per_unit: 1,
            unit: TimeWindow::Minute,
        });
        sliding.admit(&ThrottleKey::new("a"), start, wall);
        assert_eq!(sliding.prune(start + Duration::from_secs(30), wall), 0);
        assert_eq!(sliding.prune(start + Duration::from_secs(61), wall), 1);

        let mut quota = LocalLimit::from_strategy(&StrategyConfig::Quota {
            quota: 1,
            period: TimeWindow::Day,
        });
        quota.admit(&ThrottleKey::new("a"), start, wall);
        assert_eq!(quota.prune(start, wall), 0);
        assert_eq!(quota.prune(start, wall + Duration::from_secs(86_400)), 1);
        assert!(quota.admit(&ThrottleKey::new("a"), start, wall + Duration::from_secs(86_400)));
    }

    #[test]
    fn test_distinct_keys_do_not_accumulate() {
        let mut eval = evaluator(
            r#"
name: g
tier: Gold
level: api
strategy:
  kind: fixed_window
  requests_per_unit: 5
  unit: second
"#,
        );
        let cache = ThrottleStateCache::new();
        let mut request = gold_request();

        for i in 0..PRUNE_THRESHOLD - 1 {
            request.app_key = format!("user{}", i);
            eval.evaluate(&request, &cache).unwrap();
        }
        std::thread::sleep(Duration::from_millis(1100));

        request.app_key = "late".to_string();
        eval.evaluate(&request, &cache).unwrap();
        assert_eq!(eval.tracked_keys(), 1);
    }

    #[test]
    fn test_closure_evaluator() {
        let mut eval = |_: &RequestEnvelope, _: &ThrottleStateCache| -> Result<Eligibility> {
            Ok(Eligibility::resolved(ThrottleKey::new("k"), true))
        };
        let cache = ThrottleStateCache::new();
        assert!(RuleEvaluator::evaluate(&mut eval, &gold_request(), &cache).unwrap().throttled);
    }
}
