//! Admission decisions: rules, verdicts and throttle state.

mod cache;
mod coordinator;
mod counter;
mod decision;
mod evaluator;
mod pipeline;
mod registry;
mod request;
mod template;
mod verdict;

pub use cache::{ThrottleEntry, ThrottleStateCache};
pub use coordinator::{
    spawn_verdict_barrier, AdmissionCoordinator, CoordinatorStats, Decision, ServedNotifier,
};
pub use counter::TimeWindow;
pub use decision::{DecisionRegistry, Delivery, Resolution};
pub use evaluator::{RuleEvaluator, TierEvaluator};
pub use registry::{RuleRegistry, RuleSnapshot};
pub use request::{RequestEnvelope, RequestField, ThrottleKey};
pub use template::{StrategyConfig, TemplateStore, TierLevel, TierTemplate};
pub use verdict::{CorrelationId, Eligibility, Rule, RuleId, Verdict};
