//! Rule identities and the verdicts rules emit.

use std::fmt;
use uuid::Uuid;

use super::request::ThrottleKey;
use super::template::TierLevel;

/// Identifier of a deployed rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RuleId(pub u64);

impl fmt::Display for RuleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "rule-{}", self.0)
    }
}

/// Identifier tying verdicts to the decision that requested them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CorrelationId(Uuid);

impl CorrelationId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for CorrelationId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// A deployed rule. Immutable once registered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rule {
    pub id: RuleId,
    pub tier: String,
    pub level: Option<TierLevel>,
    pub strategy: String,
}

/// What a rule evaluator concluded about one request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Eligibility {
    pub eligible: bool,
    pub throttled: bool,
    pub key: Option<ThrottleKey>,
}

impl Eligibility {
    /// The rule does not apply to the request.
    pub fn not_eligible() -> Self {
        Self {
            eligible: false,
            throttled: false,
            key: None,
        }
    }

    /// The rule applies and resolved `key` to `throttled`.
    pub fn resolved(key: ThrottleKey, throttled: bool) -> Self {
        Self {
            eligible: true,
            throttled,
            key: Some(key),
        }
    }
}

/// One rule's answer for one decision.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Verdict {
    pub rule_id: RuleId,
    pub correlation_id: CorrelationId,
    pub eligible: bool,
    pub throttled: bool,
    pub key: Option<ThrottleKey>,
}

impl Verdict {
    pub fn new(rule_id: RuleId, correlation_id: CorrelationId, eligibility: Eligibility) -> Self {
        Self {
            rule_id,
            correlation_id,
            eligible: eligibility.eligible,
            throttled: eligibility.throttled,
            key: eligibility.key,
        }
    }
}
