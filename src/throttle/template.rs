//! Tier templates and their loading.
//!
//! A template describes one deployable rule: which requests it applies to
//! (tier at a given level), how the throttle key is built, and which local
//! strategy backs the globally synchronized state.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use tracing::info;

use super::counter::TimeWindow;
use super::request::{RequestEnvelope, RequestField};
use crate::error::{Result, TollgateError};

/// The request level a tier applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TierLevel {
    App,
    Api,
    Resource,
}

impl TierLevel {
    /// The envelope field carrying the tier for this level.
    pub fn tier_field(&self) -> RequestField {
        match self {
            TierLevel::App => RequestField::AppTier,
            TierLevel::Api => RequestField::ApiTier,
            TierLevel::Resource => RequestField::ResourceTier,
        }
    }

    /// Key fields used when a template does not list its own.
    pub fn default_key_fields(&self) -> Vec<RequestField> {
        match self {
            TierLevel::App => vec![RequestField::AppKey],
            TierLevel::Api => vec![RequestField::ApiKey, RequestField::AppKey],
            TierLevel::Resource => vec![RequestField::ResourceKey, RequestField::AppKey],
        }
    }
}

/// Local strategy backing a rule.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StrategyConfig {
    /// Rely solely on the state pushed by the rate authority
    #[default]
    Global,
    FixedWindow {
        requests_per_unit: u64,
        unit: TimeWindow,
    },
    SlidingWindow {
        requests_per_unit: u64,
        unit: TimeWindow,
    },
    Quota {
        quota: u64,
        period: TimeWindow,
    },
}

impl StrategyConfig {
    pub fn name(&self) -> &'static str {
        match self {
            StrategyConfig::Global => "global",
            StrategyConfig::FixedWindow { .. } => "fixed_window",
            StrategyConfig::SlidingWindow { .. } => "sliding_window",
            StrategyConfig::Quota { .. } => "quota",
        }
    }
}

/// A deployable tier template.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TierTemplate {
    /// Template name
    pub name: String,
    /// Tier this template matches
    pub tier: String,
    /// Request level the tier is read from
    pub level: TierLevel,
    #[serde(default)]
    pub description: Option<String>,
    /// Envelope fields joined into the throttle key
    #[serde(default)]
    pub key_fields: Option<Vec<RequestField>>,
    #[serde(default)]
    pub strategy: StrategyConfig,
}

impl TierTemplate {
    /// Whether a request falls under this template.
    pub fn is_eligible(&self, request: &RequestEnvelope) -> bool {
        request.field(self.level.tier_field()) == self.tier
    }

    /// The effective key fields.
    pub fn key_fields(&self) -> Vec<RequestField> {
        self.key_fields
            .clone()
            .unwrap_or_else(|| self.level.default_key_fields())
    }

    pub fn validate(&self) -> Result<()> {
        if self.tier.trim().is_empty() {
            return Err(TollgateError::Config(format!(
                "template '{}' has an empty tier",
                self.name
            )));
        }
        if matches!(&self.key_fields, Some(fields) if fields.is_empty()) {
            return Err(TollgateError::Config(format!(
                "template '{}' has an empty key_fields list",
                self.name
            )));
        }

        let limit = match &self.strategy {
            StrategyConfig::Global => None,
            StrategyConfig::FixedWindow { requests_per_unit, .. }
            | StrategyConfig::SlidingWindow { requests_per_unit, .. } => Some(*requests_per_unit),
            StrategyConfig::Quota { quota, .. } => Some(*quota),
        };
        if limit == Some(0) {
            return Err(TollgateError::Config(format!(
                "template '{}' has a zero {} limit",
                self.name,
                self.strategy.name()
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct TemplateFile {
    templates: Vec<TierTemplate>,
}

/// The set of known templates, indexed by tier.
#[derive(Debug, Clone, Default)]
pub struct TemplateStore {
    templates: HashMap<String, TierTemplate>,
}

impl TemplateStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Load templates from a YAML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        info!(path = %path.display(), "Loading tier templates");

        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    /// Load templates from a YAML string.
    ///
    /// Accepts either a single template or a `templates:` list; a document
    /// with a top-level `templates` key is always read as a list.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let document: serde_yaml::Value = serde_yaml::from_str(yaml)
            .map_err(|e| TollgateError::Config(format!("Failed to parse tier templates: {}", e)))?;

        let templates = if document.get("templates").is_some() {
            serde_yaml::from_value::<TemplateFile>(document)
                .map_err(|e| {
                    TollgateError::Config(format!("Failed to parse tier templates: {}", e))
                })?
                .templates
        } else {
            let template = serde_yaml::from_value::<TierTemplate>(document).map_err(|e| {
                TollgateError::Config(format!("Failed to parse tier template: {}", e))
            })?;
            vec![template]
        };

        let mut store = TemplateStore::new();
        for template in templates {
            store.insert(template)?;
        }
        Ok(store)
    }

    /// Add a template, rejecting invalid ones and duplicate tiers.
    pub fn insert(&mut self, template: TierTemplate) -> Result<()> {
        template.validate()?;
        if self.templates.contains_key(&template.tier) {
            return Err(TollgateError::Config(format!(
                "duplicate template for tier '{}'",
                template.tier
            )));
        }
        self.templates.insert(template.tier.clone(), template);
        Ok(())
    }

    /// Find the template for a tier.
    pub fn get(&self, tier: &str) -> Option<&TierTemplate> {
        self.templates.get(tier)
    }

    pub fn len(&self) -> usize {
        self.templates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.templates.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_test::{assert_err, assert_ok};

    #[test]
    fn test_parse_single_template() {
        let yaml = r#"
name: gold-app
tier: Gold
level: app
"#;
        let store = assert_ok!(TemplateStore::from_yaml(yaml));
        let template = store.get("Gold").unwrap();
        assert_eq!(template.level, TierLevel::App);
        assert_eq!(template.strategy, StrategyConfig::Global);
        assert_eq!(template.key_fields(), vec![RequestField::AppKey]);
    }

    #[test]
    fn test_parse_template_list() {
        let yaml = r#"
templates:
  - name: gold-api
    tier: Gold
    level: api
    description: Gold subscribers
    strategy:
      kind: fixed_window
      requests_per_unit: 100
      unit: minute
  - name: bronze-resource
    tier: Bronze
    level: resource
    key_fields: [resource_key]
    strategy:
      kind: quota
      quota: 5000
      period: day
"#;
        let store = assert_ok!(TemplateStore::from_yaml(yaml));
        assert_eq!(store.len(), 2);

        let gold = store.get("Gold").unwrap();
        assert_eq!(
            gold.strategy,
            StrategyConfig::FixedWindow {
                requests_per_unit: 100,
                unit: TimeWindow::Minute
            }
        );
        assert_eq!(gold.key_fields(), vec![RequestField::ApiKey, RequestField::AppKey]);

        let bronze = store.get("Bronze").unwrap();
        assert_eq!(bronze.key_fields(), vec![RequestField::ResourceKey]);
    }

    #[test]
    fn test_rejects_zero_limit() {
        let yaml = r#"
name: broken
tier: Gold
level: app
strategy:
  kind: sliding_window
  requests_per_unit: 0
  unit: second
"#;
        let err = assert_err!(TemplateStore::from_yaml(yaml));
        assert!(matches!(err, TollgateError::Config(_)));
    }

    #[test]
    fn test_rejects_duplicate_tier() {
        let yaml = r#"
templates:
  - name: a
    tier: Gold
    level: app
  - name: b
    tier: Gold
    level: api
"#;
        assert_err!(TemplateStore::from_yaml(yaml));
    }

    #[test]
    fn test_rejects_empty_key_fields() {
        let yaml = r#"
name: broken
tier: Gold
level: app
key_fields: []
"#;
        assert_err!(TemplateStore::from_yaml(yaml));
    }

    #[test]
    fn test_rejects_unknown_level() {
        let err = assert_err!(TemplateStore::from_yaml("name: gold\ntier: Gold\nlevel: platinum\n"));
        assert!(matches!(err, TollgateError::Config(_)));
    }

    #[test]
    fn test_rejects_unknown_strategy_kind() {
        let yaml = r#"
name: gold
tier: Gold
level: app
strategy:
  kind: token_bucket
"#;
        let err = assert_err!(TemplateStore::from_yaml(yaml));
        assert!(matches!(err, TollgateError::Config(_)));
    }

    #[test]
    fn test_rejects_malformed_template_in_list() {
        let yaml = r#"
templates:
  - name: gold
    tier: Gold
    level: platinum
"#;
        assert_err!(TemplateStore::from_yaml(yaml));
    }

    #[test]
    fn test_rejects_unrelated_document() {
        assert_err!(TemplateStore::from_yaml("rules:\n  - gold\n"));
    }

    #[test]
    fn test_eligibility_reads_level_tier() {
        let yaml = "name: gold-api\ntier: Gold\nlevel: api\n";
        let store = TemplateStore::from_yaml(yaml).unwrap();
        let template = store.get("Gold").unwrap();

        let mut request = RequestEnvelope {
            api_tier: "Gold".to_string(),
            app_tier: "Silver".to_string(),
            ..Default::default()
        };
        assert!(template.is_eligible(&request));

        request.api_tier = "Silver".to_string();
        assert!(!template.is_eligible(&request));
    }
}
