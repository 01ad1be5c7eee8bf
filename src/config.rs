//! Configuration management for Tollgate.

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use crate::error::{Result, TollgateError};

/// Environment variable prefix for configuration overrides.
///
/// Nested fields use a double underscore, e.g. `TOLLGATE__ADMISSION__DECISION_TIMEOUT_MS`.
pub const ENV_PREFIX: &str = "TOLLGATE";

/// Main configuration for the Tollgate service.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TollgateConfig {
    /// Server configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Admission decision configuration
    #[serde(default)]
    pub admission: AdmissionConfig,

    /// Global synchronization configuration
    #[serde(default)]
    pub sync: SyncConfig,

    /// Rule template configuration
    #[serde(default)]
    pub rules: RulesConfig,

    /// Cache bootstrap configuration
    #[serde(default)]
    pub bootstrap: BootstrapConfig,
}

/// Server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// gRPC server address (admission requests and authority pushes)
    #[serde(default = "default_grpc_addr")]
    pub grpc_addr: SocketAddr,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            grpc_addr: default_grpc_addr(),
        }
    }
}

fn default_grpc_addr() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 8081))
}

/// What a decision resolves to when the verdicts cannot be collected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailurePolicy {
    /// Let the request through (not throttled)
    #[default]
    FailOpen,
    /// Reject the request (throttled)
    FailClosed,
}

impl FailurePolicy {
    /// The throttle decision this policy falls back to.
    pub fn throttled(&self) -> bool {
        matches!(self, FailurePolicy::FailClosed)
    }
}

/// Admission decision configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdmissionConfig {
    /// Upper bound on how long a caller waits for all verdicts
    #[serde(default = "default_decision_timeout")]
    pub decision_timeout_ms: u64,

    /// Policy applied when a decision times out or is cancelled
    #[serde(default)]
    pub failure_policy: FailurePolicy,

    /// How long shutdown waits for in-flight decisions before cancelling them
    #[serde(default = "default_shutdown_grace")]
    pub shutdown_grace_ms: u64,

    /// Capacity of each rule pipeline's job queue
    #[serde(default = "default_pipeline_capacity")]
    pub pipeline_queue_capacity: usize,

    /// Capacity of the shared verdict channel
    #[serde(default = "default_verdict_capacity")]
    pub verdict_queue_capacity: usize,
}

impl Default for AdmissionConfig {
    fn default() -> Self {
        Self {
            decision_timeout_ms: default_decision_timeout(),
            failure_policy: FailurePolicy::default(),
            shutdown_grace_ms: default_shutdown_grace(),
            pipeline_queue_capacity: default_pipeline_capacity(),
            verdict_queue_capacity: default_verdict_capacity(),
        }
    }
}

impl AdmissionConfig {
    pub fn decision_timeout(&self) -> Duration {
        Duration::from_millis(self.decision_timeout_ms)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }
}

fn default_decision_timeout() -> u64 {
    250
}

fn default_shutdown_grace() -> u64 {
    2000
}

fn default_pipeline_capacity() -> usize {
    1024
}

fn default_verdict_capacity() -> usize {
    4096
}

/// Global synchronization configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncConfig {
    /// Rate authority endpoint (e.g. `https://authority:9621`); notifications are
    /// disabled when unset
    #[serde(default)]
    pub authority_endpoint: Option<String>,

    /// Stream identifier stamped on every served-request record
    #[serde(default = "default_stream_id")]
    pub stream_id: String,

    /// Bearer token sent to the authority and expected on inbound pushes
    #[serde(default)]
    pub auth_token: Option<String>,

    /// TLS settings for the authority connection
    #[serde(default)]
    pub tls: Option<TlsConfig>,

    /// Maximum number of queued served-request records
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,

    /// Connection timeout in milliseconds
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_ms: u64,

    /// Reconnection policy
    #[serde(default)]
    pub backoff: BackoffConfig,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            authority_endpoint: None,
            stream_id: default_stream_id(),
            auth_token: None,
            tls: None,
            queue_capacity: default_queue_capacity(),
            connect_timeout_ms: default_connect_timeout(),
            backoff: BackoffConfig::default(),
        }
    }
}

impl SyncConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}

fn default_stream_id() -> String {
    "org.wso2.throttle.request.stream:1.0.3".to_string()
}

fn default_queue_capacity() -> usize {
    10000
}

fn default_connect_timeout() -> u64 {
    3000
}

/// TLS settings for the authority connection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TlsConfig {
    /// PEM file with the CA certificate used to verify the authority
    pub ca_cert_path: String,
    /// Expected server name; defaults to the endpoint host
    #[serde(default)]
    pub domain: Option<String>,
}

/// Exponential backoff settings for reconnecting to the authority.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackoffConfig {
    #[serde(default = "default_backoff_initial")]
    pub initial_ms: u64,
    #[serde(default = "default_backoff_max")]
    pub max_ms: u64,
    #[serde(default = "default_backoff_multiplier")]
    pub multiplier: f64,
    /// Connection attempts per cycle before the backlog is discarded
    #[serde(default = "default_backoff_retries")]
    pub max_retries: u32,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial_ms: default_backoff_initial(),
            max_ms: default_backoff_max(),
            multiplier: default_backoff_multiplier(),
            max_retries: default_backoff_retries(),
        }
    }
}

fn default_backoff_initial() -> u64 {
    100
}

fn default_backoff_max() -> u64 {
    30_000
}

fn default_backoff_multiplier() -> f64 {
    2.0
}

fn default_backoff_retries() -> u32 {
    8
}

/// Rule template configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RulesConfig {
    /// Path to the tier template file
    #[serde(default)]
    pub templates_path: Option<String>,

    /// Tiers deployed as rules at startup
    #[serde(default)]
    pub active_tiers: Vec<String>,
}

/// Cache bootstrap configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BootstrapConfig {
    /// Path to a JSON snapshot of throttle state
    #[serde(default)]
    pub path: Option<String>,
}

impl TollgateConfig {
    /// Load configuration from an optional YAML file with environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(
                config::File::from(path)
                    .format(config::FileFormat::Yaml)
                    .required(true),
            );
        }
        let settings = builder
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;
        let config: TollgateConfig = settings.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Parse configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: TollgateConfig = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.admission.decision_timeout_ms == 0 {
            return Err(TollgateError::Config(
                "admission.decision_timeout_ms must be positive".to_string(),
            ));
        }
        if self.admission.pipeline_queue_capacity == 0 || self.admission.verdict_queue_capacity == 0 {
            return Err(TollgateError::Config(
                "admission queue capacities must be positive".to_string(),
            ));
        }
        if self.sync.queue_capacity == 0 {
            return Err(TollgateError::Config(
                "sync.queue_capacity must be positive".to_string(),
            ));
        }
        if self.sync.backoff.multiplier < 1.0 {
            return Err(TollgateError::Config(
                "sync.backoff.multiplier must be at least 1.0".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = TollgateConfig::default();
        assert_eq!(config.admission.decision_timeout(), Duration::from_millis(250));
        assert_eq!(config.admission.failure_policy, FailurePolicy::FailOpen);
        assert!(config.sync.authority_endpoint.is_none());
        assert_eq!(config.sync.stream_id, "org.wso2.throttle.request.stream:1.0.3");
        assert!(config.rules.active_tiers.is_empty());
    }

    #[test]
    fn test_parse_yaml() {
        let yaml = r#"
admission:
  decision_timeout_ms: 50
  failure_policy: fail_closed
sync:
  authority_endpoint: "http://127.0.0.1:9621"
  queue_capacity: 16
rules:
  templates_path: tiers.yaml
  active_tiers: [Gold, Silver]
"#;
        let config = TollgateConfig::from_yaml(yaml).unwrap();
        assert_eq!(config.admission.decision_timeout_ms, 50);
        assert!(config.admission.failure_policy.throttled());
        assert_eq!(config.sync.queue_capacity, 16);
        assert_eq!(config.rules.active_tiers, vec!["Gold", "Silver"]);
        // Untouched sections keep their defaults
        assert_eq!(config.sync.backoff.max_retries, 8);
    }

    #[test]
    fn test_rejects_zero_timeout() {
        let yaml = "admission:\n  decision_timeout_ms: 0\n";
        let result = TollgateConfig::from_yaml(yaml);
        assert!(matches!(result, Err(TollgateError::Config(_))));
    }

    #[test]
    fn test_failure_policy_fallback() {
        assert!(!FailurePolicy::FailOpen.throttled());
        assert!(FailurePolicy::FailClosed.throttled());
    }
}
