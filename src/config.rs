use serde::{Deserialize, Serialize};
use std::fs;
use std::time::Duration;
use thiserror::Error;

use crate::canonical::{RiskPolicy, SlaPolicy};
use crate::client::RetryPolicy;

/// Environment variable that overrides `custodian.access_token`
pub const ACCESS_TOKEN_ENV: &str = "CUSTODIAN_ACCESS_TOKEN";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },

    #[error("Failed to parse config: {0}")]
    Parse(#[from] serde_yaml::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Debug, Serialize, Deserialize, Clone, Default)]
pub struct AppConfig {
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub custodian: CustodianConfig,
    #[serde(default)]
    pub idempotency: IdempotencyConfig,
    #[serde(default)]
    pub reconciliation: ReconcileConfig,
    #[serde(default)]
    pub notifications: NotificationConfig,
    #[serde(default)]
    pub risk: RiskPolicy,
    #[serde(default)]
    pub sla: SlaPolicy,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct LoggingConfig {
    pub log_level: String,
    pub log_dir: String,
    pub log_file: String,
    pub use_json: bool,
    /// `hourly`, `daily` or `never`
    pub rotation: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            log_dir: "./logs".to_string(),
            log_file: "orchestrator.log".to_string(),
            use_json: false,
            rotation: "daily".to_string(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct CustodianConfig {
    pub base_url: String,
    /// Bearer credential; prefer the environment override in production
    #[serde(skip_serializing)]
    pub access_token: Option<String>,
    #[serde(rename = "timeout_ms", with = "duration_ms")]
    pub timeout: Duration,
    pub retry: RetryPolicy,
}

impl Default for CustodianConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:3080".to_string(),
            access_token: None,
            timeout: Duration::from_secs(30),
            retry: RetryPolicy::default(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct IdempotencyConfig {
    /// Record lifetime; must outlive the longest in-flight transfer
    #[serde(rename = "ttl_secs", with = "duration_secs")]
    pub ttl: Duration,
    #[serde(rename = "sweep_interval_secs", with = "duration_secs")]
    pub sweep_interval: Duration,
    /// How long a duplicate caller waits on an in-flight execution
    /// before being told the operation is in progress
    #[serde(rename = "in_progress_wait_ms", with = "duration_ms")]
    pub in_progress_wait: Duration,
}

impl Default for IdempotencyConfig {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(96 * 3600),
            sweep_interval: Duration::from_secs(3600),
            in_progress_wait: Duration::from_secs(10),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct ReconcileConfig {
    #[serde(rename = "poll_interval_ms", with = "duration_ms")]
    pub poll_interval: Duration,
    /// Maximum transfers fetched per tick
    pub batch_size: usize,
    pub worker_count: usize,
    /// Per-transfer budget; must be shorter than the poll interval
    #[serde(rename = "item_timeout_ms", with = "duration_ms")]
    pub item_timeout: Duration,
    #[serde(rename = "shutdown_timeout_ms", with = "duration_ms")]
    pub shutdown_timeout: Duration,
    /// Always copied on reconciliation notifications
    pub operator_recipients: Vec<String>,
}

impl Default for ReconcileConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(30),
            batch_size: 100,
            worker_count: 4,
            item_timeout: Duration::from_secs(20),
            shutdown_timeout: Duration::from_secs(30),
            operator_recipients: Vec::new(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct NotificationConfig {
    pub queue_size: usize,
    pub worker_count: usize,
    pub max_retries: u32,
    /// Linear backoff unit: attempt `n` waits `n * retry_delay`
    #[serde(rename = "retry_delay_ms", with = "duration_ms")]
    pub retry_delay: Duration,
    pub webhook_url: Option<String>,
}

impl Default for NotificationConfig {
    fn default() -> Self {
        Self {
            queue_size: 1024,
            worker_count: 2,
            max_retries: 3,
            retry_delay: Duration::from_secs(5),
            webhook_url: None,
        }
    }
}

impl AppConfig {
    /// Load from an explicit YAML path
    pub fn load(path: &str) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_string(),
            source,
        })?;
        let mut config = Self::from_yaml(&content)?;
        if let Ok(token) = std::env::var(ACCESS_TOKEN_ENV)
            && !token.is_empty()
        {
            config.custodian.access_token = Some(token);
        }
        Ok(config)
    }

    /// Load `config/<env>.yaml`
    pub fn load_env(env: &str) -> Result<Self, ConfigError> {
        Self::load(&format!("config/{}.yaml", env))
    }

    pub fn from_yaml(content: &str) -> Result<Self, ConfigError> {
        Ok(serde_yaml::from_str(content)?)
    }

    /// Reject configurations that would leave the core unable to start.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.custodian.base_url.trim().is_empty() {
            return Err(ConfigError::Invalid("custodian.base_url is empty".into()));
        }
        if self.notifications.queue_size == 0 || self.notifications.worker_count == 0 {
            return Err(ConfigError::Invalid(
                "notifications need a non-empty queue and at least one worker".into(),
            ));
        }
        if self.idempotency.ttl.is_zero() {
            return Err(ConfigError::Invalid("idempotency.ttl_secs must be > 0".into()));
        }
        validate_reconcile(&self.reconciliation)
    }

    /// Non-fatal findings worth logging at startup
    pub fn warnings(&self) -> Vec<String> {
        let mut warnings = Vec::new();
        let longest_wait = self.sla.longest_max_wait();
        if self.idempotency.ttl < longest_wait {
            warnings.push(format!(
                "idempotency ttl ({}s) is shorter than the longest SLA max wait ({}s)",
                self.idempotency.ttl.as_secs(),
                longest_wait.as_secs()
            ));
        }
        if self.custodian.access_token.is_none() {
            warnings.push(format!(
                "no custodian access token configured (set {})",
                ACCESS_TOKEN_ENV
            ));
        }
        warnings
    }
}

pub(crate) fn validate_reconcile(config: &ReconcileConfig) -> Result<(), ConfigError> {
    if config.worker_count == 0 {
        return Err(ConfigError::Invalid(
            "reconciliation.worker_count must be > 0".into(),
        ));
    }
    if config.batch_size == 0 {
        return Err(ConfigError::Invalid(
            "reconciliation.batch_size must be > 0".into(),
        ));
    }
    if config.poll_interval.is_zero() {
        return Err(ConfigError::Invalid(
            "reconciliation.poll_interval_ms must be > 0".into(),
        ));
    }
    if config.item_timeout.is_zero() || config.item_timeout >= config.poll_interval {
        return Err(ConfigError::Invalid(
            "reconciliation.item_timeout_ms must be > 0 and shorter than the poll interval".into(),
        ));
    }
    Ok(())
}

/// `Duration` as integer milliseconds
pub mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_millis)
    }
}

/// `Duration` as integer seconds
pub mod duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_secs)
    }
}

/// Optional `Duration` as integer seconds
pub mod opt_duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Option<Duration>, s: S) -> Result<S::Ok, S::Error> {
        match d {
            Some(d) => s.serialize_some(&d.as_secs()),
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Duration>, D::Error> {
        Option::<u64>::deserialize(d).map(|v| v.map(Duration::from_secs))
    }
}
