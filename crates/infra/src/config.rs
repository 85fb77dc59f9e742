//! Environment-driven configuration.

use std::str::FromStr;
use std::time::Duration;

use safeexec_core::{PolicyBook, WorkerId};

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid value for {key}: {value:?} ({reason})")]
    Invalid {
        key: &'static str,
        value: String,
        reason: String,
    },
    #[error("failed to read {path}: {reason}")]
    File { path: String, reason: String },
}

/// Thresholds for the safety rules.
#[derive(Debug, Clone, PartialEq)]
pub struct SafetyConfig {
    /// Requests below this confidence are blocked.
    pub min_confidence: f64,
    /// Maximum summed absolute percentage swing per entity inside the window.
    pub velocity_cap_percent: f64,
    pub velocity_window: Duration,
}

impl Default for SafetyConfig {
    fn default() -> Self {
        Self {
            min_confidence: 0.7,
            velocity_cap_percent: 50.0,
            velocity_window: Duration::from_secs(6 * 3_600),
        }
    }
}

impl SafetyConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let defaults = Self::default();
        let min_confidence = parse(&lookup, "SAFEEXEC_MIN_CONFIDENCE", defaults.min_confidence)?;
        if !(0.0..=1.0).contains(&min_confidence) {
            return Err(invalid("SAFEEXEC_MIN_CONFIDENCE", min_confidence, "must be within [0, 1]"));
        }
        let velocity_cap_percent =
            parse(&lookup, "SAFEEXEC_VELOCITY_CAP_PERCENT", defaults.velocity_cap_percent)?;
        if !velocity_cap_percent.is_finite() || velocity_cap_percent < 0.0 {
            return Err(invalid("SAFEEXEC_VELOCITY_CAP_PERCENT", velocity_cap_percent, "must be non-negative"));
        }
        let velocity_window = parse_secs(&lookup, "SAFEEXEC_VELOCITY_WINDOW_HOURS", 6, 3_600)?;

        Ok(Self {
            min_confidence,
            velocity_cap_percent,
            velocity_window,
        })
    }
}

/// Worker loop and maintenance settings.
#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    pub worker_id: WorkerId,
    pub batch_size: usize,
    pub max_concurrent: usize,
    pub poll_interval: Duration,
    /// Claims older than this without progress are returned to the queue.
    pub claim_timeout: Duration,
    /// Hard limit on a single platform call.
    pub api_timeout: Duration,
    pub serialize_per_entity: bool,
    pub maintenance_interval: Duration,
    pub retention: Duration,
    pub policies: PolicyBook,
    pub safety: SafetyConfig,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            worker_id: WorkerId::generate(),
            batch_size: 10,
            max_concurrent: 4,
            poll_interval: Duration::from_millis(1_000),
            claim_timeout: Duration::from_secs(300),
            api_timeout: Duration::from_millis(5_000),
            serialize_per_entity: true,
            maintenance_interval: Duration::from_secs(60),
            retention: Duration::from_secs(90 * 86_400),
            policies: PolicyBook::default(),
            safety: SafetyConfig::default(),
        }
    }
}

impl ExecutorConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let worker_id = lookup("SAFEEXEC_WORKER_ID")
            .filter(|v| !v.trim().is_empty())
            .map(WorkerId::new)
            .unwrap_or(defaults.worker_id);

        let batch_size: usize = parse(&lookup, "SAFEEXEC_BATCH_SIZE", defaults.batch_size)?;
        if batch_size == 0 {
            return Err(invalid("SAFEEXEC_BATCH_SIZE", batch_size, "must be at least 1"));
        }
        let max_concurrent: usize = parse(&lookup, "SAFEEXEC_MAX_CONCURRENT", defaults.max_concurrent)?;
        if max_concurrent == 0 {
            return Err(invalid("SAFEEXEC_MAX_CONCURRENT", max_concurrent, "must be at least 1"));
        }

        let policies = match lookup("SAFEEXEC_JOB_TYPES_FILE") {
            Some(path) => load_policies(&path)?,
            None => defaults.policies,
        };

        Ok(Self {
            worker_id,
            batch_size,
            max_concurrent,
            poll_interval: Duration::from_millis(parse(&lookup, "SAFEEXEC_POLL_INTERVAL_MS", 1_000)?),
            claim_timeout: Duration::from_secs(parse(&lookup, "SAFEEXEC_CLAIM_TIMEOUT_SECS", 300)?),
            api_timeout: Duration::from_millis(parse(&lookup, "SAFEEXEC_API_TIMEOUT_MS", 5_000)?),
            serialize_per_entity: parse(&lookup, "SAFEEXEC_SERIALIZE_PER_ENTITY", true)?,
            maintenance_interval: Duration::from_secs(parse(&lookup, "SAFEEXEC_MAINTENANCE_INTERVAL_SECS", 60)?),
            retention: parse_secs(&lookup, "SAFEEXEC_RETENTION_DAYS", 90, 86_400)?,
            policies,
            safety: SafetyConfig::from_lookup(&lookup)?,
        })
    }
}

/// Whether `USE_PERSISTENT_STORES=true` selects the Postgres backends.
pub fn use_persistent_stores() -> bool {
    std::env::var("USE_PERSISTENT_STORES")
        .map(|v| v == "true" || v == "1")
        .unwrap_or(false)
}

fn load_policies(path: &str) -> Result<PolicyBook, ConfigError> {
    let json = std::fs::read_to_string(path).map_err(|e| ConfigError::File {
        path: path.to_string(),
        reason: e.to_string(),
    })?;
    PolicyBook::from_json(&json).map_err(|e| ConfigError::File {
        path: path.to_string(),
        reason: e.to_string(),
    })
}

fn parse<T>(lookup: &impl Fn(&str) -> Option<String>, key: &'static str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match lookup(key) {
        Some(raw) => raw.trim().parse().map_err(|e: T::Err| ConfigError::Invalid {
            key,
            value: raw.clone(),
            reason: e.to_string(),
        }),
        None => Ok(default),
    }
}

/// A count of `unit_secs`-long units, as a duration.
fn parse_secs(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &'static str,
    default: u64,
    unit_secs: u64,
) -> Result<Duration, ConfigError> {
    let units: u64 = parse(lookup, key, default)?;
    units
        .checked_mul(unit_secs)
        .map(Duration::from_secs)
        .ok_or_else(|| invalid(key, units, "out of range"))
}

fn invalid(key: &'static str, value: impl ToString, reason: &str) -> ConfigError {
    ConfigError::Invalid {
        key,
        value: value.to_string(),
        reason: reason.to_string(),
    }
}
