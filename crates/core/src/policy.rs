//! Per-change-type execution policy.

use std::collections::BTreeMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::change::ChangeType;

/// Retry, expiry, and rate-limit policy for one change type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobTypeConfig {
    /// Maximum number of retries after transient failures (0 = no retries)
    pub max_retry_attempts: u32,
    /// Base delay of the exponential backoff
    pub retry_backoff_base_ms: u64,
    /// Maximum delay cap
    #[serde(default)]
    pub retry_backoff_max_ms: Option<u64>,
    /// Requests not finished this long after creation are expired
    pub expire_in_seconds: u64,
    /// `None` = unlimited
    #[serde(default)]
    pub rate_limit_per_tenant_per_hour: Option<u32>,
    #[serde(default)]
    pub default_priority: i32,
}

impl JobTypeConfig {
    /// Delay before retry number `attempt` (1-indexed): `base * 2^(attempt-1)`, capped.
    pub fn backoff(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }

        let exp = 2_u64.saturating_pow(attempt - 1);
        let delay_ms = self.retry_backoff_base_ms.saturating_mul(exp);
        let delay_ms = match self.retry_backoff_max_ms {
            Some(max) => delay_ms.min(max),
            None => delay_ms,
        };

        Duration::from_millis(delay_ms)
    }

    /// Check if another retry is allowed after `attempt_count` failed attempts.
    pub fn should_retry(&self, attempt_count: u32) -> bool {
        attempt_count < self.max_retry_attempts
    }

    /// Instant after which a request created at `created_at` is expired.
    pub fn expires_at(&self, created_at: DateTime<Utc>) -> DateTime<Utc> {
        created_at + chrono::Duration::seconds(self.expire_in_seconds.min(i64::MAX as u64) as i64)
    }

    pub fn is_expired(&self, created_at: DateTime<Utc>, now: DateTime<Utc>) -> bool {
        now >= self.expires_at(created_at)
    }

    fn defaults_for(change_type: ChangeType) -> Self {
        let (expire_in_seconds, rate_limit, priority) = match change_type {
            ChangeType::Budget => (3_600, 10, 100),
            ChangeType::Bid => (3_600, 20, 50),
            ChangeType::Status => (1_800, 30, 10),
        };
        Self {
            max_retry_attempts: 3,
            retry_backoff_base_ms: 5_000,
            retry_backoff_max_ms: Some(300_000),
            expire_in_seconds,
            rate_limit_per_tenant_per_hour: Some(rate_limit),
            default_priority: priority,
        }
    }
}

/// Read-only policy lookup keyed by change type.
///
/// Every change type always resolves to a policy: entries missing from a
/// loaded book fall back to the built-in defaults.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PolicyBook {
    configs: BTreeMap<ChangeType, JobTypeConfig>,
}

impl Default for PolicyBook {
    fn default() -> Self {
        Self {
            configs: ChangeType::ALL
                .into_iter()
                .map(|t| (t, JobTypeConfig::defaults_for(t)))
                .collect(),
        }
    }
}

impl PolicyBook {
    pub fn with(mut self, change_type: ChangeType, config: JobTypeConfig) -> Self {
        self.configs.insert(change_type, config);
        self
    }

    /// Parse a JSON object keyed by change type, filling gaps with defaults.
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        let configs: BTreeMap<ChangeType, JobTypeConfig> = serde_json::from_str(json)?;
        Ok(configs
            .into_iter()
            .fold(Self::default(), |book, (t, cfg)| book.with(t, cfg)))
    }

    pub fn get(&self, change_type: ChangeType) -> JobTypeConfig {
        self.configs
            .get(&change_type)
            .cloned()
            .unwrap_or_else(|| JobTypeConfig::defaults_for(change_type))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(base_ms: u64, cap: Option<u64>) -> JobTypeConfig {
        JobTypeConfig {
            max_retry_attempts: 3,
            retry_backoff_base_ms: base_ms,
            retry_backoff_max_ms: cap,
            expire_in_seconds: 3_600,
            rate_limit_per_tenant_per_hour: None,
            default_priority: 0,
        }
    }

    #[test]
    fn exponential_backoff_calculates_correctly() {
        let cfg = config(5_000, None);

        assert_eq!(cfg.backoff(0), Duration::ZERO);
        assert_eq!(cfg.backoff(1), Duration::from_millis(5_000));
        assert_eq!(cfg.backoff(2), Duration::from_millis(10_000));
        assert_eq!(cfg.backoff(3), Duration::from_millis(20_000));
    }

    #[test]
    fn backoff_respects_cap() {
        let cfg = config(5_000, Some(12_000));
        assert_eq!(cfg.backoff(3), Duration::from_millis(12_000));
        assert_eq!(cfg.backoff(64), Duration::from_millis(12_000));
    }

    #[test]
    fn should_retry_respects_max_attempts() {
        let cfg = config(100, None);

        assert!(cfg.should_retry(0));
        assert!(cfg.should_retry(2));
        assert!(!cfg.should_retry(3));
        assert!(!cfg.should_retry(4));
    }

    #[test]
    fn policy_book_fills_missing_types_with_defaults() {
        let book = PolicyBook::from_json(
            r#"{"budget": {"max_retry_attempts": 1, "retry_backoff_base_ms": 10, "expire_in_seconds": 60}}"#,
        )
        .unwrap();

        let budget = book.get(ChangeType::Budget);
        assert_eq!(budget.max_retry_attempts, 1);
        assert_eq!(budget.rate_limit_per_tenant_per_hour, None);
        assert_eq!(book.get(ChangeType::Bid), PolicyBook::default().get(ChangeType::Bid));
    }

    #[test]
    fn expiry_is_measured_from_creation() {
        let cfg = config(100, None);
        let created = Utc::now();
        assert!(!cfg.is_expired(created, created + chrono::Duration::seconds(3_599)));
        assert!(cfg.is_expired(created, created + chrono::Duration::seconds(3_600)));
    }

    mod proptest_tests {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            /// Property: backoff never shrinks as attempts increase, with or without a cap.
            #[test]
            fn backoff_is_monotonic(base in 1u64..60_000, cap in proptest::option::of(1u64..600_000), attempt in 1u32..40) {
                let cfg = config(base, cap);
                prop_assert!(cfg.backoff(attempt + 1) >= cfg.backoff(attempt));
            }
        }
    }
}
