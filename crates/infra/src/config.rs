//! Queue configuration.
//!
//! Every knob has a default; `from_env` overrides them from `DRAINQ_*` variables.

use std::time::Duration;

use drainq_extract::FallbackPolicy;

use crate::jobs::RetryPolicy;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{var}: cannot parse `{value}`: {reason}")]
    Parse {
        var: &'static str,
        value: String,
        reason: String,
    },

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Tuning for claim, reclaim, dispatch and retention.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueConfig {
    /// Claim cycles a job may consume before it is killed.
    pub max_attempts: u32,
    /// A claimed job older than this is considered abandoned. Must outlast the
    /// longest drain pass, or a live claim could be reclaimed under its worker.
    pub liveness_window: Duration,
    /// Hard wall-clock budget of one invocation.
    pub invocation_budget: Duration,
    /// Deadline for one extraction call. Strictly shorter than the budget.
    pub extract_deadline: Duration,
    /// Deadline for one store call.
    pub store_timeout: Duration,
    /// Default number of jobs processed together by one drain pass.
    pub concurrency: usize,
    /// Ceiling applied to any requested concurrency.
    pub max_concurrency: usize,
    /// Maximum writes in one store batch.
    pub batch_limit: usize,
    /// Terminal jobs older than this are deleted by the retention sweep.
    pub retention: Duration,
    /// Continuations stop being emitted past this depth.
    pub max_chain_depth: u32,
    pub fallback: FallbackPolicy,
}

const DEFAULT_BUDGET_SECS: u64 = 540;
const MAX_RETENTION_DAYS: u64 = 36_500;

impl Default for QueueConfig {
    fn default() -> Self {
        let invocation_budget = Duration::from_secs(DEFAULT_BUDGET_SECS);
        Self {
            max_attempts: 3,
            liveness_window: default_liveness_window(invocation_budget),
            invocation_budget,
            extract_deadline: default_deadline(invocation_budget),
            store_timeout: Duration::from_secs(10),
            concurrency: 3,
            max_concurrency: 5,
            batch_limit: 500,
            retention: Duration::from_secs(30 * 24 * 60 * 60),
            max_chain_depth: 50,
            fallback: FallbackPolicy::OnFinalAttempt,
        }
    }
}

/// 60% of the invocation budget.
fn default_deadline(budget: Duration) -> Duration {
    budget * 3 / 5
}

/// One minute past the invocation budget. No pass that fits the budget can hold a
/// claim that long.
fn default_liveness_window(budget: Duration) -> Duration {
    budget + Duration::from_secs(60)
}

impl QueueConfig {
    /// Defaults overridden by `DRAINQ_*` environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as [`QueueConfig::from_env`] with an injectable variable source.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Some(v) = parse::<u32>(&lookup, "DRAINQ_MAX_ATTEMPTS")? {
            config.max_attempts = v;
        }
        if let Some(v) = parse::<u64>(&lookup, "DRAINQ_INVOCATION_BUDGET_SECS")? {
            config.invocation_budget = Duration::from_secs(v);
            config.extract_deadline = default_deadline(config.invocation_budget);
            config.liveness_window = default_liveness_window(config.invocation_budget);
        }
        if let Some(v) = parse::<u64>(&lookup, "DRAINQ_LIVENESS_WINDOW_SECS")? {
            config.liveness_window = Duration::from_secs(v);
        }
        if let Some(v) = parse::<u64>(&lookup, "DRAINQ_EXTRACT_DEADLINE_SECS")? {
            config.extract_deadline = Duration::from_secs(v);
        }
        if let Some(v) = parse::<u64>(&lookup, "DRAINQ_STORE_TIMEOUT_SECS")? {
            config.store_timeout = Duration::from_secs(v);
        }
        if let Some(v) = parse::<usize>(&lookup, "DRAINQ_CONCURRENCY")? {
            config.concurrency = v;
        }
        if let Some(v) = parse::<usize>(&lookup, "DRAINQ_MAX_CONCURRENCY")? {
            config.max_concurrency = v;
        }
        if let Some(v) = parse::<usize>(&lookup, "DRAINQ_BATCH_LIMIT")? {
            config.batch_limit = v;
        }
        if let Some(v) = parse::<u64>(&lookup, "DRAINQ_RETENTION_DAYS")? {
            let secs = v.checked_mul(24 * 60 * 60).ok_or_else(|| ConfigError::Parse {
                var: "DRAINQ_RETENTION_DAYS",
                value: v.to_string(),
                reason: "too many days".into(),
            })?;
            config.retention = Duration::from_secs(secs);
        }
        if let Some(v) = parse::<u32>(&lookup, "DRAINQ_MAX_CHAIN_DEPTH")? {
            config.max_chain_depth = v;
        }
        if let Some(v) = parse::<FallbackPolicy>(&lookup, "DRAINQ_FALLBACK")? {
            config.fallback = v;
        }

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_attempts == 0 {
            return Err(ConfigError::Invalid("max_attempts must be at least 1".into()));
        }
        if self.concurrency == 0 || self.max_concurrency == 0 {
            return Err(ConfigError::Invalid("concurrency limits must be at least 1".into()));
        }
        if self.batch_limit == 0 {
            return Err(ConfigError::Invalid("batch_limit must be at least 1".into()));
        }
        if self.extract_deadline >= self.invocation_budget {
            return Err(ConfigError::Invalid(format!(
                "extract deadline ({}s) must be shorter than the invocation budget ({}s)",
                self.extract_deadline.as_secs(),
                self.invocation_budget.as_secs()
            )));
        }
        if self.store_timeout >= self.invocation_budget {
            return Err(ConfigError::Invalid(
                "store timeout must be shorter than the invocation budget".into(),
            ));
        }

        let default_pass = self.pass_estimate(self.concurrency);
        if default_pass > self.invocation_budget {
            return Err(ConfigError::Invalid(format!(
                "a drain pass may take {}s, longer than the invocation budget ({}s)",
                default_pass.as_secs(),
                self.invocation_budget.as_secs()
            )));
        }
        let longest_pass = self.pass_estimate(self.max_concurrency);
        if self.liveness_window <= longest_pass {
            return Err(ConfigError::Invalid(format!(
                "liveness window ({}s) must be longer than the longest drain pass ({}s)",
                self.liveness_window.as_secs(),
                longest_pass.as_secs()
            )));
        }
        if self.retention > Duration::from_secs(MAX_RETENTION_DAYS * 24 * 60 * 60) {
            return Err(ConfigError::Invalid(format!(
                "retention must be at most {MAX_RETENTION_DAYS} days"
            )));
        }
        Ok(())
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.max_attempts)
    }

    /// Requested concurrency clamped to `[1, max_concurrency]`.
    pub fn clamp_concurrency(&self, requested: usize) -> usize {
        requested.clamp(1, self.max_concurrency.max(1))
    }

    /// Worst-case wall time of one drain pass over `limit` jobs, and so the longest a
    /// claim stays live.
    ///
    /// Claims (read + write) and outcome writes run one job at a time around a single
    /// concurrent extraction; the queue query and the leftover check add one call each.
    pub fn pass_estimate(&self, limit: usize) -> Duration {
        let limit = u32::try_from(self.clamp_concurrency(limit)).unwrap_or(u32::MAX);
        let store_calls = limit.saturating_mul(3).saturating_add(2);
        self.extract_deadline + self.store_timeout.saturating_mul(store_calls)
    }

    pub fn liveness_window_chrono(&self) -> chrono::Duration {
        chrono::Duration::from_std(self.liveness_window).unwrap_or(chrono::Duration::MAX)
    }

    pub fn retention_chrono(&self) -> chrono::Duration {
        chrono::Duration::from_std(self.retention).unwrap_or(chrono::Duration::MAX)
    }
}

fn parse<T>(lookup: &impl Fn(&str) -> Option<String>, var: &'static str) -> Result<Option<T>, ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match lookup(var) {
        None => Ok(None),
        Some(raw) if raw.trim().is_empty() => Ok(None),
        Some(raw) => raw.trim().parse::<T>().map(Some).map_err(|e| ConfigError::Parse {
            var,
            value: raw,
            reason: e.to_string(),
        }),
    }
}
