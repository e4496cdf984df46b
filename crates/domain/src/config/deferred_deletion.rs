use serde::{Deserialize, Serialize};

/// Deferred-deletion worker pacing: queue tick cadence, retry/backoff
/// budgets, and the self-throttling thresholds that keep a slow backend
/// from being hammered by the retry loop (§4.6).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeferredDeletionConfig {
    /// Seconds between passes over each queue. Clamped to `1..=300`.
    #[serde(default = "d_check_interval_secs")]
    pub check_interval_secs: u32,
    /// Entries drained from a single queue per tick. Clamped to `1..=1000`.
    #[serde(default = "d_max_deletions_at_once")]
    pub max_deletions_at_once: u32,
    /// Consecutive no-progress observations before an entry is bounced
    /// back to the previous queue to re-issue its command. Clamped to
    /// `1..=1000`.
    #[serde(default = "d_retries_to_retry")]
    pub retries_to_retry: u32,
    /// `total_retries` ceiling before an entry is given up on permanently
    /// as a `RetryableError`. Clamped to `1..=100_000`.
    #[serde(default = "d_max_retryable_error_retries")]
    pub max_retryable_error_retries: u32,
    /// `fatal_retries` ceiling before an entry is given up on after a
    /// non-retryable error. Clamped to `1..=100_000`.
    #[serde(default = "d_max_fatal_error_retries")]
    pub max_fatal_error_retries: u32,
    /// `next_check` multiplier applied after a fatal (non-retryable)
    /// error, widening the gap before retrying again. Clamped to `1..=100`.
    #[serde(default = "d_fatal_error_interval_multiplier")]
    pub fatal_error_interval_multiplier: u32,
    /// An operation taking longer than this, in seconds, triggers
    /// self-throttling via `delay_rate`. Clamped to `1..=3600`.
    #[serde(default = "d_operation_delay_threshold_secs")]
    pub operation_delay_threshold_secs: u32,
    /// Ceiling on the self-throttling `delay_rate` multiplier applied to
    /// `check_interval_secs`. Clamped to `1..=100`.
    #[serde(default = "d_max_delay_rate")]
    pub max_delay_rate: u32,
}

impl Default for DeferredDeletionConfig {
    fn default() -> Self {
        Self {
            check_interval_secs: d_check_interval_secs(),
            max_deletions_at_once: d_max_deletions_at_once(),
            retries_to_retry: d_retries_to_retry(),
            max_retryable_error_retries: d_max_retryable_error_retries(),
            max_fatal_error_retries: d_max_fatal_error_retries(),
            fatal_error_interval_multiplier: d_fatal_error_interval_multiplier(),
            operation_delay_threshold_secs: d_operation_delay_threshold_secs(),
            max_delay_rate: d_max_delay_rate(),
        }
    }
}

impl DeferredDeletionConfig {
    pub fn clamped(&self) -> Self {
        Self {
            check_interval_secs: self.check_interval_secs.clamp(1, 300),
            max_deletions_at_once: self.max_deletions_at_once.clamp(1, 1000),
            retries_to_retry: self.retries_to_retry.clamp(1, 1000),
            max_retryable_error_retries: self.max_retryable_error_retries.clamp(1, 100_000),
            max_fatal_error_retries: self.max_fatal_error_retries.clamp(1, 100_000),
            fatal_error_interval_multiplier: self.fatal_error_interval_multiplier.clamp(1, 100),
            operation_delay_threshold_secs: self.operation_delay_threshold_secs.clamp(1, 3600),
            max_delay_rate: self.max_delay_rate.clamp(1, 100),
        }
    }
}

fn d_check_interval_secs() -> u32 {
    7
}

fn d_max_deletions_at_once() -> u32 {
    10
}

fn d_retries_to_retry() -> u32 {
    32
}

fn d_max_retryable_error_retries() -> u32 {
    200
}

fn d_max_fatal_error_retries() -> u32 {
    10
}

fn d_fatal_error_interval_multiplier() -> u32 {
    10
}

fn d_operation_delay_threshold_secs() -> u32 {
    5
}

fn d_max_delay_rate() -> u32 {
    10
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_upstream() {
        let cfg = DeferredDeletionConfig::default();
        assert_eq!(cfg.check_interval_secs, 7);
        assert_eq!(cfg.retries_to_retry, 32);
    }

    #[test]
    fn clamp_bounds_both_ends() {
        let low = DeferredDeletionConfig {
            check_interval_secs: 0,
            max_deletions_at_once: 0,
            retries_to_retry: 0,
            max_retryable_error_retries: 0,
            max_fatal_error_retries: 0,
            fatal_error_interval_multiplier: 0,
            operation_delay_threshold_secs: 0,
            max_delay_rate: 0,
        }
        .clamped();
        assert_eq!(low.check_interval_secs, 1);
        assert_eq!(low.max_deletions_at_once, 1);
        assert_eq!(low.retries_to_retry, 1);

        let high = DeferredDeletionConfig {
            check_interval_secs: 999_999,
            max_deletions_at_once: 999_999,
            retries_to_retry: 999_999,
            max_retryable_error_retries: 999_999,
            max_fatal_error_retries: 999_999,
            fatal_error_interval_multiplier: 999_999,
            operation_delay_threshold_secs: 999_999,
            max_delay_rate: 999_999,
        }
        .clamped();
        assert_eq!(high.check_interval_secs, 300);
        assert_eq!(high.max_delay_rate, 100);
    }

    #[test]
    fn deserialize_missing_fields_uses_defaults() {
        let cfg: DeferredDeletionConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(cfg.max_deletions_at_once, 10);
    }
}
