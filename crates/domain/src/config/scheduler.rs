use serde::{Deserialize, Serialize};

/// Scheduler and deferred-deletion worker pool sizing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Worker threads running deferred-deletion retries. Clamped to `1..=64`.
    #[serde(default = "d_delayed_tasks_threads")]
    pub delayed_tasks_threads: u32,
    /// Worker threads polling the schedule table. Clamped to `1..=64`.
    #[serde(default = "d_scheduler_threads")]
    pub scheduler_threads: u32,
    /// Run-loop sleep between claim attempts, in seconds. Clamped to `1..=300`.
    #[serde(default = "d_granularity_secs")]
    pub granularity_secs: u32,
    /// A `Running` row older than this is considered abandoned by a dead
    /// owner and is recovered rather than waited on. Clamped to `60..=3600`.
    #[serde(default = "d_stuck_threshold_secs")]
    pub stuck_threshold_secs: u32,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            delayed_tasks_threads: d_delayed_tasks_threads(),
            scheduler_threads: d_scheduler_threads(),
            granularity_secs: d_granularity_secs(),
            stuck_threshold_secs: d_stuck_threshold_secs(),
        }
    }
}

impl SchedulerConfig {
    pub fn clamped(&self) -> Self {
        Self {
            delayed_tasks_threads: self.delayed_tasks_threads.clamp(1, 64),
            scheduler_threads: self.scheduler_threads.clamp(1, 64),
            granularity_secs: self.granularity_secs.clamp(1, 300),
            stuck_threshold_secs: self.stuck_threshold_secs.clamp(60, 3600),
        }
    }
}

fn d_delayed_tasks_threads() -> u32 {
    4
}

fn d_scheduler_threads() -> u32 {
    3
}

fn d_granularity_secs() -> u32 {
    2
}

fn d_stuck_threshold_secs() -> u32 {
    15 * 60
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_upstream() {
        let cfg = SchedulerConfig::default();
        assert_eq!(cfg.delayed_tasks_threads, 4);
        assert_eq!(cfg.scheduler_threads, 3);
    }

    #[test]
    fn clamp_rejects_zero_threads() {
        let cfg = SchedulerConfig {
            delayed_tasks_threads: 0,
            scheduler_threads: 0,
            granularity_secs: 0,
            stuck_threshold_secs: 0,
        };
        let clamped = cfg.clamped();
        assert_eq!(clamped.delayed_tasks_threads, 1);
        assert_eq!(clamped.scheduler_threads, 1);
        assert_eq!(clamped.granularity_secs, 1);
        assert_eq!(clamped.stuck_threshold_secs, 60);
    }

    #[test]
    fn clamp_caps_runaway_config() {
        let cfg = SchedulerConfig {
            delayed_tasks_threads: 1000,
            scheduler_threads: 1000,
            granularity_secs: 10_000,
            stuck_threshold_secs: 1_000_000,
        };
        let clamped = cfg.clamped();
        assert_eq!(clamped.delayed_tasks_threads, 64);
        assert_eq!(clamped.scheduler_threads, 64);
        assert_eq!(clamped.granularity_secs, 300);
        assert_eq!(clamped.stuck_threshold_secs, 3600);
    }

    #[test]
    fn deserialize_missing_fields_uses_defaults() {
        let cfg: SchedulerConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(cfg.delayed_tasks_threads, 4);
    }
}
