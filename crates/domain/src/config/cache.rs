use serde::{Deserialize, Serialize};

/// Cache updater pacing and concurrency limits.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheUpdaterConfig {
    /// Seconds between reconciliation passes over a pool. Clamped to `5..=3600`.
    #[serde(default = "d_cache_check_delay")]
    pub cache_check_delay: u32,
    /// Max UserServices in `Preparing` at once, across all pools. Clamped to `1..=1000`.
    #[serde(default = "d_max_preparing_services")]
    pub max_preparing_services: u32,
    /// Max UserServices being destroyed at once, across all pools. Clamped to `1..=1000`.
    #[serde(default = "d_max_removing_services")]
    pub max_removing_services: u32,
    /// When true, provider concurrency limits are not enforced, only the
    /// two caps above.
    #[serde(default)]
    pub ignore_limits: bool,
}

impl Default for CacheUpdaterConfig {
    fn default() -> Self {
        Self {
            cache_check_delay: d_cache_check_delay(),
            max_preparing_services: d_max_preparing_services(),
            max_removing_services: d_max_removing_services(),
            ignore_limits: false,
        }
    }
}

impl CacheUpdaterConfig {
    pub fn clamped(&self) -> Self {
        Self {
            cache_check_delay: self.cache_check_delay.clamp(5, 3600),
            max_preparing_services: self.max_preparing_services.clamp(1, 1000),
            max_removing_services: self.max_removing_services.clamp(1, 1000),
            ignore_limits: self.ignore_limits,
        }
    }
}

fn d_cache_check_delay() -> u32 {
    20
}

fn d_max_preparing_services() -> u32 {
    15
}

fn d_max_removing_services() -> u32 {
    15
}
