use serde::{Deserialize, Serialize};

/// Service-manager façade policy: session idle timeouts, login
/// rate-limiting, and publication-rollout notification behavior.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicyConfig {
    /// Seconds an assigned-but-never-connected UserService is left
    /// running before being reclaimed. Clamped to `0..=86_400`; `0`
    /// disables the check.
    #[serde(default = "d_check_unused_time")]
    pub check_unused_time: u32,
    /// When true, a user may hold only one in-use UserService per pool
    /// at a time; requesting a second one logs the first out first.
    #[serde(default)]
    pub exclusive_logout: bool,
    /// When true, a UserService marked stale by a new publication is
    /// force-notified to the user instead of waiting for the next logout.
    #[serde(default)]
    pub notify_removal_by_pub: bool,
    /// Failed logins allowed within `login_block_secs` before the source
    /// is blocked. Clamped to `1..=100`.
    #[serde(default = "d_max_login_tries")]
    pub max_login_tries: u32,
    /// Seconds a source stays blocked after exceeding `max_login_tries`.
    /// Clamped to `1..=86_400`.
    #[serde(default = "d_login_block_secs")]
    pub login_block_secs: u32,
    /// Name of the pool automatically granted to every authenticated
    /// user without an explicit assignment, if any.
    #[serde(default)]
    pub autorun_service: Option<String>,
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            check_unused_time: d_check_unused_time(),
            exclusive_logout: false,
            notify_removal_by_pub: false,
            max_login_tries: d_max_login_tries(),
            login_block_secs: d_login_block_secs(),
            autorun_service: None,
        }
    }
}

impl PolicyConfig {
    pub fn clamped(&self) -> Self {
        Self {
            check_unused_time: self.check_unused_time.clamp(0, 86_400),
            exclusive_logout: self.exclusive_logout,
            notify_removal_by_pub: self.notify_removal_by_pub,
            max_login_tries: self.max_login_tries.clamp(1, 100),
            login_block_secs: self.login_block_secs.clamp(1, 86_400),
            autorun_service: self.autorun_service.clone(),
        }
    }
}

fn d_check_unused_time() -> u32 {
    300
}

fn d_max_login_tries() -> u32 {
    3
}

fn d_login_block_secs() -> u32 {
    300
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_upstream() {
        let cfg = PolicyConfig::default();
        assert_eq!(cfg.check_unused_time, 300);
        assert_eq!(cfg.max_login_tries, 3);
        assert_eq!(cfg.login_block_secs, 300);
        assert!(cfg.autorun_service.is_none());
    }

    #[test]
    fn zero_check_unused_time_disables_check_and_survives_clamp() {
        let cfg = PolicyConfig {
            check_unused_time: 0,
            ..PolicyConfig::default()
        };
        assert_eq!(cfg.clamped().check_unused_time, 0);
    }

    #[test]
    fn login_bounds_are_clamped() {
        let cfg = PolicyConfig {
            max_login_tries: 0,
            login_block_secs: 0,
            ..PolicyConfig::default()
        };
        let clamped = cfg.clamped();
        assert_eq!(clamped.max_login_tries, 1);
        assert_eq!(clamped.login_block_secs, 1);
    }

    #[test]
    fn autorun_service_survives_clamp() {
        let cfg = PolicyConfig {
            autorun_service: Some("default-pool".into()),
            ..PolicyConfig::default()
        };
        assert_eq!(cfg.clamped().autorun_service.as_deref(), Some("default-pool"));
    }
}
