use serde::{Deserialize, Serialize};

/// Restraint (a.k.a. circuit breaker) policy for a provider that keeps
/// failing to create/start instances. Tracked as a sliding window of
/// recent failure timestamps per provider.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RestraintConfig {
    /// Width of the sliding failure-counting window, in seconds. A value
    /// of `0` disables restraint entirely — the provider is never held
    /// back regardless of failure count.
    #[serde(default = "d_restraint_time")]
    pub restraint_time_secs: u32,
    /// Failures within the window before the provider is restrained.
    /// Clamped to `1..=1000` (meaningless, and ignored, when
    /// `restraint_time_secs == 0`).
    #[serde(default = "d_restraint_count")]
    pub restraint_count: u32,
}

impl Default for RestraintConfig {
    fn default() -> Self {
        Self {
            restraint_time_secs: d_restraint_time(),
            restraint_count: d_restraint_count(),
        }
    }
}

impl RestraintConfig {
    /// `restraint_time_secs` is a deliberate on/off switch and is left
    /// untouched by clamping; only `restraint_count` gets bounded.
    pub fn clamped(&self) -> Self {
        Self {
            restraint_time_secs: self.restraint_time_secs,
            restraint_count: self.restraint_count.clamp(1, 1000),
        }
    }

    pub fn is_disabled(&self) -> bool {
        self.restraint_time_secs == 0
    }
}

fn d_restraint_time() -> u32 {
    3600
}

fn d_restraint_count() -> u32 {
    3
}
