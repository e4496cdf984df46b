mod cache;
mod deferred_deletion;
mod observability;
mod policy;
mod restraint;
mod scheduler;
mod store;

pub use cache::CacheUpdaterConfig;
pub use deferred_deletion::DeferredDeletionConfig;
pub use observability::ObservabilityConfig;
pub use policy::PolicyConfig;
pub use restraint::RestraintConfig;
pub use scheduler::SchedulerConfig;
pub use store::{StoreBackend, StoreConfig};

use std::fmt;

use serde::{Deserialize, Serialize};

/// The full configuration tree for an engine process, loaded once at
/// startup from a TOML file and shared read-only thereafter.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct EngineConfig {
    #[serde(default)]
    pub observability: ObservabilityConfig,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub cache: CacheUpdaterConfig,
    #[serde(default)]
    pub deferred_deletion: DeferredDeletionConfig,
    #[serde(default)]
    pub restraint: RestraintConfig,
    #[serde(default)]
    pub policy: PolicyConfig,
}

impl EngineConfig {
    /// Applies every sub-config's `clamped()` so an operator-edited TOML
    /// file can never push a worker pool or timer to zero or to an
    /// absurdly large value.
    pub fn clamped(&self) -> Self {
        Self {
            observability: self.observability.clone(),
            store: self.store.clamped(),
            scheduler: self.scheduler.clamped(),
            cache: self.cache.clamped(),
            deferred_deletion: self.deferred_deletion.clamped(),
            restraint: self.restraint.clamped(),
            policy: self.policy.clamped(),
        }
    }

    /// Validates cross-field constraints `clamped()` cannot express on
    /// its own (e.g. a Postgres backend with no connection string).
    /// Returns an empty vec when everything looks good.
    pub fn validate(&self) -> Vec<ConfigError> {
        let mut errors = Vec::new();

        if self.store.backend == StoreBackend::Postgres && self.store.database_url.is_none() {
            errors.push(ConfigError {
                severity: ConfigSeverity::Error,
                field: "store.database_url".into(),
                message: "required when store.backend = \"postgres\"".into(),
            });
        }
        if self.store.backend == StoreBackend::Memory && self.store.persist_path.is_none() {
            errors.push(ConfigError {
                severity: ConfigSeverity::Warning,
                field: "store.persist_path".into(),
                message: "unset: state will not survive a restart".into(),
            });
        }

        errors
    }
}

/// Severity level for a configuration issue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigSeverity {
    Error,
    Warning,
}

/// A single configuration validation issue.
#[derive(Debug, Clone)]
pub struct ConfigError {
    pub severity: ConfigSeverity,
    pub field: String,
    pub message: String,
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let tag = match self.severity {
            ConfigSeverity::Error => "ERROR",
            ConfigSeverity::Warning => "WARN",
        };
        write!(f, "[{tag}] {}: {}", self.field, self.message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_already_clamped() {
        let cfg = EngineConfig::default();
        let clamped = cfg.clamped();
        assert_eq!(clamped.store.cleanup_check, cfg.store.cleanup_check);
        assert_eq!(
            clamped.scheduler.scheduler_threads,
            cfg.scheduler.scheduler_threads
        );
    }

    #[test]
    fn deserialize_empty_toml_uses_all_defaults() {
        let cfg: EngineConfig = toml::from_str("").unwrap();
        assert_eq!(cfg.observability.service_name, "uds-engine");
        assert_eq!(cfg.scheduler.scheduler_threads, 3);
        assert_eq!(cfg.cache.cache_check_delay, 20);
    }

    #[test]
    fn deserialize_partial_toml_overrides_only_given_section() {
        let toml_str = r#"
            [cache]
            cache_check_delay = 5
        "#;
        let cfg: EngineConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(cfg.cache.cache_check_delay, 5);
        assert_eq!(cfg.cache.max_preparing_services, 15);
        assert_eq!(cfg.scheduler.scheduler_threads, 3);
    }

    #[test]
    fn postgres_backend_without_a_url_is_an_error() {
        let cfg = EngineConfig {
            store: StoreConfig {
                backend: StoreBackend::Postgres,
                ..StoreConfig::default()
            },
            ..EngineConfig::default()
        };
        let issues = cfg.validate();
        assert!(issues.iter().any(|e| e.severity == ConfigSeverity::Error && e.field == "store.database_url"));
    }

    #[test]
    fn memory_backend_without_a_persist_path_only_warns() {
        let cfg = EngineConfig::default();
        let issues = cfg.validate();
        assert!(issues.iter().all(|e| e.severity != ConfigSeverity::Error));
        assert!(issues.iter().any(|e| e.field == "store.persist_path"));
    }
}
