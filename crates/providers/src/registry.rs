//! Explicit plug-in registration tables (§9 design notes).
//!
//! The original broker discovers plug-ins by walking packages at import
//! time and registering every subclass it finds. We replace that with a
//! factory table populated once at program start: each entry maps a
//! `data_type` string (as stored on the `Provider`/`osmanager` row) to a
//! constructor closure. Building an adapter is then a single hash lookup
//! plus a call, with no reflection and no global mutable registry.

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::Value;

use uds_domain::{Error, Result};

use crate::traits::{OsManagerPlugin, ProviderPlugin};

type ProviderFactory = Arc<dyn Fn(&Value) -> Result<Arc<dyn ProviderPlugin>> + Send + Sync>;
type OsManagerFactory = Arc<dyn Fn(&Value) -> Result<Arc<dyn OsManagerPlugin>> + Send + Sync>;

/// Factory table for [`ProviderPlugin`] adapters, keyed by `data_type`.
#[derive(Default, Clone)]
pub struct ProviderRegistry {
    factories: HashMap<String, ProviderFactory>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a constructor for `data_type`. A second registration
    /// under the same name silently replaces the first, matching how a
    /// config reload would re-register the whole table from scratch.
    pub fn register(
        &mut self,
        data_type: impl Into<String>,
        factory: impl Fn(&Value) -> Result<Arc<dyn ProviderPlugin>> + Send + Sync + 'static,
    ) {
        self.factories.insert(data_type.into(), Arc::new(factory));
    }

    /// Builds an adapter instance from its `data_type` and stored config
    /// blob. Unknown types are a configuration error, not a panic: an
    /// operator typo in `data_type` should surface as a startup failure.
    pub fn build(&self, data_type: &str, config: &Value) -> Result<Arc<dyn ProviderPlugin>> {
        let factory = self.factories.get(data_type).ok_or_else(|| {
            Error::Config(format!("no provider plug-in registered for '{data_type}'"))
        })?;
        factory(config)
    }

    pub fn registered_types(&self) -> Vec<String> {
        let mut types: Vec<String> = self.factories.keys().cloned().collect();
        types.sort();
        types
    }
}

/// Factory table for [`OsManagerPlugin`] adapters, keyed by `data_type`.
#[derive(Default, Clone)]
pub struct OsManagerRegistry {
    factories: HashMap<String, OsManagerFactory>,
}

impl OsManagerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(
        &mut self,
        data_type: impl Into<String>,
        factory: impl Fn(&Value) -> Result<Arc<dyn OsManagerPlugin>> + Send + Sync + 'static,
    ) {
        self.factories.insert(data_type.into(), Arc::new(factory));
    }

    pub fn build(&self, data_type: &str, config: &Value) -> Result<Arc<dyn OsManagerPlugin>> {
        let factory = self.factories.get(data_type).ok_or_else(|| {
            Error::Config(format!(
                "no os-manager plug-in registered for '{data_type}'"
            ))
        })?;
        factory(config)
    }

    pub fn registered_types(&self) -> Vec<String> {
        let mut types: Vec<String> = self.factories.keys().cloned().collect();
        types.sort();
        types
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_plugin::TestProvider;
    use serde_json::json;

    #[test]
    fn build_resolves_a_registered_type() {
        let mut registry = ProviderRegistry::new();
        registry.register("test", |_cfg| Ok(Arc::new(TestProvider::new())));
        let plugin = registry.build("test", &json!({})).unwrap();
        assert_eq!(plugin.data_type(), "test");
    }

    #[test]
    fn build_rejects_an_unknown_type() {
        let registry = ProviderRegistry::new();
        let err = registry.build("ovirt", &json!({})).unwrap_err();
        assert!(err.to_string().contains("ovirt"));
    }

    #[test]
    fn registered_types_is_sorted() {
        let mut registry = ProviderRegistry::new();
        registry.register("zeta", |_| Ok(Arc::new(TestProvider::new())));
        registry.register("alpha", |_| Ok(Arc::new(TestProvider::new())));
        assert_eq!(registry.registered_types(), vec!["alpha", "zeta"]);
    }
}
