//! Provider and OS-manager plug-in ports (§6) plus the factory registry
//! that resolves a stored `data_type` string into a running adapter
//! instance (§9).

pub mod registry;
pub mod test_plugin;
pub mod traits;

pub use registry::{OsManagerRegistry, ProviderRegistry};
pub use test_plugin::{TestOsManager, TestProvider};
pub use traits::{ActorData, ConnectionCheck, OsManagerPlugin, ProviderPlugin};
