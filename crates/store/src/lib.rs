//! Persistence port (§4.1) and its two implementations.
//!
//! [`traits::Store`] is the interface every other `uds-*` crate programs
//! against. [`memory::MemoryStore`] backs unit/integration tests and
//! small single-host deployments. [`pg::PgStore`] is the Postgres-backed
//! implementation used in production, gated behind the `postgres`
//! feature so a test binary never needs a live database to link.

pub mod memory;
#[cfg(feature = "postgres")]
pub mod pg;
pub mod traits;

pub use memory::MemoryStore;
pub use traits::Store;
