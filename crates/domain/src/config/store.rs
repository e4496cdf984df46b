use serde::{Deserialize, Serialize};

/// Which `Store` implementation the engine wires up at startup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StoreBackend {
    /// `MemoryStore`, optionally snapshotting to `persist_path`. Fine for
    /// a single host or tests; never share it between two engine
    /// processes.
    Memory,
    /// `PgStore`, connected via `database_url`. Required once more than
    /// one engine host runs against the same pools.
    Postgres,
}

impl Default for StoreBackend {
    fn default() -> Self {
        StoreBackend::Memory
    }
}

/// Storage backend selection plus housekeeping: how long terminal rows
/// and their logs linger before the cleanup pass purges them.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    #[serde(default)]
    pub backend: StoreBackend,
    /// Required when `backend = "postgres"`.
    #[serde(default)]
    pub database_url: Option<String>,
    /// Clamped to `1..=100`. Only consulted for the Postgres backend.
    #[serde(default = "d_max_connections")]
    pub max_connections: u32,
    /// Where `MemoryStore` snapshots its state between restarts. `None`
    /// keeps it purely in-memory. Ignored for the Postgres backend.
    #[serde(default)]
    pub persist_path: Option<String>,
    /// Seconds between cleanup passes over removed rows. Clamped to `60..=86400`.
    #[serde(default = "d_cleanup_check")]
    pub cleanup_check: u32,
    /// Seconds a removed UserService's row is kept around for
    /// post-mortem inspection before it is purged. Clamped to `0..=2_592_000` (30 days).
    #[serde(default = "d_keep_info_time")]
    pub keep_info_time: u32,
    /// Max log lines retained per UserService before the oldest are
    /// dropped. Clamped to `1..=10_000`.
    #[serde(default = "d_max_logs_per_element")]
    pub max_logs_per_element: u32,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: StoreBackend::default(),
            database_url: None,
            max_connections: d_max_connections(),
            persist_path: None,
            cleanup_check: d_cleanup_check(),
            keep_info_time: d_keep_info_time(),
            max_logs_per_element: d_max_logs_per_element(),
        }
    }
}

impl StoreConfig {
    pub fn clamped(&self) -> Self {
        Self {
            backend: self.backend,
            database_url: self.database_url.clone(),
            max_connections: self.max_connections.clamp(1, 100),
            persist_path: self.persist_path.clone(),
            cleanup_check: self.cleanup_check.clamp(60, 86_400),
            keep_info_time: self.keep_info_time.clamp(0, 2_592_000),
            max_logs_per_element: self.max_logs_per_element.clamp(1, 10_000),
        }
    }
}

fn d_max_connections() -> u32 {
    10
}

fn d_cleanup_check() -> u32 {
    3600
}

fn d_keep_info_time() -> u32 {
    14 * 86_400
}

fn d_max_logs_per_element() -> u32 {
    100
}
