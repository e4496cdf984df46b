//! Periodic clock-skew refresh for the Postgres backend (§4.1): keeps
//! every engine host's view of "now" agreeing with the database server
//! without querying it on every scheduling decision. Only registered
//! when `StoreConfig::backend` is `Postgres` — `MemoryStore` has no
//! server clock to drift from.

use std::sync::Arc;

use async_trait::async_trait;

use uds_domain::Result;
use uds_scheduler::job::Job;
use uds_store::pg::PgStore;

/// How often the skew is recomputed. Drift this small accumulates slowly
/// enough that a tighter interval would only add load for no benefit.
const REFRESH_SECONDS: u32 = 300;

pub struct ClockSkewJob {
    store: Arc<PgStore>,
}

impl ClockSkewJob {
    pub fn new(store: Arc<PgStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl Job for ClockSkewJob {
    fn name(&self) -> &str {
        "clock_skew_refresh"
    }

    fn friendly_name(&self) -> &str {
        "Postgres Clock Skew Refresh"
    }

    fn frequency_seconds(&self) -> u32 {
        REFRESH_SECONDS
    }

    async fn run(&self) -> Result<()> {
        self.store.refresh_clock_skew().await
    }
}
