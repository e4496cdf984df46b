//! Job registry: the set of named jobs this engine process knows how to
//! run, keyed the same way their [`uds_domain::entities::ScheduleRow`]
//! is keyed.

use std::collections::HashMap;
use std::sync::Arc;

use uds_domain::entities::{ScheduleRow, ScheduleState};
use uds_domain::Result;
use uds_store::Store;

use crate::job::Job;

#[derive(Default)]
pub struct JobRegistry {
    jobs: HashMap<String, Arc<dyn Job>>,
}

impl JobRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, job: Arc<dyn Job>) {
        self.jobs.insert(job.name().to_string(), job);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Job>> {
        self.jobs.get(name).cloned()
    }

    pub fn jobs(&self) -> impl Iterator<Item = &Arc<dyn Job>> {
        self.jobs.values()
    }

    /// Boot-time reconciliation: ensures every registered job has a
    /// Scheduler row, inserting one if missing. `Store::upsert_schedule`
    /// reconciles an existing row's frequency/`next_execution` by name —
    /// the same `ON CONFLICT (name)` behavior `PgStore` implements in
    /// SQL — so this is safe to call on every boot.
    pub async fn ensure_registered(&self, store: &dyn Store) -> Result<()> {
        let now = store.now();
        for job in self.jobs.values() {
            store
                .upsert_schedule(ScheduleRow {
                    id: 0,
                    name: job.name().to_string(),
                    frequency: job.frequency_seconds(),
                    last_execution: None,
                    next_execution: now,
                    state: ScheduleState::ForExecute,
                    owner_server: None,
                })
                .await?;
        }
        Ok(())
    }
}
