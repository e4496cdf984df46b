//! [`Job`] wrapper that drives [`DeferredDeletionWorker::tick`] on the
//! scheduler's cadence, mirroring [`uds_cache::CacheUpdaterJob`].

use std::sync::Arc;

use async_trait::async_trait;

use uds_domain::Result;
use uds_scheduler::job::Job;

use crate::worker::DeferredDeletionWorker;

pub struct DeferredDeletionJob {
    worker: Arc<DeferredDeletionWorker>,
    frequency_seconds: u32,
}

impl DeferredDeletionJob {
    pub fn new(worker: Arc<DeferredDeletionWorker>, frequency_seconds: u32) -> Self {
        Self {
            worker,
            frequency_seconds,
        }
    }

    pub fn worker(&self) -> &Arc<DeferredDeletionWorker> {
        &self.worker
    }
}

#[async_trait]
impl Job for DeferredDeletionJob {
    fn name(&self) -> &str {
        "deferred_deletion"
    }

    fn friendly_name(&self) -> &str {
        "Deferred Deletion Worker"
    }

    fn frequency_seconds(&self) -> u32 {
        self.frequency_seconds
    }

    async fn run(&self) -> Result<()> {
        self.worker.tick().await
    }
}
