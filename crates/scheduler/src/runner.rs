//! The scheduler run loop (§4.5): claim one due row at a time via the
//! Store's row lock, run its job outside any lock, then release.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration as StdDuration;

use tracing::{error, info, warn};
use uds_domain::entities::ScheduleRow;
use uds_domain::Result;
use uds_store::Store;

use crate::registry::JobRegistry;

/// Cooperative stop signal shared between the loop and whoever asked it
/// to shut down. Checked once per sleep, not mid-job — an in-flight run
/// is always allowed to finish.
#[derive(Clone, Default)]
pub struct StopFlag(Arc<AtomicBool>);

impl StopFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stop(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_stopped(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

pub struct SchedulerRunner {
    registry: Arc<JobRegistry>,
    store: Arc<dyn Store>,
    hostname: String,
    granularity: StdDuration,
    stuck_threshold: chrono::Duration,
}

impl SchedulerRunner {
    pub fn new(
        registry: Arc<JobRegistry>,
        store: Arc<dyn Store>,
        hostname: impl Into<String>,
        granularity_secs: u32,
        stuck_threshold_secs: u32,
    ) -> Self {
        Self {
            registry,
            store,
            hostname: hostname.into(),
            granularity: StdDuration::from_secs(granularity_secs as u64),
            stuck_threshold: chrono::Duration::seconds(stuck_threshold_secs as i64),
        }
    }

    /// Startup crash recovery (§4.5): release anything still marked
    /// `Running` under this hostname from a prior, now-dead instance of
    /// this same process, plus anything stuck past the threshold
    /// regardless of owner.
    pub async fn recover(&self) -> Result<usize> {
        let own = self.store.release_orphaned_schedules(&self.hostname).await?;
        let now = self.store.now();
        let stuck = self.store.release_stuck_schedules(now, self.stuck_threshold).await?;
        if stuck > 0 {
            warn!(count = stuck, "released jobs stuck past threshold");
        }
        Ok(own + stuck)
    }

    /// Runs the loop until `stop` is requested. Each iteration sleeps
    /// `granularity`, claims at most one due row, runs it, and releases.
    pub async fn run(&self, stop: StopFlag) {
        while !stop.is_stopped() {
            tokio::time::sleep(self.granularity).await;
            if stop.is_stopped() {
                break;
            }
            if let Err(e) = self.tick().await {
                error!(error = %e, "scheduler tick failed");
            }
        }
        info!("scheduler run loop stopped");
    }

    /// One pass: claim the earliest due row this process knows a job
    /// for, run it, and release it back to `ForExecute`.
    pub async fn tick(&self) -> Result<()> {
        let now = self.store.now();
        let mut due = self.store.due_schedules(now).await?;
        due.sort_by_key(|r| r.next_execution);

        for row in due {
            let Some(job) = self.registry.get(&row.name) else {
                continue;
            };
            if !self.store.claim_schedule(row.id, &self.hostname).await? {
                continue;
            }
            self.run_claimed(&row, job).await;
            return Ok(());
        }
        Ok(())
    }

    async fn run_claimed(&self, row: &ScheduleRow, job: Arc<dyn crate::job::Job>) {
        info!(job = %row.name, "running scheduled job");
        // No Store row lock is held across this call (§5) — `claim_schedule`
        // already committed the Running state before we got here.
        if let Err(e) = job.run().await {
            error!(job = %row.name, error = %e, "scheduled job failed");
        }
        let now = self.store.now();
        if let Err(e) = self.store.release_schedule(row.id, now).await {
            error!(job = %row.name, error = %e, "failed to release scheduler row");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::AtomicU32;
    use uds_store::MemoryStore;

    struct Counter(Arc<AtomicU32>);
    #[async_trait]
    impl crate::job::Job for Counter {
        fn name(&self) -> &str {
            "counter"
        }
        fn frequency_seconds(&self) -> u32 {
            100_000
        }
        async fn run(&self) -> Result<()> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[tokio::test]
    async fn tick_runs_exactly_one_due_job_and_releases_it() {
        let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
        let mut registry = JobRegistry::new();
        let runs = Arc::new(AtomicU32::new(0));
        registry.register(Arc::new(Counter(runs.clone())));
        let registry = Arc::new(registry);
        registry.ensure_registered(store.as_ref()).await.unwrap();

        let runner = SchedulerRunner::new(registry, store.clone(), "host-a", 2, 900);
        runner.tick().await.unwrap();
        assert_eq!(runs.load(Ordering::SeqCst), 1);

        // The row was released back to ForExecute with next_execution
        // pushed out by the job's frequency, so an immediate second tick
        // does not re-run it.
        runner.tick().await.unwrap();
        assert_eq!(runs.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn recover_releases_orphaned_rows_for_this_host() {
        let store = MemoryStore::new();
        let mut registry = JobRegistry::new();
        registry.register(Arc::new(Counter(Arc::new(AtomicU32::new(0)))));
        registry.ensure_registered(&store).await.unwrap();

        let due = store.due_schedules(store.now()).await.unwrap();
        assert!(store.claim_schedule(due[0].id, "host-a").await.unwrap());

        let store: Arc<dyn Store> = Arc::new(store);
        let registry = Arc::new(registry);
        let runner = SchedulerRunner::new(registry, store.clone(), "host-a", 2, 900);
        let released = runner.recover().await.unwrap();
        assert!(released >= 1);

        let due_again = store.due_schedules(store.now()).await.unwrap();
        assert!(due_again.iter().any(|r| r.name == "counter"));
    }

    #[tokio::test]
    async fn stop_flag_halts_the_loop() {
        let stop = StopFlag::new();
        assert!(!stop.is_stopped());
        stop.stop();
        assert!(stop.is_stopped());
    }
}
