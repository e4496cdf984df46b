use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ids::InternalId;

/// A scheduler claims a row by flipping it to `Running` under the row
/// lock; it flips back to `ForExecute` (with `next_execution` pushed out)
/// once the job completes, whatever the outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScheduleState {
    ForExecute,
    Running,
}

/// One row of periodic work, claimed by exactly one scheduler worker at a
/// time via row locking. The `name` doubles as the job's registry key.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduleRow {
    pub id: InternalId,
    pub name: String,
    /// Seconds between successive executions.
    pub frequency: u32,
    pub last_execution: Option<DateTime<Utc>>,
    pub next_execution: DateTime<Utc>,
    pub state: ScheduleState,
    /// Identifies the engine instance currently holding the row, so a
    /// crashed owner's rows can be recovered on the next startup.
    pub owner_server: Option<String>,
}

impl ScheduleRow {
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.state == ScheduleState::ForExecute && self.next_execution <= now
    }

    pub fn claim(&mut self, owner: impl Into<String>) {
        self.state = ScheduleState::Running;
        self.owner_server = Some(owner.into());
    }

    /// Release a row and schedule its next run, `frequency` seconds out
    /// from the current wall clock regardless of how late this run was.
    pub fn release(&mut self, now: DateTime<Utc>) {
        self.state = ScheduleState::ForExecute;
        self.last_execution = Some(now);
        self.next_execution = now + chrono::Duration::seconds(self.frequency as i64);
        self.owner_server = None;
    }

    /// Forcibly releases a row left `Running` by a server that is no
    /// longer alive, without touching `next_execution` — the job runs
    /// again as soon as a worker notices it is due.
    pub fn release_orphaned(&mut self) {
        self.state = ScheduleState::ForExecute;
        self.owner_server = None;
    }
}
