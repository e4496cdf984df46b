use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ids::{AccountId, InternalId, UserServiceId};

/// A billing/usage grouping that UserServices can optionally be attached
/// to. Tracking is opt-in per pool; most deployments never populate it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Account {
    pub id: InternalId,
    pub uuid: AccountId,
    pub name: String,
    /// Time unit usage is billed in, in seconds (e.g. 3600 for hourly).
    pub time_mark: u32,
}

/// One open-or-closed usage interval for a UserService under an account.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccountUsage {
    pub id: InternalId,
    pub account_id: AccountId,
    pub user_service_id: UserServiceId,
    pub user_name: String,
    pub pool_name: String,
    pub start: DateTime<Utc>,
    /// `None` while the usage interval is still open.
    pub end: Option<DateTime<Utc>>,
}

impl AccountUsage {
    pub fn is_open(&self) -> bool {
        self.end.is_none()
    }

    pub fn close(&mut self, at: DateTime<Utc>) {
        self.end = Some(at);
    }

    /// Elapsed seconds, rounded up to the account's `time_mark` unit, as
    /// billed in the original accounting job.
    pub fn billed_seconds(&self, account: &Account, at: DateTime<Utc>) -> i64 {
        let end = self.end.unwrap_or(at);
        let elapsed = (end - self.start).num_seconds().max(0);
        let mark = account.time_mark.max(1) as i64;
        ((elapsed + mark - 1) / mark) * mark
    }
}
