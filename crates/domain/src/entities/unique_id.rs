use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ids::InternalId;

/// One row of a contended sequential allocator (names, MAC addresses,
/// group ids, ...). Rows are partitioned by `basename` (e.g. a MAC OUI
/// prefix or a name template) and ordered by `seq` within it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UniqueIdRow {
    pub id: InternalId,
    pub basename: String,
    pub seq: u64,
    /// Opaque owner token (typically a UserService uuid) while assigned;
    /// `None` once released back to the free pool.
    pub owner: Option<String>,
    pub assigned: bool,
    pub stamp: DateTime<Utc>,
}

impl UniqueIdRow {
    pub fn assign(&mut self, owner: impl Into<String>, now: DateTime<Utc>) {
        self.owner = Some(owner.into());
        self.assigned = true;
        self.stamp = now;
    }

    /// Releases without forgetting the row: `seq` is never reused for a
    /// *different* basename, only freed for reassignment within its own.
    pub fn release(&mut self, now: DateTime<Utc>) {
        self.owner = None;
        self.assigned = false;
        self.stamp = now;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn assign_then_release_round_trips() {
        let mut row = UniqueIdRow {
            id: 1,
            basename: "00:50:56".into(),
            seq: 4,
            owner: None,
            assigned: false,
            stamp: Utc::now(),
        };
        let now = Utc::now();
        row.assign("us-1", now);
        assert!(row.assigned);
        assert_eq!(row.owner.as_deref(), Some("us-1"));

        row.release(now);
        assert!(!row.assigned);
        assert!(row.owner.is_none());
    }
}
