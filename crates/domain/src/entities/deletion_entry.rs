use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ids::{InternalId, UserServiceId};

/// The four named queues the deferred-deletion worker walks a row
/// through (§4.6). A row never skips a queue on the way to being
/// discarded, though it can bounce backward (`Stopping` -> `ToStop`)
/// when `retries` exhausts without observed progress.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeletionQueue {
    ToStop,
    Stopping,
    ToDelete,
    Deleting,
}

impl DeletionQueue {
    /// The queue a `retries`-exhausted bounce falls back to: `Stopping`
    /// re-issues the stop command from `ToStop`, `Deleting` re-issues the
    /// delete command from `ToDelete`. `ToStop`/`ToDelete` have nothing
    /// to bounce back to — they already are the command-issuing queue.
    pub fn bounce_back(self) -> Option<DeletionQueue> {
        match self {
            DeletionQueue::Stopping => Some(DeletionQueue::ToStop),
            DeletionQueue::Deleting => Some(DeletionQueue::ToDelete),
            DeletionQueue::ToStop | DeletionQueue::ToDelete => None,
        }
    }

    /// The queue a successful poll (or skipped stop step) advances to.
    pub fn next(self) -> Option<DeletionQueue> {
        match self {
            DeletionQueue::ToStop => Some(DeletionQueue::Stopping),
            DeletionQueue::Stopping => Some(DeletionQueue::ToDelete),
            DeletionQueue::ToDelete => Some(DeletionQueue::Deleting),
            DeletionQueue::Deleting => None,
        }
    }
}

/// One entry in the deferred-deletion worker's keyed bag. `vmid` is the
/// provider-native identifier the plug-in's stop/delete/poll calls take;
/// `service_uuid` is the originating UserService, kept for logging after
/// the row itself may already be gone from the main table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeletionEntry {
    pub id: InternalId,
    pub queue: DeletionQueue,
    pub vmid: String,
    pub service_uuid: UserServiceId,
    pub created: DateTime<Utc>,
    pub next_check: DateTime<Utc>,
    /// Consecutive no-progress observations within the *current* queue.
    /// Reset to zero every time the entry moves to a different queue,
    /// including a backward bounce (§9: confirmed intentional).
    pub retries: u32,
    /// `RetryableError` budget, never reset once incremented; an entry
    /// hitting `MAX_RETRAYABLE_ERROR_RETRIES` is dropped permanently.
    pub total_retries: u32,
    /// Non-retryable (`FatalError`) budget, never reset; an entry
    /// hitting `MAX_FATAL_ERROR_RETRIES` is dropped permanently.
    pub fatal_retries: u32,
}

impl DeletionEntry {
    pub fn new(vmid: impl Into<String>, service_uuid: UserServiceId, queue: DeletionQueue, now: DateTime<Utc>) -> Self {
        Self {
            id: 0,
            queue,
            vmid: vmid.into(),
            service_uuid,
            created: now,
            next_check: now,
            retries: 0,
            total_retries: 0,
            fatal_retries: 0,
        }
    }

    /// Advances to the next queue with a fresh `retries` counter and a
    /// `next_check` spaced out by `interval * delay_rate`.
    pub fn advance(&mut self, queue: DeletionQueue, next_check: DateTime<Utc>) {
        self.queue = queue;
        self.retries = 0;
        self.next_check = next_check;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn queue_order_walks_forward_without_skipping() {
        assert_eq!(DeletionQueue::ToStop.next(), Some(DeletionQueue::Stopping));
        assert_eq!(DeletionQueue::Stopping.next(), Some(DeletionQueue::ToDelete));
        assert_eq!(DeletionQueue::ToDelete.next(), Some(DeletionQueue::Deleting));
        assert_eq!(DeletionQueue::Deleting.next(), None);
    }

    #[test]
    fn bounce_back_only_defined_for_polling_queues() {
        assert_eq!(DeletionQueue::Stopping.bounce_back(), Some(DeletionQueue::ToStop));
        assert_eq!(DeletionQueue::Deleting.bounce_back(), Some(DeletionQueue::ToDelete));
        assert_eq!(DeletionQueue::ToStop.bounce_back(), None);
        assert_eq!(DeletionQueue::ToDelete.bounce_back(), None);
    }

    #[test]
    fn advance_resets_retries_but_not_total_or_fatal() {
        let mut e = DeletionEntry::new("vm-1", UserServiceId::new(), DeletionQueue::ToStop, Utc::now());
        e.retries = 5;
        e.total_retries = 2;
        e.fatal_retries = 1;
        e.advance(DeletionQueue::Stopping, Utc::now());
        assert_eq!(e.retries, 0);
        assert_eq!(e.total_retries, 2);
        assert_eq!(e.fatal_retries, 1);
    }
}
