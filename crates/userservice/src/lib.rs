//! UserService finite state machine (§4.3): the per-instance lifecycle
//! that every provisioned desktop/app goes through, from `Preparing`
//! through `Usable`/`Removable` to `Removed`.
//!
//! This crate only ever touches a single row at a time through
//! [`uds_store::Store::with_user_service_locked`] — fleet-wide policy
//! (which pool needs more cache, which idle instance to reclaim) lives
//! one layer up, in `uds-cache` and `uds-service-manager`.

pub mod accounting;
pub mod cleanup;
pub mod fsm;

pub use cleanup::{purge_removed, CleanupJob};
pub use fsm::{
    assign_to_user, cancel, check_state_once, deploy_for_cache, deploy_for_user, destroy_once,
    mark_removed, notify_ready_from_osmanager, release, set_in_use_end, set_in_use_start,
};
