//! Deferred-deletion worker (§4.6): best-effort, retry-bounded
//! reclamation of remote resources that require a stop-before-delete
//! step. Walks each entry forward through `TO_STOP -> STOPPING ->
//! TO_DELETE -> DELETING` (bouncing back a queue after too many
//! no-progress observations), discarding it once the backing resource is
//! confirmed gone or its retry budget is exhausted.

pub mod job;
pub mod queue;
pub mod sweep;
pub mod worker;

pub use job::DeferredDeletionJob;
pub use queue::{apply_step, classify_error, classify_state, delay_rate, Disposition, Step};
pub use sweep::RemovalSweepJob;
pub use worker::DeferredDeletionWorker;
