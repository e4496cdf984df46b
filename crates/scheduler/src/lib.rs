//! Periodic job discovery and dispatch with distributed mutual exclusion
//! (§4.5). A registered [`Job`] runs at most once at a time across every
//! engine host, enforced by the Store's row lock on its
//! [`uds_domain::entities::ScheduleRow`] rather than by any in-process
//! coordination.

pub mod job;
pub mod registry;
pub mod runner;

pub use job::Job;
pub use registry::JobRegistry;
pub use runner::{SchedulerRunner, StopFlag};
