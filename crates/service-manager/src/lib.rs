//! Service manager façade (§4.7): the surface REST handlers and
//! OS-manager callbacks go through — `get_user_service`,
//! `notify_ready_from_osmanager`, `notify_event` — plus the calendar
//! access policy pools are gated by.

pub mod access;
pub mod facade;
pub mod reclaim;

pub use access::{is_access_allowed, seconds_of_week};
pub use facade::{AgentEvent, GetServiceOutcome, ServiceManager};
pub use reclaim::{reclaim_unused, ReclaimUnusedJob};
