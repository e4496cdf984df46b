pub mod account;
pub mod deletion_entry;
pub mod provider;
pub mod publication;
pub mod scheduler_row;
pub mod service;
pub mod service_pool;
pub mod unique_id;
pub mod user_service;

pub use account::{Account, AccountUsage};
pub use deletion_entry::{DeletionEntry, DeletionQueue};
pub use provider::Provider;
pub use publication::{Publication, PublicationState};
pub use scheduler_row::{ScheduleRow, ScheduleState};
pub use service::{MaxServicesCountType, Service};
pub use service_pool::{AccessAction, CalendarRule, ServicePool, ServicePoolState};
pub use unique_id::UniqueIdRow;
pub use user_service::{CacheLevel, OsState, UserService, UserServiceState};
