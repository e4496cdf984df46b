use std::future::Future;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use uds_domain::entities::{
    Account, AccountUsage, DeletionEntry, DeletionQueue, Provider, Publication, ScheduleRow,
    Service, ServicePool, UniqueIdRow, UserService,
};
use uds_domain::ids::{InternalId, ProviderId, ServiceId, ServicePoolId};
use uds_domain::Result;

/// Persistence port every engine crate programs against. `MemoryStore`
/// backs tests and small deployments; `PgStore` talks to Postgres using
/// `SELECT ... FOR UPDATE` so two engine processes never act on the same
/// row at once.
///
/// Methods that mutate a row contended between workers (`claim_schedule`,
/// `claim_unique_id`, `with_user_service_locked`) take the row lock for
/// the duration of the call; everything else is a plain read or
/// whole-row upsert.
#[async_trait]
pub trait Store: Send + Sync + 'static {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }

    // ---- scheduler ----------------------------------------------------
    async fn due_schedules(&self, now: DateTime<Utc>) -> Result<Vec<ScheduleRow>>;
    /// Attempts to claim a specific row for `owner`. Returns `false` if
    /// the row is no longer `ForExecute` (another worker beat us to it).
    async fn claim_schedule(&self, id: InternalId, owner: &str) -> Result<bool>;
    async fn release_schedule(&self, id: InternalId, now: DateTime<Utc>) -> Result<()>;
    /// Crash recovery: forces every row still claimed by `owner` back to
    /// `ForExecute` without touching `next_execution`.
    async fn release_orphaned_schedules(&self, owner: &str) -> Result<usize>;
    /// Crash recovery for *other* hosts: forces every `Running` row whose
    /// `last_execution` is older than `stuck_threshold` back to
    /// `ForExecute`, regardless of which hostname claimed it. Unlike
    /// [`Store::release_orphaned_schedules`] this does not require
    /// knowing the dead owner's name.
    async fn release_stuck_schedules(
        &self,
        now: DateTime<Utc>,
        stuck_threshold: Duration,
    ) -> Result<usize>;
    async fn upsert_schedule(&self, row: ScheduleRow) -> Result<()>;

    // ---- catalog (read-mostly) -----------------------------------------
    async fn list_pools(&self) -> Result<Vec<ServicePool>>;
    async fn get_pool(&self, id: InternalId) -> Result<ServicePool>;
    /// Resolves a [`ServicePool`] by its opaque uuid, the only form a
    /// [`UserService::pool_id`](uds_domain::entities::UserService::pool_id)
    /// foreign key carries.
    async fn get_pool_by_uuid(&self, uuid: ServicePoolId) -> Result<ServicePool>;
    async fn save_pool(&self, pool: ServicePool) -> Result<ServicePool>;
    async fn get_service(&self, id: InternalId) -> Result<Service>;
    async fn save_service(&self, service: Service) -> Result<Service>;
    async fn get_provider(&self, id: InternalId) -> Result<Provider>;
    async fn save_provider(&self, provider: Provider) -> Result<Provider>;
    /// Resolves a [`Service`] by its opaque uuid, the only form a
    /// [`ServicePool::service_id`](uds_domain::entities::ServicePool::service_id)
    /// foreign key carries.
    async fn get_service_by_uuid(&self, uuid: ServiceId) -> Result<Service>;
    /// Resolves a [`Provider`] by its opaque uuid, the only form a
    /// [`Service::provider_id`](uds_domain::entities::Service::provider_id)
    /// foreign key carries.
    async fn get_provider_by_uuid(&self, uuid: ProviderId) -> Result<Provider>;
    async fn active_publication(&self, pool_id: InternalId) -> Result<Option<Publication>>;
    /// Every publication ever made for the pool, including ones still
    /// `Preparing` or already `Skipped`/`Removed`. The cache updater uses
    /// this to tell "no usable publication yet" apart from "one is still
    /// being prepared" (§4.4): the former is fine to grow into, the
    /// latter must wait.
    async fn list_publications(&self, pool_id: InternalId) -> Result<Vec<Publication>>;
    async fn save_publication(&self, publication: Publication) -> Result<Publication>;

    // ---- user services --------------------------------------------------
    async fn get_user_service(&self, id: InternalId) -> Result<UserService>;
    /// Resolves a [`UserService`] by its opaque uuid, the only form a
    /// [`DeletionEntry::service_uuid`](uds_domain::entities::DeletionEntry::service_uuid)
    /// foreign key carries.
    async fn get_user_service_by_uuid(
        &self,
        uuid: uds_domain::ids::UserServiceId,
    ) -> Result<UserService>;
    async fn list_user_services_by_pool(&self, pool_id: InternalId) -> Result<Vec<UserService>>;
    async fn insert_user_service(&self, us: UserService) -> Result<UserService>;
    async fn delete_user_service(&self, id: InternalId) -> Result<()>;
    /// Reads a UserService row under lock, passes it to `f`, and persists
    /// whatever `f` returns. Models the `SELECT ... FOR UPDATE` /
    /// read-modify-write cycle the FSM needs for contended transitions
    /// (e.g. two cache-updater passes racing to assign the same cached
    /// instance).
    async fn with_user_service_locked<F, Fut>(&self, id: InternalId, f: F) -> Result<UserService>
    where
        F: FnOnce(UserService) -> Fut + Send + 'static,
        Fut: Future<Output = Result<UserService>> + Send + 'static;

    // ---- unique id allocator ---------------------------------------------
    /// Implements §4.2 steps 1-3: smallest free `seq` in `range` first,
    /// else `max(assigned) + 1`, else `Ok(None)` ("NOT_AVAILABLE") once
    /// that would exceed `range.1`. The whole decision is made under the
    /// basename's row lock so two concurrent callers never observe the
    /// same free slot.
    async fn claim_unique_id(
        &self,
        basename: &str,
        owner: &str,
        range: (u64, u64),
    ) -> Result<Option<UniqueIdRow>>;
    /// Marks the row unassigned, then purges every unassigned row whose
    /// `seq` is strictly greater than the greatest remaining assigned
    /// `seq` in the same basename, keeping the table from leaking a high
    /// water mark nobody will reuse.
    async fn release_unique_id(&self, basename: &str, seq: u64) -> Result<()>;
    async fn release_unique_ids_older_than(
        &self,
        basename: &str,
        max_age: Duration,
    ) -> Result<usize>;
    async fn transfer_unique_id(&self, basename: &str, seq: u64, new_owner: &str) -> Result<()>;
    /// Releases every row owned by `owner`, across every basename. Used
    /// when the owning UserService is destroyed and every generator it
    /// ever drew from (names, MAC, GID, ...) must give its slot back.
    async fn release_unique_ids_owned_by(&self, owner: &str) -> Result<usize>;

    // ---- accounting ------------------------------------------------------
    async fn open_account_usage(&self, usage: AccountUsage) -> Result<AccountUsage>;
    async fn close_account_usage(&self, id: InternalId, at: DateTime<Utc>) -> Result<()>;
    async fn get_account(&self, id: InternalId) -> Result<Account>;

    // ---- deferred deletion queues ------------------------------------------
    /// Entries in `queue` whose `next_check <= now`, oldest first, capped
    /// at `limit`. The deferred-deletion job is itself a singly-claimed
    /// scheduled job (§4.5), so no further per-entry locking is needed
    /// here the way the scheduler/allocator need row locks.
    async fn due_deletion_entries(
        &self,
        queue: DeletionQueue,
        now: DateTime<Utc>,
        limit: u32,
    ) -> Result<Vec<DeletionEntry>>;
    /// Inserts (`id == 0`) or fully overwrites an existing entry —
    /// advancing/bouncing a queue, or bumping a retry counter, is always
    /// a whole-row rewrite.
    async fn save_deletion_entry(&self, entry: DeletionEntry) -> Result<DeletionEntry>;
    async fn delete_deletion_entry(&self, id: InternalId) -> Result<()>;
    /// Every entry currently in `queue`, for tests and operator tooling.
    async fn list_deletion_entries(&self, queue: DeletionQueue) -> Result<Vec<DeletionEntry>>;
}
