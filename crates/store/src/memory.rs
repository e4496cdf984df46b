//! In-process `Store` implementation backed by `RwLock<HashMap<..>>`,
//! mirroring the persist-on-write, broadcast-on-change shape used
//! elsewhere in the engine for small, single-process deployments and for
//! tests. No data survives a process restart unless `persist_path` is
//! set, in which case every mutation is flushed to a JSON snapshot.

use std::collections::HashMap;
use std::future::Future;
use std::path::PathBuf;
use std::sync::atomic::{AtomicI64, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, RwLock};

use uds_domain::entities::{
    Account, AccountUsage, DeletionEntry, DeletionQueue, Provider, Publication, ScheduleRow,
    ScheduleState, Service, ServicePool, UniqueIdRow, UserService,
};
use uds_domain::ids::InternalId;
use uds_domain::{Error, Result};

use crate::traits::Store;

#[derive(Debug, Clone)]
pub enum StoreEvent {
    UserServiceChanged(InternalId),
    ScheduleChanged(InternalId),
}

#[derive(Default, Serialize, Deserialize)]
struct Snapshot {
    providers: Vec<Provider>,
    services: Vec<Service>,
    pools: Vec<ServicePool>,
    publications: Vec<Publication>,
    user_services: Vec<UserService>,
    schedules: Vec<ScheduleRow>,
    unique_ids: Vec<UniqueIdRow>,
    accounts: Vec<Account>,
    account_usages: Vec<AccountUsage>,
    #[serde(default)]
    deletion_entries: Vec<DeletionEntry>,
}

pub struct MemoryStore {
    providers: RwLock<HashMap<InternalId, Provider>>,
    services: RwLock<HashMap<InternalId, Service>>,
    pools: RwLock<HashMap<InternalId, ServicePool>>,
    publications: RwLock<HashMap<InternalId, Publication>>,
    user_services: RwLock<HashMap<InternalId, UserService>>,
    schedules: RwLock<HashMap<InternalId, ScheduleRow>>,
    unique_ids: RwLock<HashMap<(String, u64), UniqueIdRow>>,
    accounts: RwLock<HashMap<InternalId, Account>>,
    account_usages: RwLock<HashMap<InternalId, AccountUsage>>,
    deletion_entries: RwLock<HashMap<InternalId, DeletionEntry>>,

    next_id: AtomicI64,
    /// Overrides `now()` for tests that need to drive time-gated polling
    /// loops (e.g. deferred-deletion retry backoff) deterministically.
    /// `i64::MIN` means "no override, use the wall clock".
    clock_override_millis: AtomicI64,
    persist_path: Option<PathBuf>,
    events: broadcast::Sender<StoreEvent>,
}

impl MemoryStore {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(256);
        Self {
            providers: RwLock::new(HashMap::new()),
            services: RwLock::new(HashMap::new()),
            pools: RwLock::new(HashMap::new()),
            publications: RwLock::new(HashMap::new()),
            user_services: RwLock::new(HashMap::new()),
            schedules: RwLock::new(HashMap::new()),
            unique_ids: RwLock::new(HashMap::new()),
            accounts: RwLock::new(HashMap::new()),
            account_usages: RwLock::new(HashMap::new()),
            deletion_entries: RwLock::new(HashMap::new()),
            next_id: AtomicI64::new(1),
            clock_override_millis: AtomicI64::new(i64::MIN),
            persist_path: None,
            events,
        }
    }

    pub fn with_persist_path(path: impl Into<PathBuf>) -> Self {
        let mut store = Self::new();
        store.persist_path = Some(path.into());
        store.load();
        store
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StoreEvent> {
        self.events.subscribe()
    }

    /// Pins `now()` to `at` until the next call. Tests use this (and
    /// [`Self::advance_clock`]) to drive `next_check`-gated polling loops
    /// without sleeping in wall-clock time.
    pub fn set_clock(&self, at: DateTime<Utc>) {
        self.clock_override_millis.store(at.timestamp_millis(), Ordering::SeqCst);
    }

    /// Moves the store's clock forward by `delta` from wherever it
    /// currently reads (wall clock if never pinned).
    pub fn advance_clock(&self, delta: Duration) {
        let current = self.now();
        self.set_clock(current + delta);
    }

    fn next_id(&self) -> InternalId {
        self.next_id.fetch_add(1, Ordering::SeqCst)
    }

    fn load(&mut self) {
        let Some(path) = &self.persist_path else { return };
        let Ok(data) = std::fs::read_to_string(path) else { return };
        let Ok(snapshot) = serde_json::from_str::<Snapshot>(&data) else { return };

        *self.providers.get_mut() = snapshot.providers.into_iter().map(|p| (p.id, p)).collect();
        *self.services.get_mut() = snapshot.services.into_iter().map(|s| (s.id, s)).collect();
        *self.pools.get_mut() = snapshot.pools.into_iter().map(|p| (p.id, p)).collect();
        *self.publications.get_mut() =
            snapshot.publications.into_iter().map(|p| (p.id, p)).collect();
        *self.user_services.get_mut() =
            snapshot.user_services.into_iter().map(|u| (u.id, u)).collect();
        *self.schedules.get_mut() = snapshot.schedules.into_iter().map(|s| (s.id, s)).collect();
        *self.unique_ids.get_mut() = snapshot
            .unique_ids
            .into_iter()
            .map(|u| ((u.basename.clone(), u.seq), u))
            .collect();
        *self.accounts.get_mut() = snapshot.accounts.into_iter().map(|a| (a.id, a)).collect();
        *self.account_usages.get_mut() =
            snapshot.account_usages.into_iter().map(|u| (u.id, u)).collect();
        *self.deletion_entries.get_mut() =
            snapshot.deletion_entries.into_iter().map(|d| (d.id, d)).collect();

        let max_id = [
            self.providers.get_mut().keys().copied().max(),
            self.services.get_mut().keys().copied().max(),
            self.pools.get_mut().keys().copied().max(),
            self.publications.get_mut().keys().copied().max(),
            self.user_services.get_mut().keys().copied().max(),
            self.schedules.get_mut().keys().copied().max(),
            self.accounts.get_mut().keys().copied().max(),
            self.account_usages.get_mut().keys().copied().max(),
            self.deletion_entries.get_mut().keys().copied().max(),
        ]
        .into_iter()
        .flatten()
        .max()
        .unwrap_or(0);
        self.next_id = AtomicI64::new(max_id + 1);
    }

    async fn persist(&self) {
        let Some(path) = self.persist_path.clone() else { return };
        let snapshot = Snapshot {
            providers: self.providers.read().await.values().cloned().collect(),
            services: self.services.read().await.values().cloned().collect(),
            pools: self.pools.read().await.values().cloned().collect(),
            publications: self.publications.read().await.values().cloned().collect(),
            user_services: self.user_services.read().await.values().cloned().collect(),
            schedules: self.schedules.read().await.values().cloned().collect(),
            unique_ids: self.unique_ids.read().await.values().cloned().collect(),
            accounts: self.accounts.read().await.values().cloned().collect(),
            account_usages: self.account_usages.read().await.values().cloned().collect(),
            deletion_entries: self.deletion_entries.read().await.values().cloned().collect(),
        };
        if let Ok(json) = serde_json::to_string_pretty(&snapshot) {
            let _ = tokio::task::spawn_blocking(move || {
                if let Some(parent) = path.parent() {
                    let _ = std::fs::create_dir_all(parent);
                }
                if let Err(e) = std::fs::write(&path, json) {
                    tracing::warn!(error = %e, "failed to persist store snapshot");
                }
            })
            .await;
        }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Store for MemoryStore {
    fn now(&self) -> DateTime<Utc> {
        match self.clock_override_millis.load(Ordering::SeqCst) {
            i64::MIN => Utc::now(),
            millis => DateTime::from_timestamp_millis(millis).unwrap_or_else(Utc::now),
        }
    }

    async fn due_schedules(&self, now: DateTime<Utc>) -> Result<Vec<ScheduleRow>> {
        Ok(self
            .schedules
            .read()
            .await
            .values()
            .filter(|s| s.is_due(now))
            .cloned()
            .collect())
    }

    async fn claim_schedule(&self, id: InternalId, owner: &str) -> Result<bool> {
        let mut map = self.schedules.write().await;
        let Some(row) = map.get_mut(&id) else {
            return Err(Error::not_found(format!("schedule {id}")));
        };
        if row.state != ScheduleState::ForExecute {
            return Ok(false);
        }
        row.claim(owner);
        drop(map);
        let _ = self.events.send(StoreEvent::ScheduleChanged(id));
        self.persist().await;
        Ok(true)
    }

    async fn release_schedule(&self, id: InternalId, now: DateTime<Utc>) -> Result<()> {
        let mut map = self.schedules.write().await;
        let row = map
            .get_mut(&id)
            .ok_or_else(|| Error::not_found(format!("schedule {id}")))?;
        row.release(now);
        drop(map);
        let _ = self.events.send(StoreEvent::ScheduleChanged(id));
        self.persist().await;
        Ok(())
    }

    async fn release_orphaned_schedules(&self, owner: &str) -> Result<usize> {
        let mut map = self.schedules.write().await;
        let mut n = 0;
        for row in map.values_mut() {
            if row.state == ScheduleState::Running && row.owner_server.as_deref() == Some(owner) {
                row.release_orphaned();
                n += 1;
            }
        }
        drop(map);
        self.persist().await;
        Ok(n)
    }

    async fn release_stuck_schedules(
        &self,
        now: DateTime<Utc>,
        stuck_threshold: Duration,
    ) -> Result<usize> {
        let mut map = self.schedules.write().await;
        let mut n = 0;
        for row in map.values_mut() {
            let stuck = row.state == ScheduleState::Running
                && row
                    .last_execution
                    .map(|t| now.signed_duration_since(t) > stuck_threshold)
                    .unwrap_or(false);
            if stuck {
                row.release_orphaned();
                n += 1;
            }
        }
        drop(map);
        self.persist().await;
        Ok(n)
    }

    async fn upsert_schedule(&self, mut row: ScheduleRow) -> Result<()> {
        let mut map = self.schedules.write().await;
        let existing = map.values().find(|r| r.name == row.name).cloned();
        match existing {
            // A second registration under the same name reconciles
            // frequency/next_execution onto the existing row rather than
            // creating a duplicate, mirroring `PgStore`'s `ON CONFLICT
            // (name)` upsert.
            Some(existing) => {
                row.id = existing.id;
                row.last_execution = existing.last_execution;
                row.owner_server = existing.owner_server;
                row.state = existing.state;
                row.next_execution = if existing.frequency != row.frequency {
                    existing
                        .last_execution
                        .unwrap_or_else(Utc::now)
                        + Duration::seconds(row.frequency as i64)
                } else {
                    existing.next_execution
                };
                map.insert(existing.id, row);
            }
            None => {
                if row.id == 0 {
                    row.id = self.next_id();
                }
                map.insert(row.id, row);
            }
        }
        drop(map);
        self.persist().await;
        Ok(())
    }

    async fn list_pools(&self) -> Result<Vec<ServicePool>> {
        Ok(self.pools.read().await.values().cloned().collect())
    }

    async fn get_pool(&self, id: InternalId) -> Result<ServicePool> {
        self.pools
            .read()
            .await
            .get(&id)
            .cloned()
            .ok_or_else(|| Error::not_found(format!("pool {id}")))
    }

    async fn get_pool_by_uuid(&self, uuid: uds_domain::ids::ServicePoolId) -> Result<ServicePool> {
        self.pools
            .read()
            .await
            .values()
            .find(|p| p.uuid == uuid)
            .cloned()
            .ok_or_else(|| Error::not_found(format!("pool {uuid}")))
    }

    async fn save_pool(&self, mut pool: ServicePool) -> Result<ServicePool> {
        if pool.id == 0 {
            pool.id = self.next_id();
        }
        self.pools.write().await.insert(pool.id, pool.clone());
        self.persist().await;
        Ok(pool)
    }

    async fn get_service(&self, id: InternalId) -> Result<Service> {
        self.services
            .read()
            .await
            .get(&id)
            .cloned()
            .ok_or_else(|| Error::not_found(format!("service {id}")))
    }

    async fn get_service_by_uuid(&self, uuid: uds_domain::ids::ServiceId) -> Result<Service> {
        self.services
            .read()
            .await
            .values()
            .find(|s| s.uuid == uuid)
            .cloned()
            .ok_or_else(|| Error::not_found(format!("service {uuid}")))
    }

    async fn save_service(&self, mut service: Service) -> Result<Service> {
        if service.id == 0 {
            service.id = self.next_id();
        }
        self.services.write().await.insert(service.id, service.clone());
        self.persist().await;
        Ok(service)
    }

    async fn get_provider_by_uuid(&self, uuid: uds_domain::ids::ProviderId) -> Result<Provider> {
        self.providers
            .read()
            .await
            .values()
            .find(|p| p.uuid == uuid)
            .cloned()
            .ok_or_else(|| Error::not_found(format!("provider {uuid}")))
    }

    async fn get_provider(&self, id: InternalId) -> Result<Provider> {
        self.providers
            .read()
            .await
            .get(&id)
            .cloned()
            .ok_or_else(|| Error::not_found(format!("provider {id}")))
    }

    async fn save_provider(&self, mut provider: Provider) -> Result<Provider> {
        if provider.id == 0 {
            provider.id = self.next_id();
        }
        self.providers.write().await.insert(provider.id, provider.clone());
        self.persist().await;
        Ok(provider)
    }

    async fn active_publication(&self, pool_id: InternalId) -> Result<Option<Publication>> {
        let pool_uuid = self.get_pool(pool_id).await?.uuid;
        Ok(self
            .publications
            .read()
            .await
            .values()
            .find(|p| p.pool_id == pool_uuid && p.is_usable())
            .cloned())
    }

    async fn list_publications(&self, pool_id: InternalId) -> Result<Vec<Publication>> {
        let pool_uuid = self.get_pool(pool_id).await?.uuid;
        Ok(self
            .publications
            .read()
            .await
            .values()
            .filter(|p| p.pool_id == pool_uuid)
            .cloned()
            .collect())
    }

    async fn save_publication(&self, mut publication: Publication) -> Result<Publication> {
        if publication.id == 0 {
            publication.id = self.next_id();
        }
        self.publications
            .write()
            .await
            .insert(publication.id, publication.clone());
        self.persist().await;
        Ok(publication)
    }

    async fn get_user_service(&self, id: InternalId) -> Result<UserService> {
        self.user_services
            .read()
            .await
            .get(&id)
            .cloned()
            .ok_or_else(|| Error::not_found(format!("user service {id}")))
    }

    async fn get_user_service_by_uuid(
        &self,
        uuid: uds_domain::ids::UserServiceId,
    ) -> Result<UserService> {
        self.user_services
            .read()
            .await
            .values()
            .find(|u| u.uuid == uuid)
            .cloned()
            .ok_or_else(|| Error::not_found(format!("user service {uuid}")))
    }

    async fn list_user_services_by_pool(&self, pool_id: InternalId) -> Result<Vec<UserService>> {
        let pool = self.get_pool(pool_id).await?;
        Ok(self
            .user_services
            .read()
            .await
            .values()
            .filter(|u| u.pool_id == pool.uuid)
            .cloned()
            .collect())
    }

    async fn insert_user_service(&self, mut us: UserService) -> Result<UserService> {
        if us.id == 0 {
            us.id = self.next_id();
        }
        let id = us.id;
        self.user_services.write().await.insert(id, us.clone());
        let _ = self.events.send(StoreEvent::UserServiceChanged(id));
        self.persist().await;
        Ok(us)
    }

    async fn delete_user_service(&self, id: InternalId) -> Result<()> {
        self.user_services.write().await.remove(&id);
        let _ = self.events.send(StoreEvent::UserServiceChanged(id));
        self.persist().await;
        Ok(())
    }

    async fn with_user_service_locked<F, Fut>(&self, id: InternalId, f: F) -> Result<UserService>
    where
        F: FnOnce(UserService) -> Fut + Send + 'static,
        Fut: Future<Output = Result<UserService>> + Send + 'static,
    {
        // The write lock is held across the whole read-modify-write cycle,
        // which is exactly what `SELECT ... FOR UPDATE` buys us in Postgres.
        let mut map = self.user_services.write().await;
        let current = map
            .get(&id)
            .cloned()
            .ok_or_else(|| Error::not_found(format!("user service {id}")))?;
        let updated = f(current).await?;
        map.insert(id, updated.clone());
        drop(map);
        let _ = self.events.send(StoreEvent::UserServiceChanged(id));
        self.persist().await;
        Ok(updated)
    }

    async fn claim_unique_id(
        &self,
        basename: &str,
        owner: &str,
        range: (u64, u64),
    ) -> Result<Option<UniqueIdRow>> {
        let (range_start, range_end) = range;
        let mut map = self.unique_ids.write().await;
        let now = Utc::now();

        let free_seq = map
            .values()
            .filter(|r| r.basename == basename && !r.assigned && (range_start..=range_end).contains(&r.seq))
            .map(|r| r.seq)
            .min();

        if let Some(seq) = free_seq {
            let row = map.get_mut(&(basename.to_string(), seq)).unwrap();
            row.assign(owner, now);
            let row = row.clone();
            drop(map);
            self.persist().await;
            return Ok(Some(row));
        }

        let max_assigned = map
            .values()
            .filter(|r| r.basename == basename && r.assigned)
            .map(|r| r.seq)
            .max();
        let next_seq = max_assigned.map_or(range_start, |max| max + 1);
        if next_seq > range_end {
            return Ok(None);
        }

        let mut row = UniqueIdRow {
            id: self.next_id(),
            basename: basename.to_string(),
            seq: next_seq,
            owner: None,
            assigned: false,
            stamp: now,
        };
        row.assign(owner, now);
        map.insert((basename.to_string(), next_seq), row.clone());
        drop(map);
        self.persist().await;
        Ok(Some(row))
    }

    async fn release_unique_id(&self, basename: &str, seq: u64) -> Result<()> {
        let mut map = self.unique_ids.write().await;
        if let Some(row) = map.get_mut(&(basename.to_string(), seq)) {
            row.release(Utc::now());
        }

        let max_assigned = map
            .values()
            .filter(|r| r.basename == basename && r.assigned)
            .map(|r| r.seq)
            .max();
        let to_purge: Vec<u64> = map
            .values()
            .filter(|r| {
                r.basename == basename
                    && !r.assigned
                    && max_assigned.map_or(true, |max| r.seq > max)
            })
            .map(|r| r.seq)
            .collect();
        for seq in to_purge {
            map.remove(&(basename.to_string(), seq));
        }
        drop(map);
        self.persist().await;
        Ok(())
    }

    async fn release_unique_ids_older_than(
        &self,
        basename: &str,
        max_age: Duration,
    ) -> Result<usize> {
        let now = Utc::now();
        let mut map = self.unique_ids.write().await;
        let mut n = 0;
        for row in map
            .values_mut()
            .filter(|r| r.basename == basename && r.assigned)
        {
            if now.signed_duration_since(row.stamp) > max_age {
                row.release(now);
                n += 1;
            }
        }
        drop(map);
        self.persist().await;
        Ok(n)
    }

    async fn transfer_unique_id(&self, basename: &str, seq: u64, new_owner: &str) -> Result<()> {
        let mut map = self.unique_ids.write().await;
        let row = map
            .get_mut(&(basename.to_string(), seq))
            .ok_or_else(|| Error::not_found(format!("unique id {basename}/{seq}")))?;
        row.owner = Some(new_owner.to_string());
        row.stamp = Utc::now();
        drop(map);
        self.persist().await;
        Ok(())
    }

    async fn release_unique_ids_owned_by(&self, owner: &str) -> Result<usize> {
        let now = Utc::now();
        let mut map = self.unique_ids.write().await;
        let mut touched_basenames = std::collections::HashSet::new();
        let mut n = 0;
        for row in map.values_mut() {
            if row.assigned && row.owner.as_deref() == Some(owner) {
                row.release(now);
                touched_basenames.insert(row.basename.clone());
                n += 1;
            }
        }
        for basename in touched_basenames {
            let max_assigned = map
                .values()
                .filter(|r| r.basename == basename && r.assigned)
                .map(|r| r.seq)
                .max();
            let to_purge: Vec<u64> = map
                .values()
                .filter(|r| {
                    r.basename == basename
                        && !r.assigned
                        && max_assigned.map_or(true, |max| r.seq > max)
                })
                .map(|r| r.seq)
                .collect();
            for seq in to_purge {
                map.remove(&(basename.clone(), seq));
            }
        }
        drop(map);
        self.persist().await;
        Ok(n)
    }

    async fn open_account_usage(&self, mut usage: AccountUsage) -> Result<AccountUsage> {
        if usage.id == 0 {
            usage.id = self.next_id();
        }
        self.account_usages
            .write()
            .await
            .insert(usage.id, usage.clone());
        self.persist().await;
        Ok(usage)
    }

    async fn close_account_usage(&self, id: InternalId, at: DateTime<Utc>) -> Result<()> {
        let mut map = self.account_usages.write().await;
        let usage = map
            .get_mut(&id)
            .ok_or_else(|| Error::not_found(format!("account usage {id}")))?;
        usage.close(at);
        drop(map);
        self.persist().await;
        Ok(())
    }

    async fn get_account(&self, id: InternalId) -> Result<Account> {
        self.accounts
            .read()
            .await
            .get(&id)
            .cloned()
            .ok_or_else(|| Error::not_found(format!("account {id}")))
    }

    async fn due_deletion_entries(
        &self,
        queue: DeletionQueue,
        now: DateTime<Utc>,
        limit: u32,
    ) -> Result<Vec<DeletionEntry>> {
        let mut due: Vec<DeletionEntry> = self
            .deletion_entries
            .read()
            .await
            .values()
            .filter(|e| e.queue == queue && e.next_check <= now)
            .cloned()
            .collect();
        due.sort_by_key(|e| e.next_check);
        due.truncate(limit as usize);
        Ok(due)
    }

    async fn save_deletion_entry(&self, mut entry: DeletionEntry) -> Result<DeletionEntry> {
        if entry.id == 0 {
            entry.id = self.next_id();
        }
        self.deletion_entries
            .write()
            .await
            .insert(entry.id, entry.clone());
        self.persist().await;
        Ok(entry)
    }

    async fn delete_deletion_entry(&self, id: InternalId) -> Result<()> {
        self.deletion_entries.write().await.remove(&id);
        self.persist().await;
        Ok(())
    }

    async fn list_deletion_entries(&self, queue: DeletionQueue) -> Result<Vec<DeletionEntry>> {
        Ok(self
            .deletion_entries
            .read()
            .await
            .values()
            .filter(|e| e.queue == queue)
            .cloned()
            .collect())
    }
}
