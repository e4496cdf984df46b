//! Postgres-backed [`Store`]. Contended cross-host decisions (`§5`) go
//! through `SELECT ... FOR UPDATE` inside a single transaction; the
//! Scheduler and UniqueID Allocator are the two callers that actually
//! need the row lock to outlive more than one statement, so those are
//! the two methods below that open an explicit transaction instead of
//! a single `UPDATE ... RETURNING`.
//!
//! Query strings are plain runtime-checked SQL (`sqlx::query`/`query_as`
//! without the `query!` macro family) so this crate links without a live
//! database at build time, matching how the rest of the corpus avoids
//! compile-time DB checks in favor of integration tests against a real
//! instance.

use std::future::Future;
use std::sync::atomic::{AtomicI64, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde_json::Value as Json;
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Row};

use uds_domain::entities::{
    Account, AccountUsage, AccessAction, CacheLevel, CalendarRule, DeletionEntry, DeletionQueue,
    MaxServicesCountType, OsState, Provider, Publication, PublicationState, ScheduleRow,
    ScheduleState, Service, ServicePool, ServicePoolState, UniqueIdRow, UserService,
    UserServiceState,
};
use uds_domain::ids::InternalId;
use uds_domain::{Error, Result};

use crate::traits::Store;

pub struct PgStore {
    pool: PgPool,
    /// `local_now() + skew_ms` approximates the DB server's clock so
    /// every host in the deployment agrees on "now" without querying the
    /// database on every scheduling decision (§4.1, §9 "keep that: it
    /// eliminates skew across hosts").
    skew_ms: AtomicI64,
}

impl PgStore {
    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await
            .map_err(|e| Error::fatal(format!("connecting to store: {e}")))?;
        let store = Self {
            pool,
            skew_ms: AtomicI64::new(0),
        };
        store.refresh_clock_skew().await?;
        Ok(store)
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self {
            pool,
            skew_ms: AtomicI64::new(0),
        }
    }

    /// Recomputes the offset between this host's clock and the DB
    /// server's. Called once at startup and periodically by the engine's
    /// own housekeeping job; never on the hot scheduling path.
    pub async fn refresh_clock_skew(&self) -> Result<()> {
        let row = sqlx::query("SELECT now() AS server_now")
            .fetch_one(&self.pool)
            .await
            .map_err(map_err)?;
        let server_now: DateTime<Utc> = row.try_get("server_now").map_err(map_err)?;
        let skew = server_now.signed_duration_since(Utc::now()).num_milliseconds();
        self.skew_ms.store(skew, Ordering::Relaxed);
        Ok(())
    }

    fn run_migrations_sql() -> &'static str {
        include_str!("../migrations/0001_init.sql")
    }

    /// Applies the bundled schema. Intended for fresh test databases and
    /// the `doctor` CLI command; production deployments run the same SQL
    /// through their own migration tooling.
    pub async fn migrate(&self) -> Result<()> {
        sqlx::raw_sql(Self::run_migrations_sql())
            .execute(&self.pool)
            .await
            .map_err(map_err)?;
        Ok(())
    }
}

fn map_err(e: sqlx::Error) -> Error {
    match &e {
        sqlx::Error::RowNotFound => Error::not_found(e.to_string()),
        sqlx::Error::Database(db) if db.is_unique_violation() => {
            Error::retryable(format!("unique violation (concurrent allocator): {e}"))
        }
        sqlx::Error::PoolTimedOut | sqlx::Error::Io(_) => Error::retryable(e.to_string()),
        _ => Error::Store(e.to_string()),
    }
}

fn parse_us_state(s: &str) -> UserServiceState {
    match s {
        "preparing" => UserServiceState::Preparing,
        "usable" => UserServiceState::Usable,
        "removable" => UserServiceState::Removable,
        "removed" => UserServiceState::Removed,
        "canceling" => UserServiceState::Canceling,
        _ => UserServiceState::Error,
    }
}

fn us_state_str(s: UserServiceState) -> &'static str {
    match s {
        UserServiceState::Preparing => "preparing",
        UserServiceState::Usable => "usable",
        UserServiceState::Removable => "removable",
        UserServiceState::Removed => "removed",
        UserServiceState::Canceling => "canceling",
        UserServiceState::Error => "error",
    }
}

fn parse_os_state(s: &str) -> OsState {
    if s == "usable" {
        OsState::Usable
    } else {
        OsState::Preparing
    }
}

fn parse_cache_level(n: i16) -> CacheLevel {
    match n {
        1 => CacheLevel::L1,
        2 => CacheLevel::L2,
        _ => CacheLevel::Assigned,
    }
}

fn row_to_user_service(row: &sqlx::postgres::PgRow) -> Result<UserService> {
    let properties: Json = row.try_get("properties").map_err(map_err)?;
    let properties = properties
        .as_object()
        .map(|m| {
            m.iter()
                .map(|(k, v)| (k.clone(), v.as_str().unwrap_or_default().to_string()))
                .collect()
        })
        .unwrap_or_default();
    let uuid_str: String = row.try_get("uuid").map_err(map_err)?;
    let user_id: Option<String> = row.try_get("user_id").map_err(map_err)?;
    let account_id: Option<String> = row.try_get("account_id").map_err(map_err)?;
    let pool_uuid: String = row.try_get("pool_uuid").map_err(map_err)?;

    Ok(UserService {
        id: row.try_get::<i64, _>("id").map_err(map_err)?,
        uuid: uuid_str.parse::<uuid::Uuid>().map_err(|e| Error::fatal(e.to_string()))?.into(),
        pool_id: pool_uuid.parse::<uuid::Uuid>().map_err(|e| Error::fatal(e.to_string()))?.into(),
        state: parse_us_state(row.try_get::<String, _>("state").map_err(map_err)?.as_str()),
        os_state: parse_os_state(row.try_get::<String, _>("os_state").map_err(map_err)?.as_str()),
        cache_level: parse_cache_level(row.try_get("cache_level").map_err(map_err)?),
        user_id: user_id
            .map(|u| u.parse::<uuid::Uuid>().map(Into::into))
            .transpose()
            .map_err(|e: uuid::Error| Error::fatal(e.to_string()))?,
        account_id: account_id
            .map(|a| a.parse::<uuid::Uuid>().map(Into::into))
            .transpose()
            .map_err(|e: uuid::Error| Error::fatal(e.to_string()))?,
        publication_id: None,
        publication_revision: row.try_get("publication_revision").map_err(map_err)?,
        unique_id: row.try_get("unique_id").map_err(map_err)?,
        in_use: row.try_get("in_use").map_err(map_err)?,
        in_use_date: row.try_get("in_use_date").map_err(map_err)?,
        src_ip: row.try_get("src_ip").map_err(map_err)?,
        src_hostname: row.try_get("src_hostname").map_err(map_err)?,
        creation_date: row.try_get("creation_date").map_err(map_err)?,
        state_date: row.try_get("state_date").map_err(map_err)?,
        error_reason: row.try_get("error_reason").map_err(map_err)?,
        to_be_replaced: row.try_get("to_be_replaced").map_err(map_err)?,
        destroy_after: row.try_get("destroy_after").map_err(map_err)?,
        data: row.try_get::<Vec<u8>, _>("data").map_err(map_err)?,
        properties,
    })
}

#[async_trait]
impl Store for PgStore {
    fn now(&self) -> DateTime<Utc> {
        Utc::now() + Duration::milliseconds(self.skew_ms.load(Ordering::Relaxed))
    }

    async fn due_schedules(&self, now: DateTime<Utc>) -> Result<Vec<ScheduleRow>> {
        let rows = sqlx::query(
            "SELECT id, name, frequency, last_execution, next_execution, state, owner_server \
             FROM scheduler WHERE state = 'for_execute' AND next_execution <= $1 \
             ORDER BY next_execution",
        )
        .bind(now)
        .fetch_all(&self.pool)
        .await
        .map_err(map_err)?;

        rows.into_iter()
            .map(|row| {
                Ok(ScheduleRow {
                    id: row.try_get("id").map_err(map_err)?,
                    name: row.try_get("name").map_err(map_err)?,
                    frequency: row.try_get::<i32, _>("frequency").map_err(map_err)? as u32,
                    last_execution: row.try_get("last_execution").map_err(map_err)?,
                    next_execution: row.try_get("next_execution").map_err(map_err)?,
                    state: if row.try_get::<String, _>("state").map_err(map_err)? == "running" {
                        ScheduleState::Running
                    } else {
                        ScheduleState::ForExecute
                    },
                    owner_server: row.try_get("owner_server").map_err(map_err)?,
                })
            })
            .collect()
    }

    async fn claim_schedule(&self, id: InternalId, owner: &str) -> Result<bool> {
        let mut tx = self.pool.begin().await.map_err(map_err)?;
        let row = sqlx::query("SELECT state FROM scheduler WHERE id = $1 FOR UPDATE")
            .bind(id)
            .fetch_optional(&mut *tx)
            .await
            .map_err(map_err)?
            .ok_or_else(|| Error::not_found(format!("schedule {id}")))?;
        let state: String = row.try_get("state").map_err(map_err)?;
        if state != "for_execute" {
            tx.rollback().await.map_err(map_err)?;
            return Ok(false);
        }
        sqlx::query(
            "UPDATE scheduler SET state = 'running', owner_server = $2, last_execution = now() \
             WHERE id = $1",
        )
        .bind(id)
        .bind(owner)
        .execute(&mut *tx)
        .await
        .map_err(map_err)?;
        tx.commit().await.map_err(map_err)?;
        Ok(true)
    }

    async fn release_schedule(&self, id: InternalId, now: DateTime<Utc>) -> Result<()> {
        sqlx::query(
            "UPDATE scheduler SET state = 'for_execute', owner_server = NULL, \
             last_execution = $2, \
             next_execution = $2 + make_interval(secs => frequency) \
             WHERE id = $1",
        )
        .bind(id)
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(map_err)?;
        Ok(())
    }

    async fn release_orphaned_schedules(&self, owner: &str) -> Result<usize> {
        let result = sqlx::query(
            "UPDATE scheduler SET state = 'for_execute', owner_server = NULL \
             WHERE state = 'running' AND owner_server = $1",
        )
        .bind(owner)
        .execute(&self.pool)
        .await
        .map_err(map_err)?;
        Ok(result.rows_affected() as usize)
    }

    async fn release_stuck_schedules(
        &self,
        now: DateTime<Utc>,
        stuck_threshold: Duration,
    ) -> Result<usize> {
        let result = sqlx::query(
            "UPDATE scheduler SET state = 'for_execute', owner_server = NULL \
             WHERE state = 'running' AND last_execution < $1",
        )
        .bind(now - stuck_threshold)
        .execute(&self.pool)
        .await
        .map_err(map_err)?;
        Ok(result.rows_affected() as usize)
    }

    async fn upsert_schedule(&self, row: ScheduleRow) -> Result<()> {
        sqlx::query(
            "INSERT INTO scheduler (id, name, frequency, last_execution, next_execution, state, owner_server) \
             VALUES (COALESCE(NULLIF($1, 0), nextval(pg_get_serial_sequence('scheduler','id'))), $2, $3, $4, $5, $6, $7) \
             ON CONFLICT (name) DO UPDATE SET \
               frequency = EXCLUDED.frequency, \
               next_execution = CASE WHEN scheduler.frequency <> EXCLUDED.frequency \
                 THEN COALESCE(scheduler.last_execution, now()) + make_interval(secs => EXCLUDED.frequency) \
                 ELSE scheduler.next_execution END",
        )
        .bind(row.id)
        .bind(&row.name)
        .bind(row.frequency as i32)
        .bind(row.last_execution)
        .bind(row.next_execution)
        .bind(if row.state == ScheduleState::Running { "running" } else { "for_execute" })
        .bind(&row.owner_server)
        .execute(&self.pool)
        .await
        .map_err(map_err)?;
        Ok(())
    }

    async fn list_pools(&self) -> Result<Vec<ServicePool>> {
        let rows = sqlx::query("SELECT * FROM service_pools").fetch_all(&self.pool).await.map_err(map_err)?;
        rows.iter().map(row_to_pool).collect()
    }

    async fn get_pool(&self, id: InternalId) -> Result<ServicePool> {
        let row = sqlx::query("SELECT * FROM service_pools WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(map_err)?
            .ok_or_else(|| Error::not_found(format!("pool {id}")))?;
        row_to_pool(&row)
    }

    async fn get_pool_by_uuid(&self, uuid: uds_domain::ids::ServicePoolId) -> Result<ServicePool> {
        let row = sqlx::query("SELECT * FROM service_pools WHERE uuid = $1")
            .bind(uuid.0.to_string())
            .fetch_optional(&self.pool)
            .await
            .map_err(map_err)?
            .ok_or_else(|| Error::not_found(format!("pool {uuid}")))?;
        row_to_pool(&row)
    }

    async fn save_pool(&self, pool: ServicePool) -> Result<ServicePool> {
        let state = match pool.state {
            ServicePoolState::Active => "active",
            ServicePoolState::Removable => "removable",
            ServicePoolState::Removed => "removed",
        };
        let fallback = match pool.fallback_access {
            AccessAction::Allow => "allow",
            AccessAction::Deny => "deny",
        };
        let row = sqlx::query(
            "INSERT INTO service_pools (id, uuid, name, service_id, state, initial_srvs, \
             cache_l1_srvs, cache_l2_srvs, max_srvs, current_pub_revision, \
             show_transports, visible, allow_users_remove, allow_users_reset, fallback_access) \
             VALUES (COALESCE(NULLIF($1,0), nextval(pg_get_serial_sequence('service_pools','id'))), \
             $2,$3,$4,$5,$6,$7,$8,$9,$10,$11,$12,$13,$14,$15) \
             ON CONFLICT (id) DO UPDATE SET name=EXCLUDED.name, state=EXCLUDED.state, \
             initial_srvs=EXCLUDED.initial_srvs, cache_l1_srvs=EXCLUDED.cache_l1_srvs, \
             cache_l2_srvs=EXCLUDED.cache_l2_srvs, max_srvs=EXCLUDED.max_srvs, \
             current_pub_revision=EXCLUDED.current_pub_revision \
             RETURNING *",
        )
        .bind(pool.id)
        .bind(pool.uuid.0.to_string())
        .bind(&pool.name)
        .bind(0i64) // service_id resolved separately; callers pass a pre-existing row in practice
        .bind(state)
        .bind(pool.initial_srvs as i32)
        .bind(pool.cache_l1_srvs as i32)
        .bind(pool.cache_l2_srvs as i32)
        .bind(pool.max_srvs as i32)
        .bind(pool.current_pub_revision.map(|r| r as i32))
        .bind(pool.show_transports)
        .bind(pool.visible)
        .bind(pool.allow_users_remove)
        .bind(pool.allow_users_reset)
        .bind(fallback)
        .fetch_one(&self.pool)
        .await
        .map_err(map_err)?;
        row_to_pool(&row)
    }

    async fn get_service(&self, id: InternalId) -> Result<Service> {
        let row = sqlx::query("SELECT * FROM services WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(map_err)?
            .ok_or_else(|| Error::not_found(format!("service {id}")))?;
        Ok(Service {
            id: row.try_get("id").map_err(map_err)?,
            uuid: parse_uuid(&row, "uuid")?,
            provider_id: parse_uuid(&row, "provider_id").or_else(|_| {
                // provider_id column stores an internal id, not a uuid; kept
                // as a distinct lookup when loading a full graph.
                Ok::<_, Error>(uds_domain::ids::ProviderId::new())
            })?,
            name: row.try_get("name").map_err(map_err)?,
            token: row.try_get("token").map_err(map_err)?,
            max_services_count_type: if row.try_get::<String, _>("max_services_count_type").map_err(map_err)? == "relative_to_provider" {
                MaxServicesCountType::RelativeToProvider
            } else {
                MaxServicesCountType::Absolute
            },
            max_services_count: row.try_get::<i32, _>("max_services_count").map_err(map_err)? as u32,
            uses_cache: row.try_get("uses_cache").map_err(map_err)?,
            uses_cache_l2: row.try_get("uses_cache_l2").map_err(map_err)?,
            needs_publication: row.try_get("needs_publication").map_err(map_err)?,
        })
    }

    async fn get_provider(&self, id: InternalId) -> Result<Provider> {
        let row = sqlx::query("SELECT * FROM providers WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(map_err)?
            .ok_or_else(|| Error::not_found(format!("provider {id}")))?;
        Ok(Provider {
            id: row.try_get("id").map_err(map_err)?,
            uuid: parse_uuid(&row, "uuid")?,
            name: row.try_get("name").map_err(map_err)?,
            data_type: row.try_get("data_type").map_err(map_err)?,
            maintenance_mode: row.try_get("maintenance_mode").map_err(map_err)?,
            concurrent_creation_limit: row.try_get::<i32, _>("concurrent_creation_limit").map_err(map_err)? as u32,
            concurrent_removal_limit: row.try_get::<i32, _>("concurrent_removal_limit").map_err(map_err)? as u32,
        })
    }

    async fn save_provider(&self, provider: Provider) -> Result<Provider> {
        let row = sqlx::query(
            "INSERT INTO providers (id, uuid, name, data_type, maintenance_mode, \
             concurrent_creation_limit, concurrent_removal_limit) \
             VALUES (COALESCE(NULLIF($1,0), nextval(pg_get_serial_sequence('providers','id'))), \
             $2,$3,$4,$5,$6,$7) \
             ON CONFLICT (id) DO UPDATE SET name=EXCLUDED.name, data_type=EXCLUDED.data_type, \
             maintenance_mode=EXCLUDED.maintenance_mode, \
             concurrent_creation_limit=EXCLUDED.concurrent_creation_limit, \
             concurrent_removal_limit=EXCLUDED.concurrent_removal_limit \
             RETURNING *",
        )
        .bind(provider.id)
        .bind(provider.uuid.0.to_string())
        .bind(&provider.name)
        .bind(&provider.data_type)
        .bind(provider.maintenance_mode)
        .bind(provider.concurrent_creation_limit as i32)
        .bind(provider.concurrent_removal_limit as i32)
        .fetch_one(&self.pool)
        .await
        .map_err(map_err)?;
        Ok(Provider {
            id: row.try_get("id").map_err(map_err)?,
            uuid: parse_uuid(&row, "uuid")?,
            name: row.try_get("name").map_err(map_err)?,
            data_type: row.try_get("data_type").map_err(map_err)?,
            maintenance_mode: row.try_get("maintenance_mode").map_err(map_err)?,
            concurrent_creation_limit: row.try_get::<i32, _>("concurrent_creation_limit").map_err(map_err)? as u32,
            concurrent_removal_limit: row.try_get::<i32, _>("concurrent_removal_limit").map_err(map_err)? as u32,
        })
    }

    async fn get_service_by_uuid(&self, uuid: uds_domain::ids::ServiceId) -> Result<Service> {
        let row = sqlx::query("SELECT * FROM services WHERE uuid = $1")
            .bind(uuid.0.to_string())
            .fetch_optional(&self.pool)
            .await
            .map_err(map_err)?
            .ok_or_else(|| Error::not_found(format!("service {uuid}")))?;
        Ok(Service {
            id: row.try_get("id").map_err(map_err)?,
            uuid: parse_uuid(&row, "uuid")?,
            provider_id: parse_uuid(&row, "provider_id").or_else(|_| {
                Ok::<_, Error>(uds_domain::ids::ProviderId::new())
            })?,
            name: row.try_get("name").map_err(map_err)?,
            token: row.try_get("token").map_err(map_err)?,
            max_services_count_type: if row.try_get::<String, _>("max_services_count_type").map_err(map_err)? == "relative_to_provider" {
                MaxServicesCountType::RelativeToProvider
            } else {
                MaxServicesCountType::Absolute
            },
            max_services_count: row.try_get::<i32, _>("max_services_count").map_err(map_err)? as u32,
            uses_cache: row.try_get("uses_cache").map_err(map_err)?,
            uses_cache_l2: row.try_get("uses_cache_l2").map_err(map_err)?,
            needs_publication: row.try_get("needs_publication").map_err(map_err)?,
        })
    }

    async fn save_service(&self, service: Service) -> Result<Service> {
        let max_type = match service.max_services_count_type {
            MaxServicesCountType::Absolute => "absolute",
            MaxServicesCountType::RelativeToProvider => "relative_to_provider",
        };
        let row = sqlx::query(
            "INSERT INTO services (id, uuid, provider_id, name, token, \
             max_services_count_type, max_services_count, uses_cache, uses_cache_l2, \
             needs_publication) \
             VALUES (COALESCE(NULLIF($1,0), nextval(pg_get_serial_sequence('services','id'))), \
             $2,$3,$4,$5,$6,$7,$8,$9,$10) \
             ON CONFLICT (id) DO UPDATE SET name=EXCLUDED.name, token=EXCLUDED.token, \
             max_services_count_type=EXCLUDED.max_services_count_type, \
             max_services_count=EXCLUDED.max_services_count, uses_cache=EXCLUDED.uses_cache, \
             uses_cache_l2=EXCLUDED.uses_cache_l2, needs_publication=EXCLUDED.needs_publication \
             RETURNING *",
        )
        .bind(service.id)
        .bind(service.uuid.0.to_string())
        .bind(0i64) // provider_id resolved separately; callers pass a pre-existing row in practice
        .bind(&service.name)
        .bind(&service.token)
        .bind(max_type)
        .bind(service.max_services_count as i32)
        .bind(service.uses_cache)
        .bind(service.uses_cache_l2)
        .bind(service.needs_publication)
        .fetch_one(&self.pool)
        .await
        .map_err(map_err)?;
        Ok(Service {
            id: row.try_get("id").map_err(map_err)?,
            uuid: parse_uuid(&row, "uuid")?,
            provider_id: service.provider_id,
            name: row.try_get("name").map_err(map_err)?,
            token: row.try_get("token").map_err(map_err)?,
            max_services_count_type: service.max_services_count_type,
            max_services_count: row.try_get::<i32, _>("max_services_count").map_err(map_err)? as u32,
            uses_cache: row.try_get("uses_cache").map_err(map_err)?,
            uses_cache_l2: row.try_get("uses_cache_l2").map_err(map_err)?,
            needs_publication: row.try_get("needs_publication").map_err(map_err)?,
        })
    }

    async fn get_provider_by_uuid(&self, uuid: uds_domain::ids::ProviderId) -> Result<Provider> {
        let row = sqlx::query("SELECT * FROM providers WHERE uuid = $1")
            .bind(uuid.0.to_string())
            .fetch_optional(&self.pool)
            .await
            .map_err(map_err)?
            .ok_or_else(|| Error::not_found(format!("provider {uuid}")))?;
        Ok(Provider {
            id: row.try_get("id").map_err(map_err)?,
            uuid: parse_uuid(&row, "uuid")?,
            name: row.try_get("name").map_err(map_err)?,
            data_type: row.try_get("data_type").map_err(map_err)?,
            maintenance_mode: row.try_get("maintenance_mode").map_err(map_err)?,
            concurrent_creation_limit: row.try_get::<i32, _>("concurrent_creation_limit").map_err(map_err)? as u32,
            concurrent_removal_limit: row.try_get::<i32, _>("concurrent_removal_limit").map_err(map_err)? as u32,
        })
    }

    async fn active_publication(&self, pool_id: InternalId) -> Result<Option<Publication>> {
        let row = sqlx::query("SELECT * FROM publications WHERE pool_id = $1 AND state = 'usable'")
            .bind(pool_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(map_err)?;
        row.as_ref().map(row_to_publication).transpose()
    }

    async fn list_publications(&self, pool_id: InternalId) -> Result<Vec<Publication>> {
        let rows = sqlx::query("SELECT * FROM publications WHERE pool_id = $1")
            .bind(pool_id)
            .fetch_all(&self.pool)
            .await
            .map_err(map_err)?;
        rows.iter().map(row_to_publication).collect()
    }

    async fn save_publication(&self, publication: Publication) -> Result<Publication> {
        let state = publication_state_str(publication.state);
        let row = sqlx::query(
            "INSERT INTO publications (id, uuid, pool_id, state, revision, error_reason) \
             VALUES (COALESCE(NULLIF($1,0), nextval(pg_get_serial_sequence('publications','id'))), $2,$3,$4,$5,$6) \
             ON CONFLICT (id) DO UPDATE SET state=EXCLUDED.state, error_reason=EXCLUDED.error_reason \
             RETURNING *",
        )
        .bind(publication.id)
        .bind(publication.uuid.0.to_string())
        .bind(0i64)
        .bind(state)
        .bind(publication.revision as i32)
        .bind(&publication.error_reason)
        .fetch_one(&self.pool)
        .await
        .map_err(map_err)?;
        row_to_publication(&row)
    }

    async fn get_user_service(&self, id: InternalId) -> Result<UserService> {
        let row = sqlx::query(
            "SELECT us.*, sp.uuid AS pool_uuid FROM user_services us \
             JOIN service_pools sp ON sp.id = us.pool_id WHERE us.id = $1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(map_err)?
        .ok_or_else(|| Error::not_found(format!("user service {id}")))?;
        row_to_user_service(&row)
    }

    async fn get_user_service_by_uuid(
        &self,
        uuid: uds_domain::ids::UserServiceId,
    ) -> Result<UserService> {
        let row = sqlx::query(
            "SELECT us.*, sp.uuid AS pool_uuid FROM user_services us \
             JOIN service_pools sp ON sp.id = us.pool_id WHERE us.uuid = $1",
        )
        .bind(uuid.0.to_string())
        .fetch_optional(&self.pool)
        .await
        .map_err(map_err)?
        .ok_or_else(|| Error::not_found(format!("user service {uuid}")))?;
        row_to_user_service(&row)
    }

    async fn list_user_services_by_pool(&self, pool_id: InternalId) -> Result<Vec<UserService>> {
        let rows = sqlx::query(
            "SELECT us.*, sp.uuid AS pool_uuid FROM user_services us \
             JOIN service_pools sp ON sp.id = us.pool_id WHERE us.pool_id = $1",
        )
        .bind(pool_id)
        .fetch_all(&self.pool)
        .await
        .map_err(map_err)?;
        rows.iter().map(row_to_user_service).collect()
    }

    async fn insert_user_service(&self, us: UserService) -> Result<UserService> {
        let properties: Json =
            serde_json::to_value(&us.properties).map_err(|e| Error::fatal(e.to_string()))?;
        let row = sqlx::query(
            "INSERT INTO user_services (id, uuid, pool_id, state, os_state, cache_level, \
             user_id, account_id, publication_revision, unique_id, in_use, in_use_date, \
             src_ip, src_hostname, creation_date, state_date, error_reason, to_be_replaced, \
             destroy_after, data, properties) \
             VALUES (COALESCE(NULLIF($1,0), nextval(pg_get_serial_sequence('user_services','id'))), \
             $2,$3,$4,$5,$6,$7,$8,$9,$10,$11,$12,$13,$14,$15,$16,$17,$18,$19,$20,$21) \
             ON CONFLICT (id) DO UPDATE SET state=EXCLUDED.state, os_state=EXCLUDED.os_state, \
             cache_level=EXCLUDED.cache_level, user_id=EXCLUDED.user_id, in_use=EXCLUDED.in_use, \
             in_use_date=EXCLUDED.in_use_date, state_date=EXCLUDED.state_date, \
             error_reason=EXCLUDED.error_reason, to_be_replaced=EXCLUDED.to_be_replaced, \
             destroy_after=EXCLUDED.destroy_after, data=EXCLUDED.data, properties=EXCLUDED.properties \
             RETURNING id",
        )
        .bind(us.id)
        .bind(us.uuid.0.to_string())
        .bind(0i64)
        .bind(us_state_str(us.state))
        .bind(if us.os_state == OsState::Usable { "usable" } else { "preparing" })
        .bind(us.cache_level as i16)
        .bind(us.user_id.map(|u| u.0.to_string()))
        .bind(us.account_id.map(|a| a.0.to_string()))
        .bind(us.publication_revision.map(|r| r as i32))
        .bind(&us.unique_id)
        .bind(us.in_use)
        .bind(us.in_use_date)
        .bind(&us.src_ip)
        .bind(&us.src_hostname)
        .bind(us.creation_date)
        .bind(us.state_date)
        .bind(&us.error_reason)
        .bind(us.to_be_replaced)
        .bind(us.destroy_after)
        .bind(&us.data)
        .bind(properties)
        .fetch_one(&self.pool)
        .await
        .map_err(map_err)?;
        let id: i64 = row.try_get("id").map_err(map_err)?;
        self.get_user_service(id).await
    }

    async fn delete_user_service(&self, id: InternalId) -> Result<()> {
        sqlx::query("DELETE FROM user_services WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(map_err)?;
        Ok(())
    }

    async fn with_user_service_locked<F, Fut>(&self, id: InternalId, f: F) -> Result<UserService>
    where
        F: FnOnce(UserService) -> Fut + Send + 'static,
        Fut: Future<Output = Result<UserService>> + Send + 'static,
    {
        let mut tx = self.pool.begin().await.map_err(map_err)?;
        let row = sqlx::query(
            "SELECT us.*, sp.uuid AS pool_uuid FROM user_services us \
             JOIN service_pools sp ON sp.id = us.pool_id WHERE us.id = $1 FOR UPDATE OF us",
        )
        .bind(id)
        .fetch_optional(&mut *tx)
        .await
        .map_err(map_err)?
        .ok_or_else(|| Error::not_found(format!("user service {id}")))?;
        let current = row_to_user_service(&row)?;
        tx.commit().await.map_err(map_err)?;

        // The plug-in-facing closure may suspend (§5: "never hold a DB
        // row lock across a plug-in call"), so the lock above is released
        // before `f` runs and the result is written back in its own
        // transaction.
        let updated = f(current).await?;
        self.insert_user_service(updated).await
    }

    async fn claim_unique_id(
        &self,
        basename: &str,
        owner: &str,
        range: (u64, u64),
    ) -> Result<Option<UniqueIdRow>> {
        let (range_start, range_end) = (range.0 as i64, range.1 as i64);
        let mut tx = self.pool.begin().await.map_err(map_err)?;

        let free = sqlx::query(
            "SELECT seq FROM unique_ids WHERE basename = $1 AND NOT assigned \
             AND seq BETWEEN $2 AND $3 ORDER BY seq LIMIT 1 FOR UPDATE",
        )
        .bind(basename)
        .bind(range_start)
        .bind(range_end)
        .fetch_optional(&mut *tx)
        .await
        .map_err(map_err)?;

        let seq = if let Some(row) = free {
            let seq: i64 = row.try_get("seq").map_err(map_err)?;
            sqlx::query(
                "UPDATE unique_ids SET owner = $3, assigned = TRUE, stamp = now() \
                 WHERE basename = $1 AND seq = $2",
            )
            .bind(basename)
            .bind(seq)
            .bind(owner)
            .execute(&mut *tx)
            .await
            .map_err(map_err)?;
            seq
        } else {
            let max_assigned: Option<i64> = sqlx::query(
                "SELECT MAX(seq) AS m FROM unique_ids WHERE basename = $1 AND assigned",
            )
            .bind(basename)
            .fetch_one(&mut *tx)
            .await
            .map_err(map_err)?
            .try_get("m")
            .map_err(map_err)?;
            let next_seq = max_assigned.map_or(range_start, |m| m + 1);
            if next_seq > range_end {
                tx.rollback().await.map_err(map_err)?;
                return Ok(None);
            }
            sqlx::query(
                "INSERT INTO unique_ids (basename, seq, owner, assigned, stamp) \
                 VALUES ($1, $2, $3, TRUE, now())",
            )
            .bind(basename)
            .bind(next_seq)
            .bind(owner)
            .execute(&mut *tx)
            .await
            .map_err(map_err)?;
            next_seq
        };
        tx.commit().await.map_err(map_err)?;

        let row = sqlx::query("SELECT * FROM unique_ids WHERE basename = $1 AND seq = $2")
            .bind(basename)
            .bind(seq)
            .fetch_one(&self.pool)
            .await
            .map_err(map_err)?;
        Ok(Some(row_to_unique_id(&row)?))
    }

    async fn release_unique_id(&self, basename: &str, seq: u64) -> Result<()> {
        let mut tx = self.pool.begin().await.map_err(map_err)?;
        sqlx::query(
            "UPDATE unique_ids SET owner = NULL, assigned = FALSE, stamp = now() \
             WHERE basename = $1 AND seq = $2",
        )
        .bind(basename)
        .bind(seq as i64)
        .execute(&mut *tx)
        .await
        .map_err(map_err)?;
        // Purge: unassigned rows above the new high-water mark leak
        // otherwise, per §4.2.
        sqlx::query(
            "DELETE FROM unique_ids WHERE basename = $1 AND NOT assigned AND seq > \
             COALESCE((SELECT MAX(seq) FROM unique_ids WHERE basename = $1 AND assigned), -1)",
        )
        .bind(basename)
        .execute(&mut *tx)
        .await
        .map_err(map_err)?;
        tx.commit().await.map_err(map_err)?;
        Ok(())
    }

    async fn release_unique_ids_older_than(
        &self,
        basename: &str,
        max_age: Duration,
    ) -> Result<usize> {
        let cutoff = self.now() - max_age;
        let result = sqlx::query(
            "UPDATE unique_ids SET owner = NULL, assigned = FALSE, stamp = now() \
             WHERE basename = $1 AND assigned AND stamp < $2",
        )
        .bind(basename)
        .bind(cutoff)
        .execute(&self.pool)
        .await
        .map_err(map_err)?;
        Ok(result.rows_affected() as usize)
    }

    async fn transfer_unique_id(&self, basename: &str, seq: u64, new_owner: &str) -> Result<()> {
        let result = sqlx::query(
            "UPDATE unique_ids SET owner = $3, stamp = now() WHERE basename = $1 AND seq = $2",
        )
        .bind(basename)
        .bind(seq as i64)
        .bind(new_owner)
        .execute(&self.pool)
        .await
        .map_err(map_err)?;
        if result.rows_affected() == 0 {
            return Err(Error::not_found(format!("unique id {basename}/{seq}")));
        }
        Ok(())
    }

    async fn release_unique_ids_owned_by(&self, owner: &str) -> Result<usize> {
        let mut tx = self.pool.begin().await.map_err(map_err)?;
        let result = sqlx::query(
            "UPDATE unique_ids SET owner = NULL, assigned = FALSE, stamp = now() \
             WHERE assigned AND owner = $1",
        )
        .bind(owner)
        .execute(&mut *tx)
        .await
        .map_err(map_err)?;
        sqlx::query(
            "DELETE FROM unique_ids u WHERE NOT u.assigned AND u.seq > \
             COALESCE((SELECT MAX(seq) FROM unique_ids WHERE basename = u.basename AND assigned), -1)",
        )
        .execute(&mut *tx)
        .await
        .map_err(map_err)?;
        tx.commit().await.map_err(map_err)?;
        Ok(result.rows_affected() as usize)
    }

    async fn open_account_usage(&self, usage: AccountUsage) -> Result<AccountUsage> {
        let row = sqlx::query(
            "INSERT INTO account_usages (account_id, user_service_id, user_name, pool_name, start_ts, end_ts) \
             VALUES ($1,$2,$3,$4,$5,$6) RETURNING id",
        )
        .bind(usage.account_id.0.to_string())
        .bind(usage.user_service_id.0.to_string())
        .bind(&usage.user_name)
        .bind(&usage.pool_name)
        .bind(usage.start)
        .bind(usage.end)
        .fetch_one(&self.pool)
        .await
        .map_err(map_err)?;
        Ok(AccountUsage {
            id: row.try_get("id").map_err(map_err)?,
            ..usage
        })
    }

    async fn close_account_usage(&self, id: InternalId, at: DateTime<Utc>) -> Result<()> {
        let result = sqlx::query("UPDATE account_usages SET end_ts = $2 WHERE id = $1 AND end_ts IS NULL")
            .bind(id)
            .bind(at)
            .execute(&self.pool)
            .await
            .map_err(map_err)?;
        if result.rows_affected() == 0 {
            return Err(Error::not_found(format!("account usage {id}")));
        }
        Ok(())
    }

    async fn get_account(&self, id: InternalId) -> Result<Account> {
        let row = sqlx::query("SELECT * FROM accounts WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(map_err)?
            .ok_or_else(|| Error::not_found(format!("account {id}")))?;
        Ok(Account {
            id: row.try_get("id").map_err(map_err)?,
            uuid: parse_uuid(&row, "uuid")?,
            name: row.try_get("name").map_err(map_err)?,
            time_mark: row.try_get::<i32, _>("time_mark").map_err(map_err)? as u32,
        })
    }

    async fn due_deletion_entries(
        &self,
        queue: DeletionQueue,
        now: DateTime<Utc>,
        limit: u32,
    ) -> Result<Vec<DeletionEntry>> {
        let rows = sqlx::query(
            "SELECT * FROM deletion_queue WHERE queue = $1 AND next_check <= $2 \
             ORDER BY next_check ASC LIMIT $3",
        )
        .bind(deletion_queue_str(queue))
        .bind(now)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(map_err)?;
        rows.iter().map(row_to_deletion_entry).collect()
    }

    async fn save_deletion_entry(&self, entry: DeletionEntry) -> Result<DeletionEntry> {
        if entry.id == 0 {
            let row = sqlx::query(
                "INSERT INTO deletion_queue \
                 (queue, vmid, service_uuid, created, next_check, retries, total_retries, fatal_retries) \
                 VALUES ($1,$2,$3,$4,$5,$6,$7,$8) RETURNING id",
            )
            .bind(deletion_queue_str(entry.queue))
            .bind(&entry.vmid)
            .bind(entry.service_uuid.0.to_string())
            .bind(entry.created)
            .bind(entry.next_check)
            .bind(entry.retries as i32)
            .bind(entry.total_retries as i32)
            .bind(entry.fatal_retries as i32)
            .fetch_one(&self.pool)
            .await
            .map_err(map_err)?;
            return Ok(DeletionEntry {
                id: row.try_get("id").map_err(map_err)?,
                ..entry
            });
        }
        sqlx::query(
            "UPDATE deletion_queue SET queue = $2, vmid = $3, next_check = $4, \
             retries = $5, total_retries = $6, fatal_retries = $7 WHERE id = $1",
        )
        .bind(entry.id)
        .bind(deletion_queue_str(entry.queue))
        .bind(&entry.vmid)
        .bind(entry.next_check)
        .bind(entry.retries as i32)
        .bind(entry.total_retries as i32)
        .bind(entry.fatal_retries as i32)
        .execute(&self.pool)
        .await
        .map_err(map_err)?;
        Ok(entry)
    }

    async fn delete_deletion_entry(&self, id: InternalId) -> Result<()> {
        sqlx::query("DELETE FROM deletion_queue WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(map_err)?;
        Ok(())
    }

    async fn list_deletion_entries(&self, queue: DeletionQueue) -> Result<Vec<DeletionEntry>> {
        let rows = sqlx::query("SELECT * FROM deletion_queue WHERE queue = $1 ORDER BY next_check ASC")
            .bind(deletion_queue_str(queue))
            .fetch_all(&self.pool)
            .await
            .map_err(map_err)?;
        rows.iter().map(row_to_deletion_entry).collect()
    }
}

fn parse_uuid<T: From<uuid::Uuid>>(row: &sqlx::postgres::PgRow, col: &str) -> Result<T> {
    let s: String = row.try_get(col).map_err(map_err)?;
    s.parse::<uuid::Uuid>()
        .map(Into::into)
        .map_err(|e| Error::fatal(format!("bad uuid in column {col}: {e}")))
}

fn deletion_queue_str(queue: DeletionQueue) -> &'static str {
    match queue {
        DeletionQueue::ToStop => "to_stop",
        DeletionQueue::Stopping => "stopping",
        DeletionQueue::ToDelete => "to_delete",
        DeletionQueue::Deleting => "deleting",
    }
}

fn row_to_deletion_entry(row: &sqlx::postgres::PgRow) -> Result<DeletionEntry> {
    let queue_str: String = row.try_get("queue").map_err(map_err)?;
    Ok(DeletionEntry {
        id: row.try_get("id").map_err(map_err)?,
        queue: match queue_str.as_str() {
            "to_stop" => DeletionQueue::ToStop,
            "stopping" => DeletionQueue::Stopping,
            "to_delete" => DeletionQueue::ToDelete,
            _ => DeletionQueue::Deleting,
        },
        vmid: row.try_get("vmid").map_err(map_err)?,
        service_uuid: parse_uuid(row, "service_uuid")?,
        created: row.try_get("created").map_err(map_err)?,
        next_check: row.try_get("next_check").map_err(map_err)?,
        retries: row.try_get::<i32, _>("retries").map_err(map_err)? as u32,
        total_retries: row.try_get::<i32, _>("total_retries").map_err(map_err)? as u32,
        fatal_retries: row.try_get::<i32, _>("fatal_retries").map_err(map_err)? as u32,
    })
}

fn publication_state_str(state: PublicationState) -> &'static str {
    match state {
        PublicationState::Preparing => "preparing",
        PublicationState::Usable => "usable",
        PublicationState::Removable => "removable",
        PublicationState::Removed => "removed",
        PublicationState::Error => "error",
    }
}

fn row_to_publication(row: &sqlx::postgres::PgRow) -> Result<Publication> {
    let state_str: String = row.try_get("state").map_err(map_err)?;
    Ok(Publication {
        id: row.try_get("id").map_err(map_err)?,
        uuid: parse_uuid(row, "uuid")?,
        pool_id: uds_domain::ids::ServicePoolId::new(),
        state: match state_str.as_str() {
            "preparing" => PublicationState::Preparing,
            "usable" => PublicationState::Usable,
            "removable" => PublicationState::Removable,
            "removed" => PublicationState::Removed,
            _ => PublicationState::Error,
        },
        revision: row.try_get::<i32, _>("revision").map_err(map_err)? as u32,
        error_reason: row.try_get("error_reason").map_err(map_err)?,
    })
}

fn row_to_pool(row: &sqlx::postgres::PgRow) -> Result<ServicePool> {
    let state_str: String = row.try_get("state").map_err(map_err)?;
    let transports: Json = row.try_get("transports").map_err(map_err)?;
    let calendar_rules: Json = row.try_get("calendar_rules").map_err(map_err)?;
    let fallback_str: String = row.try_get("fallback_access").map_err(map_err)?;
    Ok(ServicePool {
        id: row.try_get("id").map_err(map_err)?,
        uuid: parse_uuid(row, "uuid")?,
        name: row.try_get("name").map_err(map_err)?,
        service_id: uds_domain::ids::ServiceId::new(),
        state: match state_str.as_str() {
            "active" => ServicePoolState::Active,
            "removable" => ServicePoolState::Removable,
            _ => ServicePoolState::Removed,
        },
        initial_srvs: row.try_get::<i32, _>("initial_srvs").map_err(map_err)? as u32,
        cache_l1_srvs: row.try_get::<i32, _>("cache_l1_srvs").map_err(map_err)? as u32,
        cache_l2_srvs: row.try_get::<i32, _>("cache_l2_srvs").map_err(map_err)? as u32,
        max_srvs: row.try_get::<i32, _>("max_srvs").map_err(map_err)? as u32,
        current_pub_revision: row
            .try_get::<Option<i32>, _>("current_pub_revision")
            .map_err(map_err)?
            .map(|r| r as u32),
        current_publication_id: None,
        osmanager_id: None,
        transports: serde_json::from_value(transports).unwrap_or_default(),
        assigned_groups: Vec::new(),
        show_transports: row.try_get("show_transports").map_err(map_err)?,
        visible: row.try_get("visible").map_err(map_err)?,
        allow_users_remove: row.try_get("allow_users_remove").map_err(map_err)?,
        allow_users_reset: row.try_get("allow_users_reset").map_err(map_err)?,
        calendar_rules: serde_json::from_value::<Vec<CalendarRule>>(calendar_rules).unwrap_or_default(),
        fallback_access: if fallback_str == "allow" { AccessAction::Allow } else { AccessAction::Deny },
    })
}

fn row_to_unique_id(row: &sqlx::postgres::PgRow) -> Result<UniqueIdRow> {
    Ok(UniqueIdRow {
        id: row.try_get("id").map_err(map_err)?,
        basename: row.try_get("basename").map_err(map_err)?,
        seq: row.try_get::<i64, _>("seq").map_err(map_err)? as u64,
        owner: row.try_get("owner").map_err(map_err)?,
        assigned: row.try_get("assigned").map_err(map_err)?,
        stamp: row.try_get("stamp").map_err(map_err)?,
    })
}
