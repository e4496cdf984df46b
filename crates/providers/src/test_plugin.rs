//! `"test"` plug-in adapters: deterministic, in-memory stand-ins for a
//! real hypervisor/agent backend. Registered under the `data_type` the
//! same way a real `ovirt`/`openstack`/`xen` adapter would be, so the
//! cache updater, FSM, and deferred-deletion worker exercise exactly the
//! same code path they would against a live provider.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{json, Value};

use uds_domain::entities::{CacheLevel, UserService};
use uds_domain::ids::InternalId;
use uds_domain::{Result, TaskState};

use crate::traits::{ActorData, ConnectionCheck, OsManagerPlugin, ProviderPlugin};

/// A provider backend that "deploys" and "destroys" instantly, or after
/// a configurable number of `check_state` polls, without touching
/// anything outside the process.
pub struct TestProvider {
    /// How many `check_state` polls an in-flight operation stays
    /// `Running` before reporting `Finished`. `0` finishes immediately.
    provisioning_ticks: u32,
    maintenance: AtomicBool,
    ticks_seen: Mutex<HashMap<InternalId, u32>>,
    must_stop_before_deletion: bool,
    running: Mutex<HashMap<InternalId, bool>>,
}

impl TestProvider {
    pub fn new() -> Self {
        Self::with_provisioning_ticks(0)
    }

    pub fn with_provisioning_ticks(provisioning_ticks: u32) -> Self {
        Self {
            provisioning_ticks,
            maintenance: AtomicBool::new(false),
            ticks_seen: Mutex::new(HashMap::new()),
            must_stop_before_deletion: false,
            running: Mutex::new(HashMap::new()),
        }
    }

    /// A provider whose backing resource must be powered off before it
    /// can be destroyed, starting out running, used to exercise the
    /// deferred-deletion worker's `TO_STOP` -> `STOPPING` path.
    pub fn with_stop_before_deletion() -> Self {
        Self {
            must_stop_before_deletion: true,
            ..Self::with_provisioning_ticks(0)
        }
    }

    pub fn set_maintenance(&self, on: bool) {
        self.maintenance.store(on, Ordering::SeqCst);
    }

    pub fn mark_running(&self, id: InternalId, running: bool) {
        self.running.lock().insert(id, running);
    }

    fn advance(&self, id: InternalId) -> TaskState {
        let mut ticks = self.ticks_seen.lock();
        let counter = ticks.entry(id).or_insert(0);
        *counter += 1;
        if *counter > self.provisioning_ticks {
            TaskState::Finished
        } else {
            TaskState::Running
        }
    }
}

impl Default for TestProvider {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ProviderPlugin for TestProvider {
    fn data_type(&self) -> &str {
        "test"
    }

    async fn is_available(&self) -> Result<bool> {
        Ok(!self.maintenance.load(Ordering::SeqCst))
    }

    async fn test_connection(&self) -> Result<ConnectionCheck> {
        Ok(ConnectionCheck {
            ok: !self.maintenance.load(Ordering::SeqCst),
            error: None,
        })
    }

    async fn list_resources(&self) -> Result<Vec<String>> {
        Ok(vec!["test-template".into()])
    }

    async fn deploy_for_user(&self, us: &UserService) -> Result<TaskState> {
        Ok(self.advance(us.id))
    }

    async fn deploy_for_cache(&self, us: &UserService, _level: CacheLevel) -> Result<TaskState> {
        Ok(self.advance(us.id))
    }

    async fn check_state(&self, us: &UserService) -> Result<TaskState> {
        Ok(self.advance(us.id))
    }

    async fn cancel(&self, us: &UserService) -> Result<TaskState> {
        self.ticks_seen.lock().remove(&us.id);
        Ok(TaskState::Finished)
    }

    async fn destroy(&self, us: &UserService) -> Result<TaskState> {
        self.ticks_seen.lock().remove(&us.id);
        Ok(TaskState::Finished)
    }

    fn must_stop_before_deletion(&self) -> bool {
        self.must_stop_before_deletion
    }

    async fn is_running(&self, us: &UserService) -> Result<bool> {
        Ok(*self.running.lock().get(&us.id).unwrap_or(&true))
    }

    async fn stop(&self, us: &UserService) -> Result<TaskState> {
        self.running.lock().insert(us.id, false);
        Ok(TaskState::Finished)
    }

    async fn set_ready(&self, _us: &UserService) -> Result<TaskState> {
        Ok(TaskState::Finished)
    }

    async fn user_logged_in(&self, _us: &UserService, _username: &str) -> Result<()> {
        Ok(())
    }

    async fn user_logged_out(&self, _us: &UserService, _username: &str) -> Result<()> {
        Ok(())
    }

    fn error_reason(&self, _us: &UserService) -> Option<String> {
        None
    }

    async fn get_ip(&self, _us: &UserService) -> Result<Option<String>> {
        Ok(Some("10.0.0.1".into()))
    }

    async fn get_unique_id(&self, us: &UserService) -> Result<Option<String>> {
        Ok(us.unique_id.clone())
    }

    fn get_name(&self, us: &UserService) -> String {
        format!("test-{}", us.uuid)
    }
}

/// An OS manager that never rewrites credentials and reports ready
/// immediately, used by pools that do not exercise the in-guest agent
/// contract at all.
pub struct TestOsManager {
    persistent: bool,
}

impl TestOsManager {
    pub fn new() -> Self {
        Self { persistent: false }
    }

    pub fn persistent() -> Self {
        Self { persistent: true }
    }
}

impl Default for TestOsManager {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl OsManagerPlugin for TestOsManager {
    fn data_type(&self) -> &str {
        "test"
    }

    async fn actor_data(&self, _us: &UserService) -> Result<ActorData> {
        Ok(ActorData {
            action: "noop".into(),
            name: None,
            custom: json!({}),
        })
    }

    async fn check_state(&self, _us: &UserService) -> Result<TaskState> {
        Ok(TaskState::Finished)
    }

    fn is_persistent(&self) -> bool {
        self.persistent
    }

    fn manages_unused_userservices(&self) -> bool {
        false
    }

    async fn handle_unused(&self, _us: &UserService) -> Result<()> {
        Ok(())
    }

    fn is_removable_on_logout(&self) -> bool {
        !self.persistent
    }

    async fn update_credentials(
        &self,
        _us: &UserService,
        user: &str,
        pass: &str,
    ) -> Result<(String, String)> {
        Ok((user.to_string(), pass.to_string()))
    }

    async fn process_ready(&self, _us: &UserService) -> Result<()> {
        Ok(())
    }

    async fn logged_in(&self, _us: &UserService, _username: &str) -> Result<()> {
        Ok(())
    }

    async fn logged_out(&self, _us: &UserService, _username: &str) -> Result<()> {
        Ok(())
    }
}
