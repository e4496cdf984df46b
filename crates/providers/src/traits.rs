//! Provider and OS-manager plug-in ports (§6).
//!
//! The core never talks to a hypervisor or in-guest agent directly — it
//! only ever calls through these two traits. Every method that may take
//! real wall-clock time to complete (deploy, check, cancel, destroy)
//! returns a [`TaskState`] rather than blocking until done: the FSM polls
//! `check_state` again next tick instead of waiting inline, so a Store
//! row lock is never held across the call (§5).

use async_trait::async_trait;
use serde_json::Value;

use uds_domain::entities::{CacheLevel, UserService};
use uds_domain::{Result, TaskState};

/// Outcome of [`ProviderPlugin::test_connection`].
#[derive(Debug, Clone)]
pub struct ConnectionCheck {
    pub ok: bool,
    pub error: Option<String>,
}

/// Per-service operations a compute backend adapter implements. One
/// instance is constructed per configured [`Provider`](uds_domain::entities::Provider)
/// via [`crate::registry::ProviderRegistry`].
#[async_trait]
pub trait ProviderPlugin: Send + Sync {
    /// The `data_type` string this instance was registered under.
    fn data_type(&self) -> &str;

    /// Whether the backend can currently be reached at all. Does not
    /// reflect `maintenance_mode`, which is a Store-level flag the cache
    /// updater reads directly.
    async fn is_available(&self) -> Result<bool>;

    /// Exercises the backend's credentials/network path without
    /// provisioning anything. Used by admin "test connection" actions.
    async fn test_connection(&self) -> Result<ConnectionCheck>;

    /// Lists backend-native resources (templates, networks, datastores,
    /// ...); shape is provider-specific and opaque to the core.
    async fn list_resources(&self) -> Result<Vec<String>>;

    /// Begins provisioning `us` for immediate assignment to its user.
    async fn deploy_for_user(&self, us: &UserService) -> Result<TaskState>;

    /// Begins provisioning `us` to sit in the given cache level until
    /// assigned or promoted.
    async fn deploy_for_cache(&self, us: &UserService, level: CacheLevel) -> Result<TaskState>;

    /// Polls an in-flight operation (deploy, cancel, or destroy) for
    /// completion. Called by the scheduler's "check state" pass.
    async fn check_state(&self, us: &UserService) -> Result<TaskState>;

    /// Requests that an in-flight deploy be aborted.
    async fn cancel(&self, us: &UserService) -> Result<TaskState>;

    /// Requests permanent destruction of the backing resource.
    async fn destroy(&self, us: &UserService) -> Result<TaskState>;

    /// Whether the backing resource must be powered off before
    /// [`destroy`](Self::destroy) can be requested. Read by the
    /// deferred-deletion worker to decide whether an entry starts in
    /// `TO_STOP` or `TO_DELETE`.
    fn must_stop_before_deletion(&self) -> bool {
        false
    }

    /// Whether the backing resource is currently powered on. Only called
    /// for services where [`must_stop_before_deletion`](Self::must_stop_before_deletion) is true.
    async fn is_running(&self, us: &UserService) -> Result<bool>;

    /// Requests that the backing resource be powered off (not destroyed).
    async fn stop(&self, us: &UserService) -> Result<TaskState>;

    /// Signals the backend that the instance is about to be handed to a
    /// user or promoted, giving adapters that need a final readiness
    /// check a hook before the FSM moves on.
    async fn set_ready(&self, us: &UserService) -> Result<TaskState>;

    async fn user_logged_in(&self, us: &UserService, username: &str) -> Result<()>;
    async fn user_logged_out(&self, us: &UserService, username: &str) -> Result<()>;

    /// Human-readable reason the last `check_state`/`deploy_*` call
    /// returned `TaskState::Error`, if the adapter retains one beyond
    /// what it already put in the returned `TaskState`.
    fn error_reason(&self, us: &UserService) -> Option<String>;

    async fn get_ip(&self, us: &UserService) -> Result<Option<String>>;
    async fn get_unique_id(&self, us: &UserService) -> Result<Option<String>>;
    fn get_name(&self, us: &UserService) -> String;
}

/// What the actor (in-guest agent) should do next, as computed by the OS
/// manager from the UserService's current state.
#[derive(Debug, Clone)]
pub struct ActorData {
    pub action: String,
    pub name: Option<String>,
    pub custom: Value,
}

/// In-guest agent contract: rename/domain-join/password-change and
/// readiness signaling, independent of the provider that deployed the
/// instance.
#[async_trait]
pub trait OsManagerPlugin: Send + Sync {
    fn data_type(&self) -> &str;

    /// What the actor should do the next time it calls in, given the
    /// UserService's current state.
    async fn actor_data(&self, us: &UserService) -> Result<ActorData>;

    /// Polls the OS-manager-tracked readiness of `us` independently of
    /// the provider's own `check_state`.
    async fn check_state(&self, us: &UserService) -> Result<TaskState>;

    /// Whether instances managed by this OS manager survive a user
    /// logout (persistent desktops) rather than being torn down.
    fn is_persistent(&self) -> bool;

    /// Whether this OS manager wants a callback when an assigned
    /// instance goes unused past the policy's idle timeout.
    fn manages_unused_userservices(&self) -> bool;

    /// Invoked when [`manages_unused_userservices`] is true and `us` has
    /// been idle past the configured timeout.
    async fn handle_unused(&self, us: &UserService) -> Result<()>;

    /// Whether the FSM should move `us` straight to `Removable` on
    /// logout rather than waiting for this OS manager to decide.
    fn is_removable_on_logout(&self) -> bool;

    /// Rewrites the in-guest account's credentials, returning the
    /// (possibly adapter-generated) username/password actually applied.
    async fn update_credentials(
        &self,
        us: &UserService,
        user: &str,
        pass: &str,
    ) -> Result<(String, String)>;

    async fn process_ready(&self, us: &UserService) -> Result<()>;
    async fn logged_in(&self, us: &UserService, username: &str) -> Result<()>;
    async fn logged_out(&self, us: &UserService, username: &str) -> Result<()>;
}
