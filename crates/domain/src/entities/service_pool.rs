use serde::{Deserialize, Serialize};

use crate::ids::{GroupId, InternalId, PublicationId, ServiceId, ServicePoolId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServicePoolState {
    Active,
    Removable,
    Removed,
}

/// A named, policy-bearing pool that publishes a [`Service`](super::service::Service)
/// to a set of groups (also known as a `DeployedService`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServicePool {
    pub id: InternalId,
    pub uuid: ServicePoolId,
    pub name: String,
    pub service_id: ServiceId,
    pub state: ServicePoolState,

    pub initial_srvs: u32,
    pub cache_l1_srvs: u32,
    pub cache_l2_srvs: u32,
    pub max_srvs: u32,

    /// Revision number of the currently-active publication, if any.
    pub current_pub_revision: Option<u32>,
    pub current_publication_id: Option<PublicationId>,

    pub osmanager_id: Option<InternalId>,
    pub transports: Vec<String>,
    pub assigned_groups: Vec<GroupId>,

    pub show_transports: bool,
    pub visible: bool,
    pub allow_users_remove: bool,
    pub allow_users_reset: bool,

    /// Per-pool calendar access rules, evaluated in priority order by the
    /// service manager façade.
    pub calendar_rules: Vec<CalendarRule>,
    pub fallback_access: AccessAction,
}

impl ServicePool {
    /// Invariants: non-negative cache sizes, and
    /// `initial_srvs <= max_srvs` whenever a max is actually configured.
    pub fn validate(&self) -> Result<(), String> {
        if self.max_srvs > 0 && self.initial_srvs > self.max_srvs {
            return Err(format!(
                "pool {}: initial_srvs ({}) must not exceed max_srvs ({})",
                self.name, self.initial_srvs, self.max_srvs
            ));
        }
        Ok(())
    }

    pub fn is_active(&self) -> bool {
        self.state == ServicePoolState::Active
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccessAction {
    Allow,
    Deny,
}

/// One calendar-based access rule. Rules are evaluated in ascending
/// `priority` order; the first rule whose calendar contains `now` decides
/// the outcome.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CalendarRule {
    pub priority: i32,
    pub calendar_name: String,
    pub action: AccessAction,
    /// Intervals (inclusive start, exclusive end) the rule's calendar is
    /// considered "within", expressed as seconds-of-week for simplicity.
    pub intervals: Vec<(u32, u32)>,
}

impl CalendarRule {
    pub fn contains(&self, seconds_of_week: u32) -> bool {
        self.intervals
            .iter()
            .any(|(start, end)| seconds_of_week >= *start && seconds_of_week < *end)
    }
}
