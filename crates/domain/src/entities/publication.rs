use serde::{Deserialize, Serialize};

use crate::ids::{InternalId, PublicationId, ServicePoolId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PublicationState {
    Preparing,
    Usable,
    Removable,
    Removed,
    Error,
}

/// A revision of a pool's template. At most one `Usable`
/// publication per pool at a time — the *active* publication.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Publication {
    pub id: InternalId,
    pub uuid: PublicationId,
    pub pool_id: ServicePoolId,
    pub state: PublicationState,
    pub revision: u32,
    pub error_reason: Option<String>,
}

impl Publication {
    pub fn is_usable(&self) -> bool {
        self.state == PublicationState::Usable
    }

    pub fn is_preparing(&self) -> bool {
        self.state == PublicationState::Preparing
    }
}
