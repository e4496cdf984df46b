use serde::{Deserialize, Serialize};

use crate::ids::{InternalId, ProviderId};

/// An administrative binding to an external compute backend.
///
/// The core never talks to the backend directly — it only reads
/// `maintenance_mode` and the concurrency limits below, and invokes the
/// provider plug-in port (`uds-providers`) for everything else.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Provider {
    pub id: InternalId,
    pub uuid: ProviderId,
    pub name: String,
    /// The plug-in type this provider was configured with (e.g. "test",
    /// "ovirt", "openstack"). Used by the registry to resolve a factory.
    pub data_type: String,
    /// When true, all services of this provider are unavailable for
    /// growth: the cache updater skips every pool backed by it.
    pub maintenance_mode: bool,
    /// Maximum create operations in flight at once for this provider.
    pub concurrent_creation_limit: u32,
    /// Maximum destroy operations in flight at once for this provider.
    pub concurrent_removal_limit: u32,
}

impl Provider {
    pub fn can_grow(&self) -> bool {
        !self.maintenance_mode
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn provider(maintenance: bool) -> Provider {
        Provider {
            id: 1,
            uuid: ProviderId::new(),
            name: "p1".into(),
            data_type: "test".into(),
            maintenance_mode: maintenance,
            concurrent_creation_limit: 5,
            concurrent_removal_limit: 5,
        }
    }

    #[test]
    fn maintenance_mode_blocks_growth() {
        assert!(!provider(true).can_grow());
        assert!(provider(false).can_grow());
    }
}
