use serde::{Deserialize, Serialize};

use crate::ids::{InternalId, ProviderId, ServiceId};

/// Whether `max_services_count` is an absolute number or a fraction of the
/// provider's own capacity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MaxServicesCountType {
    Absolute,
    RelativeToProvider,
}

/// A published offering from a [`Provider`](super::provider::Provider).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Service {
    pub id: InternalId,
    pub uuid: ServiceId,
    pub provider_id: ProviderId,
    pub name: String,
    /// Unique across all services when present.
    pub token: Option<String>,
    pub max_services_count_type: MaxServicesCountType,
    pub max_services_count: u32,
    /// Whether this service type uses an L1/L2 cache at all. Pools backed
    /// by a service with `uses_cache = false` are skipped entirely by the
    /// cache updater.
    pub uses_cache: bool,
    pub uses_cache_l2: bool,
    /// Whether pools backed by this service require an active publication
    /// before any UserService can leave PREPARING.
    pub needs_publication: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn relative_capacity_variant_round_trips() {
        let json = serde_json::to_string(&MaxServicesCountType::RelativeToProvider).unwrap();
        let back: MaxServicesCountType = serde_json::from_str(&json).unwrap();
        assert_eq!(back, MaxServicesCountType::RelativeToProvider);
    }
}
