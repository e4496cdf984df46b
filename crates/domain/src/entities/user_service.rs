use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ids::{
    AccountId, InternalId, PublicationId, ServicePoolId, UserId, UserServiceId,
};

/// Engine-level state of a UserService.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UserServiceState {
    Preparing,
    Usable,
    Removable,
    Removed,
    Canceling,
    Error,
}

/// OS-manager-reported readiness state, tracked independently of the
/// engine-level state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OsState {
    Preparing,
    Usable,
}

/// Cache level a UserService currently occupies. `Assigned` (0) means the
/// service belongs to a user; invariant `cache_level == Assigned iff user
/// is Some`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum CacheLevel {
    Assigned = 0,
    L1 = 1,
    L2 = 2,
}

/// The unit of allocation: a single VM, container, or fixed
/// machine slot handed out to a user.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserService {
    pub id: InternalId,
    pub uuid: UserServiceId,
    pub pool_id: ServicePoolId,

    pub state: UserServiceState,
    pub os_state: OsState,
    pub cache_level: CacheLevel,

    pub user_id: Option<UserId>,
    pub account_id: Option<AccountId>,

    /// The publication revision this instance was deployed from. Preserved
    /// even after the publication row itself is deleted.
    pub publication_id: Option<PublicationId>,
    pub publication_revision: Option<u32>,

    pub unique_id: Option<String>,
    pub in_use: bool,
    pub in_use_date: Option<DateTime<Utc>>,

    pub src_ip: Option<String>,
    pub src_hostname: Option<String>,

    pub creation_date: DateTime<Utc>,
    pub state_date: DateTime<Utc>,

    pub error_reason: Option<String>,

    /// Marked when a newer publication makes this instance stale while it
    /// is still serving a live session; the instance keeps running but
    /// will not survive the next logout.
    pub to_be_replaced: bool,

    /// Set on L1 cache items the cache updater has already decided to
    /// destroy, so a concurrent reduction pass does not pick it again
    /// (mirrors the upstream broker's `destroy_after` marker).
    pub destroy_after: bool,

    /// Opaque, plug-in-owned serialized payload.
    /// See [`crate::plugin_data`] for the on-disk envelope.
    #[serde(with = "serde_bytes_or_empty")]
    pub data: Vec<u8>,

    /// Per-UserService keyed property store: `ip`, `comms_url`,
    /// `logins_counter`, `usageAccountStart`, etc.
    pub properties: HashMap<String, String>,
}

mod serde_bytes_or_empty {
    use serde::{Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &Vec<u8>, s: S) -> Result<S::Ok, S::Error> {
        serde_bytes_compat(bytes, s)
    }

    fn serde_bytes_compat<S: Serializer>(bytes: &[u8], s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&hex_encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<u8>, D::Error> {
        use serde::de::Error;
        let s = String::deserialize(d)?;
        hex_decode(&s).map_err(D::Error::custom)
    }

    fn hex_encode(bytes: &[u8]) -> String {
        bytes.iter().map(|b| format!("{:02x}", b)).collect()
    }

    fn hex_decode(s: &str) -> Result<Vec<u8>, String> {
        if s.len() % 2 != 0 {
            return Err("odd-length hex string".into());
        }
        (0..s.len())
            .step_by(2)
            .map(|i| u8::from_str_radix(&s[i..i + 2], 16).map_err(|e| e.to_string()))
            .collect()
    }

    use serde::Deserialize;
}

impl UserService {
    /// `cache_level == Assigned <=> user_id.is_some()`.
    pub fn invariant_holds(&self) -> bool {
        matches!(self.cache_level, CacheLevel::Assigned) == self.user_id.is_some()
    }

    pub fn is_cached(&self) -> bool {
        !matches!(self.cache_level, CacheLevel::Assigned)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self.state, UserServiceState::Removed)
    }

    /// Property bag read with a default.
    pub fn get_property(&self, key: &str) -> Option<&str> {
        self.properties.get(key).map(|s| s.as_str())
    }

    pub fn set_property(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.properties.insert(key.into(), value.into());
    }

    /// Compare-and-set increment used for counters like `logins_counter`
    /// Used for counters that must survive concurrent readers, e.g. login counts.
    pub fn increment_counter(&mut self, key: &str) -> u64 {
        let entry = self.properties.entry(key.to_string()).or_insert_with(|| "0".to_string());
        let n: u64 = entry.parse().unwrap_or(0) + 1;
        *entry = n.to_string();
        n
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ids::ServicePoolId;

    fn base() -> UserService {
        UserService {
            id: 1,
            uuid: UserServiceId::new(),
            pool_id: ServicePoolId::new(),
            state: UserServiceState::Preparing,
            os_state: OsState::Preparing,
            cache_level: CacheLevel::L1,
            user_id: None,
            account_id: None,
            publication_id: None,
            publication_revision: None,
            unique_id: None,
            in_use: false,
            in_use_date: None,
            src_ip: None,
            src_hostname: None,
            creation_date: Utc::now(),
            state_date: Utc::now(),
            error_reason: None,
            to_be_replaced: false,
            destroy_after: false,
            data: vec![],
            properties: HashMap::new(),
        }
    }

    #[test]
    fn assigned_invariant_holds_when_both_or_neither_set() {
        let mut us = base();
        assert!(us.invariant_holds()); // L1, no user: fine

        us.cache_level = CacheLevel::Assigned;
        assert!(!us.invariant_holds()); // assigned but no user: violated

        us.user_id = Some(crate::ids::UserId::new());
        assert!(us.invariant_holds());
    }

    #[test]
    fn counter_increments_from_missing_key() {
        let mut us = base();
        assert_eq!(us.increment_counter("logins_counter"), 1);
        assert_eq!(us.increment_counter("logins_counter"), 2);
    }

    #[test]
    fn data_payload_round_trips_through_serde() {
        let mut us = base();
        us.data = vec![0xDE, 0xAD, 0xBE, 0xEF];
        let json = serde_json::to_string(&us).unwrap();
        let back: UserService = serde_json::from_str(&json).unwrap();
        assert_eq!(back.data, vec![0xDE, 0xAD, 0xBE, 0xEF]);
    }
}
