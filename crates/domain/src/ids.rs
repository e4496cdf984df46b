//! Opaque, strongly-typed identifiers.
//!
//! Every entity has a stable opaque UUID plus an auto-incrementing
//! internal id used for `ORDER BY`/row-lock purposes. We model both: the
//! UUID is what crosses crate/process boundaries, the internal id is what
//! the Store uses for efficient row locking.

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

macro_rules! uuid_id {
    ($name:ident) => {
        #[derive(
            Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
        )]
        pub struct $name(pub Uuid);

        impl $name {
            pub fn new() -> Self {
                Self(Uuid::new_v4())
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<Uuid> for $name {
            fn from(u: Uuid) -> Self {
                Self(u)
            }
        }
    };
}

uuid_id!(ProviderId);
uuid_id!(ServiceId);
uuid_id!(ServicePoolId);
uuid_id!(PublicationId);
uuid_id!(UserServiceId);
uuid_id!(UserId);
uuid_id!(GroupId);
uuid_id!(AccountId);

/// Internal auto-incrementing id, used only for row locking / ordering.
/// Never serialized across the plug-in boundary.
pub type InternalId = i64;
