//! Strongly typed identifiers.
//!
//! Four id spaces flow through the same call sites, so each gets its own
//! newtype over a 128-bit UUID rather than a bare `Uuid`:
//!
//! - [`WorkItemId`]: identity of a queue row; never changes across retries.
//! - [`MessageId`]: logical message identity; the handle joins use.
//! - [`OwnerToken`]: identity of a worker instance holding claims.
//! - [`JoinId`]: identity of a fan-in coordination record.

use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

macro_rules! uuid_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(
            Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
        )]
        #[serde(transparent)]
        pub struct $name(Uuid);

        impl $name {
            /// A fresh random (v4) id.
            pub fn random() -> Self {
                Self(Uuid::new_v4())
            }

            pub const fn from_uuid(id: Uuid) -> Self {
                Self(id)
            }

            pub const fn as_uuid(&self) -> Uuid {
                self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                self.0.fmt(f)
            }
        }

        impl From<Uuid> for $name {
            fn from(id: Uuid) -> Self {
                Self(id)
            }
        }

        impl From<$name> for Uuid {
            fn from(id: $name) -> Self {
                id.0
            }
        }
    };
}

uuid_id! {
    /// Primary key of a queue row. Stable across retries of the same row.
    WorkItemId
}

uuid_id! {
    /// Logical message identity, stable across stores. Joins reference
    /// members by this id, never by the row key.
    MessageId
}

uuid_id! {
    /// Identity of a worker instance. Ack/abandon/fail compare it for
    /// equality against the claiming owner.
    OwnerToken
}

uuid_id! {
    /// Identity of a fan-in coordination record.
    JoinId
}
