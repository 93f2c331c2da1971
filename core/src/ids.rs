//! Identifiers.
//!
//! Products and orders are owned by external services and only referenced here;
//! their ids are UUIDs so both sides can mint them without coordination.

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

macro_rules! uuid_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        pub struct $name(Uuid);

        impl $name {
            #[doc = concat!("Creates a new random `", stringify!($name), "`")]
            #[must_use]
            pub fn new() -> Self {
                Self(Uuid::new_v4())
            }

            #[doc = concat!("Create a `", stringify!($name), "` from a `Uuid`")]
            #[must_use]
            pub const fn from_uuid(uuid: Uuid) -> Self {
                Self(uuid)
            }

            /// Get the inner UUID
            #[must_use]
            pub const fn as_uuid(&self) -> &Uuid {
                &self.0
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
    };
}

uuid_id!(
    /// Unique identifier for a product
    ProductId
);

uuid_id!(
    /// Unique identifier for an order
    OrderId
);

uuid_id!(
    /// Unique identifier for a single order line
    OrderItemId
);

uuid_id!(
    /// Unique identifier for a stock reservation
    ReservationId
);

uuid_id!(
    /// Unique identifier for an inventory adjustment audit row
    AdjustmentId
);

/// Shopper session (cart) identifier.
///
/// Opaque token issued by the cart layer; reservations are scoped to it.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SessionId(String);

impl SessionId {
    /// Wrap a session token.
    #[must_use]
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    /// Borrow the raw token.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for SessionId {
    fn from(token: &str) -> Self {
        Self::new(token)
    }
}

/// Stock location (warehouse) identifier.
///
/// Most deployments run a single location, [`LocationId::DEFAULT`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct LocationId(i64);

impl LocationId {
    /// The single location used when none is configured.
    pub const DEFAULT: Self = Self(1);

    /// Create a `LocationId` from its numeric code.
    #[must_use]
    pub const fn new(code: i64) -> Self {
        Self(code)
    }

    /// Numeric code of this location.
    #[must_use]
    pub const fn get(self) -> i64 {
        self.0
    }
}

impl Default for LocationId {
    fn default() -> Self {
        Self::DEFAULT
    }
}

impl fmt::Display for LocationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn uuid_ids_are_unique_and_roundtrip() {
        let a = ProductId::new();
        let b = ProductId::new();
        assert_ne!(a, b);
        assert_eq!(ProductId::from_uuid(*a.as_uuid()), a);
    }

    #[test]
    fn session_id_displays_raw_token() {
        let session = SessionId::from("cart-42");
        assert_eq!(session.to_string(), "cart-42");
        assert_eq!(session.as_str(), "cart-42");
    }

    #[test]
    fn default_location_is_one() {
        assert_eq!(LocationId::default().get(), 1);
    }
}
