//! Identifier newtypes and clock helpers.

use serde::{Deserialize, Serialize};
use std::fmt;

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            pub fn new(id: impl Into<String>) -> Self {
                Self(id.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self(s.to_string())
            }
        }

        impl From<String> for $name {
            fn from(s: String) -> Self {
                Self(s)
            }
        }
    };
}

string_id!(
    /// Opaque identifier of an alert (`alert_<uuid>`).
    AlertId
);

string_id!(
    /// Identity of a therapist, as asserted by the auth token.
    TherapistId
);

string_id!(
    /// Identifier of a single therapist connection (`conn_<uuid>`).
    ConnectionId
);

impl AlertId {
    pub fn generate() -> Self {
        Self(format!("alert_{}", uuid::Uuid::new_v4()))
    }
}

impl ConnectionId {
    pub fn generate() -> Self {
        Self(format!("conn_{}", uuid::Uuid::new_v4()))
    }
}

/// Current time as Unix milliseconds.
pub fn now_millis() -> u64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
