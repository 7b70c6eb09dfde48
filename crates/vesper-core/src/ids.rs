use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// String ids of the form `<prefix>_<uuid v7>`. Time-ordered, so they sort
/// by creation in logs.
macro_rules! prefixed_id {
    ($(#[$meta:meta])* $name:ident => $prefix:literal) => {
        $(#[$meta])*
        #[derive(Clone, Debug, Hash, Eq, PartialEq, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            pub const PREFIX: &'static str = $prefix;

            pub fn new() -> Self {
                Self(format!("{}_{}", Self::PREFIX, Uuid::now_v7()))
            }

            /// Wrap an id received from elsewhere without validating it.
            pub fn from_raw(s: impl Into<String>) -> Self {
                Self(s.into())
            }

            pub fn as_str(&self) -> &str {
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
                f.write_str(&self.0)
            }
        }
    };
}

prefixed_id! {
    /// One per process or window attached to the broadcast bus.
    TabId => "tab"
}

prefixed_id! {
    /// Shared by every attempt of one transport send.
    RequestId => "req"
}
