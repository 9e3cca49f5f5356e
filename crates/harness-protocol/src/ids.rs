//! Typed identifiers for the harness.
//!
//! IDs are opaque String wrappers (serde-transparent) so that they serialize
//! exactly as the plain strings stored in the dispatch file, receipts and
//! event logs.

use serde::{Deserialize, Serialize};
use std::fmt;

macro_rules! typed_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            /// Create from any string value.
            pub fn from_string(s: impl Into<String>) -> Self {
                Self(s.into())
            }

            /// View as string slice.
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<String> for $name {
            fn from(s: String) -> Self {
                Self(s)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self(s.to_string())
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }
    };
}

typed_id!(
    /// Identifier of one control-loop invocation: `{timestamp}-{8 hex}`.
    RunId
);
typed_id!(
    /// Identifier of a work order in the dispatch file.
    WorkOrderId
);
typed_id!(
    /// Identifier of a cycle within a run: `cycle-NNNN`.
    CycleId
);

impl RunId {
    /// Build a fresh run id from a `YYYY-MM-DDTHH:MM:SSZ` timestamp.
    pub fn generate(timestamp_utc: &str) -> Self {
        let suffix = uuid::Uuid::new_v4().simple().to_string();
        Self(format!("{timestamp_utc}-{}", &suffix[..8]))
    }
}

impl CycleId {
    const PREFIX: &'static str = "cycle-";

    pub fn from_index(index: u32) -> Self {
        Self(format!("{}{index:04}", Self::PREFIX))
    }

    /// Numeric index, or `None` for ids not shaped `cycle-<digits>`.
    pub fn index(&self) -> Option<u32> {
        let tail = self.0.strip_prefix(Self::PREFIX)?;
        if tail.is_empty() || !tail.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }
        tail.parse().ok()
    }
}

/// SHA-256 hex digest of canonical bytes; addresses dispatch snapshots.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ContentHash(String);

impl ContentHash {
    pub fn from_hex(hex: impl Into<String>) -> Self {
        Self(hex.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Leading eight hex characters, used in receipt filenames.
    pub fn short(&self) -> &str {
        self.0.get(..8).unwrap_or(&self.0)
    }
}

impl fmt::Display for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl AsRef<str> for ContentHash {
    fn as_ref(&self) -> &str {
        &self.0
    }
}
