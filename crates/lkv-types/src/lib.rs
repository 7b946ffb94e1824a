#![forbid(unsafe_code)]

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::num::NonZeroU64;

/// Identifies one specific write of a value within a single storage
/// instance.
///
/// Versions are opaque, strictly increasing tokens. "No version" (the value
/// is absent) is represented as `Option::<Version>::None` at the public
/// boundary, never as an in-band sentinel. Versions from different storage
/// instances are not comparable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Version(NonZeroU64);

impl Version {
    /// Wrap a raw engine version. The engine reserves 0 for "absent",
    /// which maps to `None` here.
    #[must_use]
    pub fn from_raw(raw: u64) -> Option<Self> {
        NonZeroU64::new(raw).map(Self)
    }

    /// The raw engine representation (never 0).
    #[must_use]
    pub fn raw(self) -> u64 {
        self.0.get()
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Convert an optional version back to the engine representation
/// (0 = absent).
#[must_use]
pub fn raw_version(version: Option<Version>) -> u64 {
    version.map_or(0, Version::raw)
}

/// A value payload together with the version that wrote it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionedValue {
    pub value: Bytes,
    pub version: Version,
}

impl VersionedValue {
    #[must_use]
    pub fn new(value: impl Into<Bytes>, version: Version) -> Self {
        Self {
            value: value.into(),
            version,
        }
    }
}

/// Snapshot of a single value, as reported by storage inspection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValueDetails {
    pub value: Bytes,
    pub version: Version,
}

/// Point-in-time snapshot of a storage instance.
///
/// Produced by `Storage::inspect` for tests and debugging; snapshots are
/// best-effort and never block concurrent operations. A closed storage
/// reports `is_closed = true` with an empty value map.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageDetails {
    pub values: BTreeMap<String, ValueDetails>,
    pub is_closed: bool,
}
