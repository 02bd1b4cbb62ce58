use std::cmp::Ordering;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// The `(version, server timestamp)` pair stamped on every persisted document
/// and every record.
///
/// Markers are totally ordered: first by `version`, then by `server_timestamp`.
/// Every staleness decision in the crate (push events, refetched pages, save
/// responses, replayed writes) goes through [`VersionMarker::supersedes`] so
/// there is exactly one ordering policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct VersionMarker {
    pub version: i64,
    #[serde(rename = "updatedAt")]
    pub server_timestamp: DateTime<Utc>,
}

impl VersionMarker {
    pub fn new(version: i64, server_timestamp: DateTime<Utc>) -> Self {
        Self {
            version,
            server_timestamp,
        }
    }

    /// `self` supersedes `other` iff `self.version > other.version`, or the
    /// versions are equal and `self.server_timestamp >= other.server_timestamp`.
    ///
    /// Equal markers supersede each other, which makes re-applying the same
    /// update a harmless no-op merge instead of a discard.
    pub fn supersedes(&self, other: &VersionMarker) -> bool {
        self >= other
    }

    /// True when `incoming` should be applied over whatever is held locally.
    /// Nothing held locally means anything is fresh.
    pub fn is_fresh(incoming: &VersionMarker, local: Option<&VersionMarker>) -> bool {
        local.map_or(true, |local| incoming.supersedes(local))
    }
}

impl Ord for VersionMarker {
    fn cmp(&self, other: &Self) -> Ordering {
        self.version
            .cmp(&other.version)
            .then_with(|| self.server_timestamp.cmp(&other.server_timestamp))
    }
}

impl PartialOrd for VersionMarker {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}
