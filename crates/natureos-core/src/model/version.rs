// ── Entity versioning ──
//
// Remote versions are platform-assigned and totally ordered. While the
// platform has not yet confirmed a local change, the record carries a
// tentative marker layered on the last confirmed version it was based on.

use std::cmp::Ordering;
use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Version of a cached record.
///
/// Ordering: confirmed versions compare by number; a tentative version
/// ranks above its `base` and below `base + 1`, with later local edits
/// ranking higher.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EntityVersion {
    Confirmed { version: u64 },
    Tentative { base: u64, local: u64 },
}

impl EntityVersion {
    pub fn confirmed(version: u64) -> Self {
        Self::Confirmed { version }
    }

    pub fn tentative(base: u64, local: u64) -> Self {
        Self::Tentative { base, local }
    }

    pub fn is_confirmed(&self) -> bool {
        matches!(self, Self::Confirmed { .. })
    }

    /// The last platform-confirmed version this one builds on.
    pub fn base(&self) -> u64 {
        match *self {
            Self::Confirmed { version } => version,
            Self::Tentative { base, .. } => base,
        }
    }

    /// A local edit on top of this version.
    pub fn next_tentative(&self) -> Self {
        match *self {
            Self::Confirmed { version } => Self::tentative(version, 1),
            Self::Tentative { base, local } => Self::tentative(base, local.saturating_add(1)),
        }
    }

    fn rank(self) -> (u64, u8, u64) {
        match self {
            Self::Confirmed { version } => (version, 0, 0),
            Self::Tentative { base, local } => (base, 1, local),
        }
    }
}

impl Ord for EntityVersion {
    fn cmp(&self, other: &Self) -> Ordering {
        self.rank().cmp(&other.rank())
    }
}

impl PartialOrd for EntityVersion {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for EntityVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Confirmed { version } => write!(f, "v{version}"),
            Self::Tentative { base, local } => write!(f, "v{base}+local{local}"),
        }
    }
}

/// A cached value with its version and the moment it was obtained.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Versioned<T> {
    pub value: T,
    pub version: EntityVersion,
    pub fetched_at: DateTime<Utc>,
}

impl<T> Versioned<T> {
    pub fn new(value: T, version: EntityVersion, fetched_at: DateTime<Utc>) -> Self {
        Self {
            value,
            version,
            fetched_at,
        }
    }

    /// Age relative to `now`; zero if `fetched_at` is in the future.
    pub fn age(&self, now: DateTime<Utc>) -> Duration {
        (now - self.fetched_at).to_std().unwrap_or(Duration::ZERO)
    }

    pub fn is_fresh(&self, max_staleness: Duration, now: DateTime<Utc>) -> bool {
        self.age(now) <= max_staleness
    }

    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> Versioned<U> {
        Versioned {
            value: f(self.value),
            version: self.version,
            fetched_at: self.fetched_at,
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn tentative_sits_between_confirmed_versions() {
        let v3 = EntityVersion::confirmed(3);
        let t3 = v3.next_tentative();
        let t3b = t3.next_tentative();
        let v4 = EntityVersion::confirmed(4);

        assert!(v3 < t3);
        assert!(t3 < t3b);
        assert!(t3b < v4);
        assert_eq!(t3b.base(), 3);
        assert_eq!(t3b.to_string(), "v3+local2");
    }

    #[test]
    fn freshness_is_measured_from_fetch_time() {
        let fetched = DateTime::from_timestamp(1_000, 0).unwrap();
        let cached = Versioned::new("x", EntityVersion::confirmed(1), fetched);
        let later = DateTime::from_timestamp(1_030, 0).unwrap();

        assert_eq!(cached.age(later), Duration::from_secs(30));
        assert!(cached.is_fresh(Duration::from_secs(30), later));
        assert!(!cached.is_fresh(Duration::from_secs(29), later));
        assert_eq!(cached.age(DateTime::from_timestamp(900, 0).unwrap()), Duration::ZERO);
    }
}
