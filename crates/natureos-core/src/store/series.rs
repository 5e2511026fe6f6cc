// ── Per-series reading history ──
//
// Readings for one `(tenant, device, sensor)` are kept ordered by cursor.
// The cursor is the map key, so a duplicate `(timestamp, sequence)` can
// never produce a second row. Capacity is bounded; the oldest reading is
// evicted and reported to the caller.

use std::collections::BTreeMap;
use std::ops::Bound;

use chrono::{DateTime, Utc};

use crate::model::{Cursor, SensorReading};

/// Result of [`LocalStore::append_reading`](super::LocalStore::append_reading).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppendOutcome {
    /// Stored. `evicted` is the oldest reading dropped to stay in capacity.
    Inserted { evicted: Option<Cursor> },
    /// Already present; nothing changed.
    Duplicate,
    /// Older than everything retained in a full series; not stored.
    Expired,
}

impl AppendOutcome {
    pub fn is_new(&self) -> bool {
        matches!(self, Self::Inserted { .. })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Admission {
    Accept,
    Duplicate,
    Expired,
}

#[derive(Debug)]
pub(crate) struct ReadingSeries {
    readings: BTreeMap<Cursor, SensorReading>,
    capacity: usize,
}

impl ReadingSeries {
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            readings: BTreeMap::new(),
            capacity: capacity.max(1),
        }
    }

    pub(crate) fn admit(&self, cursor: &Cursor) -> Admission {
        if self.readings.contains_key(cursor) {
            return Admission::Duplicate;
        }
        let full = self.readings.len() >= self.capacity;
        match self.readings.first_key_value() {
            Some((oldest, _)) if full && cursor < oldest => Admission::Expired,
            _ => Admission::Accept,
        }
    }

    /// Insert an admitted reading; returns the evicted cursor, if any.
    pub(crate) fn insert(&mut self, reading: SensorReading) -> Option<Cursor> {
        self.readings.insert(reading.cursor(), reading);
        if self.readings.len() > self.capacity {
            self.readings.pop_first().map(|(cursor, _)| cursor)
        } else {
            None
        }
    }

    /// Drop everything strictly before `before`. Returns how many went.
    pub(crate) fn evict_before(&mut self, before: &Cursor) -> usize {
        let kept = self.readings.split_off(before);
        let removed = self.readings.len();
        self.readings = kept;
        removed
    }

    pub(crate) fn after(&self, after: Option<&Cursor>) -> Vec<SensorReading> {
        let lower = after.map_or(Bound::Unbounded, |c| Bound::Excluded(*c));
        self.readings
            .range((lower, Bound::Unbounded))
            .map(|(_, r)| r.clone())
            .collect()
    }

    pub(crate) fn between(&self, start: DateTime<Utc>, end: DateTime<Utc>) -> impl Iterator<Item = &SensorReading> {
        let lower = Cursor::new(start, 0);
        let upper = Cursor::new(end, u64::MAX);
        let range = if lower <= upper {
            Some(self.readings.range(lower..=upper))
        } else {
            None
        };
        range.into_iter().flatten().map(|(_, r)| r)
    }

    pub(crate) fn latest(&self) -> Option<Cursor> {
        self.readings.last_key_value().map(|(c, _)| *c)
    }

    pub(crate) fn iter(&self) -> impl Iterator<Item = &SensorReading> {
        self.readings.values()
    }

    pub(crate) fn len(&self) -> usize {
        self.readings.len()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::model::TenantId;

    fn reading(ts: i64, seq: u64) -> SensorReading {
        SensorReading {
            tenant_id: TenantId::default_tenant(),
            device_id: "esp32-001".into(),
            sensor_type: "temperature".into(),
            timestamp: DateTime::from_timestamp(ts, 0).unwrap(),
            sequence: seq,
            value: 21.0,
            unit: Some("C".into()),
        }
    }

    fn append(series: &mut ReadingSeries, r: SensorReading) -> AppendOutcome {
        match series.admit(&r.cursor()) {
            Admission::Accept => AppendOutcome::Inserted {
                evicted: series.insert(r),
            },
            Admission::Duplicate => AppendOutcome::Duplicate,
            Admission::Expired => AppendOutcome::Expired,
        }
    }

    #[test]
    fn duplicate_keys_store_one_row() {
        let mut series = ReadingSeries::new(100);
        let inputs = [(100, 0), (101, 0), (100, 0), (100, 1), (101, 0), (100, 0)];
        let new = inputs
            .iter()
            .filter(|(ts, seq)| append(&mut series, reading(*ts, *seq)).is_new())
            .count();

        assert_eq!(new, 3);
        assert_eq!(series.len(), 3);
        let order: Vec<_> = series.iter().map(|r| (r.timestamp.timestamp(), r.sequence)).collect();
        assert_eq!(order, vec![(100, 0), (100, 1), (101, 0)]);
    }

    #[test]
    fn capacity_evicts_oldest_and_rejects_older() {
        let mut series = ReadingSeries::new(2);
        append(&mut series, reading(100, 0));
        append(&mut series, reading(101, 0));

        let outcome = append(&mut series, reading(102, 0));
        assert_eq!(
            outcome,
            AppendOutcome::Inserted {
                evicted: Some(reading(100, 0).cursor())
            }
        );
        assert_eq!(append(&mut series, reading(99, 0)), AppendOutcome::Expired);
        assert_eq!(series.len(), 2);
    }

    #[test]
    fn range_queries() {
        let mut series = ReadingSeries::new(10);
        for ts in 100..105 {
            append(&mut series, reading(ts, 0));
        }

        let after = series.after(Some(&reading(102, 0).cursor()));
        assert_eq!(after.len(), 2);

        let start = DateTime::from_timestamp(101, 0).unwrap();
        let end = DateTime::from_timestamp(103, 0).unwrap();
        assert_eq!(series.between(start, end).count(), 3);
        assert_eq!(series.between(end, start).count(), 0);

        assert_eq!(series.evict_before(&reading(103, 0).cursor()), 3);
        assert_eq!(series.latest(), Some(reading(104, 0).cursor()));
    }
}
