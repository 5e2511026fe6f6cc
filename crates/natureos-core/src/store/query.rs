// ── Lazy, restartable entity queries ──

use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};

use super::LocalStore;
use crate::model::{CommandState, DeviceStatus, Entity, EntityKey, EntityType, TenantId, Versioned};

/// Predicate applied while iterating a [`Query`].
#[derive(Clone, Default)]
pub enum EntityFilter {
    #[default]
    All,
    DeviceStatus(DeviceStatus),
    DeviceType(String),
    CommandState(CommandState),
    /// Devices with this id, or commands addressed to it.
    ForDevice(String),
    /// Records fetched strictly before this instant.
    FetchedBefore(DateTime<Utc>),
    And(Vec<EntityFilter>),
    Custom(Arc<dyn Fn(&Versioned<Entity>) -> bool + Send + Sync>),
}

impl EntityFilter {
    pub fn custom(f: impl Fn(&Versioned<Entity>) -> bool + Send + Sync + 'static) -> Self {
        Self::Custom(Arc::new(f))
    }

    pub fn matches(&self, record: &Versioned<Entity>) -> bool {
        match self {
            Self::All => true,
            Self::DeviceStatus(status) => record.value.as_device().is_some_and(|d| d.status == *status),
            Self::DeviceType(kind) => record
                .value
                .as_device()
                .is_some_and(|d| d.device_type.eq_ignore_ascii_case(kind)),
            Self::CommandState(state) => record.value.as_command().is_some_and(|c| c.state == *state),
            Self::ForDevice(id) => match &record.value {
                Entity::Device(d) => d.id == *id,
                Entity::Command(c) => c.device_id == *id,
            },
            Self::FetchedBefore(instant) => record.fetched_at < *instant,
            Self::And(filters) => filters.iter().all(|f| f.matches(record)),
            Self::Custom(f) => f(record),
        }
    }
}

impl fmt::Debug for EntityFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::All => f.write_str("All"),
            Self::DeviceStatus(s) => f.debug_tuple("DeviceStatus").field(s).finish(),
            Self::DeviceType(t) => f.debug_tuple("DeviceType").field(t).finish(),
            Self::CommandState(s) => f.debug_tuple("CommandState").field(s).finish(),
            Self::ForDevice(d) => f.debug_tuple("ForDevice").field(d).finish(),
            Self::FetchedBefore(t) => f.debug_tuple("FetchedBefore").field(t).finish(),
            Self::And(filters) => f.debug_tuple("And").field(filters).finish(),
            Self::Custom(_) => f.write_str("Custom(..)"),
        }
    }
}

/// A tenant-scoped query over one entity type.
///
/// Nothing is read until [`iter`](Self::iter) is called. Each call takes a
/// fresh snapshot of matching keys and resolves values lazily, so a query
/// can be iterated any number of times and always terminates.
pub struct Query<'a> {
    store: &'a LocalStore,
    tenant: TenantId,
    entity_type: EntityType,
    filter: EntityFilter,
}

impl<'a> Query<'a> {
    pub(crate) fn new(
        store: &'a LocalStore,
        tenant: TenantId,
        entity_type: EntityType,
        filter: EntityFilter,
    ) -> Self {
        Self {
            store,
            tenant,
            entity_type,
            filter,
        }
    }

    pub fn iter(&self) -> QueryIter<'_> {
        QueryIter {
            store: self.store,
            filter: &self.filter,
            keys: self.store.keys_for(&self.tenant, self.entity_type).into_iter(),
        }
    }

    pub fn to_vec(&self) -> Vec<Arc<Versioned<Entity>>> {
        self.iter().collect()
    }

    pub fn count(&self) -> usize {
        self.iter().count()
    }
}

impl<'q> IntoIterator for &'q Query<'_> {
    type Item = Arc<Versioned<Entity>>;
    type IntoIter = QueryIter<'q>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

/// Iterator returned by [`Query::iter`].
pub struct QueryIter<'q> {
    store: &'q LocalStore,
    filter: &'q EntityFilter,
    keys: std::vec::IntoIter<EntityKey>,
}

impl Iterator for QueryIter<'_> {
    type Item = Arc<Versioned<Entity>>;

    fn next(&mut self) -> Option<Self::Item> {
        // Keys removed since the snapshot are skipped.
        for key in self.keys.by_ref() {
            if let Some(record) = self.store.entity(&key) {
                if self.filter.matches(&record) {
                    return Some(record);
                }
            }
        }
        None
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        (0, Some(self.keys.len()))
    }
}
