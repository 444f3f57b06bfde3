// src/connection/registry.rs

//! The concurrent map of live connections: the single source of truth for
//! which sockets the reactor must watch.

use super::ConnectionId;
use super::entry::ConnectionEntry;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use std::sync::Arc;

/// Maps a connection id to its entry. Cloning shares the same map.
///
/// Lookups hand out `Arc` clones so no shard lock is held while a connection
/// is being serviced; closure hooks running elsewhere can remove entries freely.
#[derive(Debug, Clone, Default)]
pub struct ConnectionRegistry {
    entries: Arc<DashMap<ConnectionId, Arc<ConnectionEntry>>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts a new entry. Returns false, leaving the map untouched, if the id
    /// is already tracked.
    pub fn insert(&self, entry: Arc<ConnectionEntry>) -> bool {
        match self.entries.entry(entry.id()) {
            Entry::Occupied(_) => false,
            Entry::Vacant(slot) => {
                slot.insert(entry);
                true
            }
        }
    }

    pub fn get(&self, id: ConnectionId) -> Option<Arc<ConnectionEntry>> {
        self.entries.get(&id).map(|e| e.value().clone())
    }

    /// Removes an entry. Removing an absent id is a no-op.
    pub fn remove(&self, id: ConnectionId) -> Option<Arc<ConnectionEntry>> {
        self.entries.remove(&id).map(|(_, entry)| entry)
    }

    pub fn contains(&self, id: ConnectionId) -> bool {
        self.entries.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// A point-in-time copy of the tracked entries.
    pub fn snapshot(&self) -> Vec<Arc<ConnectionEntry>> {
        self.entries.iter().map(|e| e.value().clone()).collect()
    }

    pub fn ids(&self) -> Vec<ConnectionId> {
        self.entries.iter().map(|e| *e.key()).collect()
    }
}
