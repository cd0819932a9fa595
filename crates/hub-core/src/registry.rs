//! Two-index connection registry.
//!
//! - Primary index: `ConnectionId` → `(UserId, C)`.
//! - Secondary index: `UserId` → set of `ConnectionId`s.
//!
//! Both indices are only ever mutated together inside `&mut self`
//! methods, so wrapping one `Registry` in a single lock keeps them
//! consistent for every observer. The entry type `C` is whatever the
//! networking layer routes with (a cheap, cloneable handle); the
//! registry never creates or destroys connections itself.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};

use crate::ids::{ConnectionId, UserId};
use crate::stats::HubStats;

#[derive(Debug)]
pub struct Registry<C> {
    connections: HashMap<ConnectionId, (UserId, C)>,
    by_user: HashMap<UserId, HashSet<ConnectionId>>,
}

impl<C> Default for Registry<C> {
    fn default() -> Self {
        Registry {
            connections: HashMap::new(),
            by_user: HashMap::new(),
        }
    }
}

impl<C: Clone> Registry<C> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a connection to both indices.
    ///
    /// Returns the total number of connections after the insert.
    /// Re-inserting an existing id replaces the entry (and moves it to
    /// the new user if that changed).
    pub fn insert(&mut self, conn_id: ConnectionId, user_id: UserId, entry: C) -> usize {
        if let Some((previous_user, _)) = self.connections.remove(&conn_id) {
            self.detach_from_user(&previous_user, conn_id);
        }

        self.by_user
            .entry(user_id.clone())
            .or_default()
            .insert(conn_id);
        self.connections.insert(conn_id, (user_id, entry));

        self.connections.len()
    }

    /// Remove a connection from both indices.
    ///
    /// Removing an unknown id is a no-op and returns `None`; the read
    /// and write pumps of one connection can both report closure.
    pub fn remove(&mut self, conn_id: ConnectionId) -> Option<(UserId, C)> {
        let (user_id, entry) = self.connections.remove(&conn_id)?;
        self.detach_from_user(&user_id, conn_id);
        Some((user_id, entry))
    }

    /// Drop every entry, returning what was removed.
    pub fn clear(&mut self) -> Vec<(ConnectionId, UserId, C)> {
        self.by_user.clear();
        self.connections
            .drain()
            .map(|(id, (user, entry))| (id, user, entry))
            .collect()
    }

    /// Snapshot of a user's connections. Empty if the user is unknown.
    pub fn connections_for_user(&self, user_id: &UserId) -> Vec<C> {
        self.by_user
            .get(user_id)
            .map(|ids| {
                ids.iter()
                    .filter_map(|id| self.connections.get(id))
                    .map(|(_, entry)| entry.clone())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Snapshot of every connection, for broadcast.
    pub fn all_connections(&self) -> Vec<C> {
        self.connections
            .values()
            .map(|(_, entry)| entry.clone())
            .collect()
    }

    pub fn get(&self, conn_id: ConnectionId) -> Option<&C> {
        self.connections.get(&conn_id).map(|(_, entry)| entry)
    }

    pub fn user_of(&self, conn_id: ConnectionId) -> Option<&UserId> {
        self.connections.get(&conn_id).map(|(user, _)| user)
    }

    pub fn contains(&self, conn_id: ConnectionId) -> bool {
        self.connections.contains_key(&conn_id)
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    pub fn connected_user_ids(&self) -> BTreeSet<UserId> {
        self.by_user.keys().cloned().collect()
    }

    pub fn stats(&self) -> HubStats {
        let per_user_connection_counts: BTreeMap<UserId, usize> = self
            .by_user
            .iter()
            .map(|(user, ids)| (user.clone(), ids.len()))
            .collect();

        HubStats {
            total_connections: self.connections.len(),
            unique_users: per_user_connection_counts.len(),
            per_user_connection_counts,
        }
    }

    /// Check that the two indices describe the same set of connections.
    pub fn is_consistent(&self) -> bool {
        let indexed: usize = self.by_user.values().map(HashSet::len).sum();
        if indexed != self.connections.len() {
            return false;
        }

        self.by_user.iter().all(|(user, ids)| {
            !ids.is_empty()
                && ids.iter().all(|id| {
                    self.connections
                        .get(id)
                        .map(|(owner, _)| owner == user)
                        .unwrap_or(false)
                })
        })
    }

    fn detach_from_user(&mut self, user_id: &UserId, conn_id: ConnectionId) {
        let now_empty = match self.by_user.get_mut(user_id) {
            Some(ids) => {
                ids.remove(&conn_id);
                ids.is_empty()
            }
            None => false,
        };

        // Users with no connections left disappear from the index.
        if now_empty {
            self.by_user.remove(user_id);
        }
    }
}
