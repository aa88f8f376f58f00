//! Connection table and per-user connection sets.
//!
//! Membership lives here and nowhere else. Both maps are sharded, so
//! operations on different users rarely contend. Entry locks are never held
//! across an await and always taken connections-first, then users.

use std::sync::{Arc, Weak};

use courier_core::{ConnectionId, ManagerError, Result, UserId};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tracing::debug;

use super::connection::ClientConnection;

/// Registry of live connections for one or more users.
#[derive(Default)]
pub struct ConnectionRegistry {
    connections: DashMap<ConnectionId, Arc<ClientConnection>>,
    users: DashMap<UserId, Vec<ConnectionId>>,
}

impl ConnectionRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a connection.
    ///
    /// Re-adding an id for the same user replaces the old record and returns
    /// it so the caller can close it. An id owned by another user is a
    /// [`ManagerError::ConnectionIdConflict`].
    pub fn add(&self, connection: Arc<ClientConnection>) -> Result<Option<Arc<ClientConnection>>> {
        if connection.id.is_blank() {
            return Err(ManagerError::InvalidConnection("connection id is empty".into()));
        }
        if connection.user_id.is_blank() {
            return Err(ManagerError::InvalidConnection("user id is empty".into()));
        }

        let id = connection.id.clone();
        let user = connection.user_id.clone();
        let replaced = match self.connections.entry(id.clone()) {
            Entry::Occupied(mut slot) => {
                if slot.get().user_id != user {
                    return Err(ManagerError::ConnectionIdConflict {
                        connection_id: id,
                        owner: slot.get().user_id.clone(),
                    });
                }
                Some(slot.insert(connection))
            }
            Entry::Vacant(slot) => {
                // Linked under the connection shard lock so a racing remove
                // always sees both halves.
                {
                    let mut ids = self.users.entry(user.clone()).or_default();
                    if !ids.contains(&id) {
                        ids.push(id.clone());
                    }
                }
                let _ = slot.insert(connection);
                None
            }
        };

        debug!(conn_id = %id, user_id = %user, replaced = replaced.is_some(), "connection registered");
        Ok(replaced)
    }

    /// Remove a connection. Unknown ids are a no-op.
    pub fn remove(&self, connection_id: &str) -> Option<Arc<ClientConnection>> {
        let Entry::Occupied(slot) = self.connections.entry(ConnectionId::from(connection_id)) else {
            return None;
        };
        self.unlink(slot.get());
        let removed = slot.remove();
        debug!(conn_id = connection_id, user_id = %removed.user_id, "connection unregistered");
        Some(removed)
    }

    /// Remove `connection` only if it is still the registered record for its
    /// id (a replacement is left in place).
    pub fn remove_exact(&self, connection: &Arc<ClientConnection>) -> bool {
        match self.connections.entry(connection.id.clone()) {
            Entry::Occupied(slot) if Arc::ptr_eq(slot.get(), connection) => {
                self.unlink(connection);
                let _ = slot.remove();
                true
            }
            _ => false,
        }
    }

    /// Called with the connection's table entry locked.
    fn unlink(&self, removed: &ClientConnection) {
        if let Entry::Occupied(mut slot) = self.users.entry(removed.user_id.clone()) {
            slot.get_mut().retain(|id| *id != removed.id);
            if slot.get().is_empty() {
                let _ = slot.remove();
            }
        }
    }

    /// Look up a connection.
    pub fn get(&self, connection_id: &str) -> Option<Arc<ClientConnection>> {
        self.connections.get(connection_id).map(|c| Arc::clone(c.value()))
    }

    /// A user's connections in registration order.
    pub fn list_for_user(&self, user_id: &str) -> Vec<Arc<ClientConnection>> {
        let ids = match self.users.get(user_id) {
            Some(ids) => ids.clone(),
            None => return Vec::new(),
        };
        ids.iter()
            .filter_map(|id| self.get(id))
            .filter(|conn| conn.user_id.as_str() == user_id)
            .collect()
    }

    /// Total registered connections.
    pub fn count(&self) -> usize {
        self.connections.len()
    }

    /// Users with at least one connection.
    pub fn users(&self) -> Vec<UserId> {
        self.users.iter().map(|e| e.key().clone()).collect()
    }

    /// Number of users with at least one connection.
    pub fn user_count(&self) -> usize {
        self.users.len()
    }

    /// Snapshot of every connection.
    pub fn all(&self) -> Vec<Arc<ClientConnection>> {
        self.connections.iter().map(|e| Arc::clone(e.value())).collect()
    }
}

impl std::fmt::Debug for ConnectionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionRegistry")
            .field("connections", &self.count())
            .field("users", &self.user_count())
            .finish()
    }
}

/// Process-wide connection id ownership.
///
/// Registries are per user, so an id reused by another user can only be
/// caught here. Whoever unregisters a connection releases its entry; an entry
/// whose registry no longer holds the id is overwritten on the next claim.
#[derive(Default)]
pub(crate) struct ConnectionOwnership {
    owners: DashMap<ConnectionId, (UserId, Weak<ConnectionRegistry>)>,
}

impl ConnectionOwnership {
    /// Record `user` as the owner of `id`, failing if another user's registry
    /// still holds it.
    pub(crate) fn claim(
        &self,
        id: &ConnectionId,
        user: &UserId,
        registry: &Arc<ConnectionRegistry>,
    ) -> Result<()> {
        let record = (user.clone(), Arc::downgrade(registry));
        match self.owners.entry(id.clone()) {
            Entry::Occupied(mut slot) => {
                let (owner, owner_registry) = slot.get();
                if owner != user {
                    let live = owner_registry
                        .upgrade()
                        .and_then(|r| r.get(id))
                        .is_some_and(|c| c.user_id == *owner);
                    if live {
                        return Err(ManagerError::ConnectionIdConflict {
                            connection_id: id.clone(),
                            owner: owner.clone(),
                        });
                    }
                }
                let _ = slot.insert(record);
            }
            Entry::Vacant(slot) => {
                let _ = slot.insert(record);
            }
        }
        Ok(())
    }

    pub(crate) fn release(&self, id: &str, user: &UserId) {
        let _ = self.owners.remove_if(id, |_, (owner, _)| owner == user);
    }

    pub(crate) fn clear(&self) {
        self.owners.clear();
    }

    /// Ids currently owned.
    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.owners.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::websocket::connection::ConnectionOptions;
    use crate::websocket::transport::MemoryTransport;
    use assert_matches::assert_matches;

    fn conn(id: &str, user: &str) -> Arc<ClientConnection> {
        let (transport, _rx) = MemoryTransport::new();
        ClientConnection::spawn(
            ConnectionId::from(id),
            UserId::from(user),
            None,
            transport,
            &ConnectionOptions::default(),
        )
    }

    #[tokio::test]
    async fn add_and_list_in_order() {
        let reg = ConnectionRegistry::new();
        for id in ["c3", "c1", "c2"] {
            assert!(reg.add(conn(id, "u1")).unwrap().is_none());
        }
        let ids: Vec<_> = reg.list_for_user("u1").iter().map(|c| c.id.to_string()).collect();
        assert_eq!(ids, ["c3", "c1", "c2"]);
        assert_eq!(reg.count(), 3);
        assert_eq!(reg.user_count(), 1);
    }

    #[tokio::test]
    async fn blank_ids_are_invalid() {
        let reg = ConnectionRegistry::new();
        assert_matches!(reg.add(conn("", "u1")), Err(ManagerError::InvalidConnection(_)));
        assert_matches!(reg.add(conn("c1", " ")), Err(ManagerError::InvalidConnection(_)));
        assert_eq!(reg.count(), 0);
    }

    #[tokio::test]
    async fn same_user_readd_replaces() {
        let reg = ConnectionRegistry::new();
        let first = conn("c1", "u1");
        let _ = reg.add(Arc::clone(&first)).unwrap();
        let replaced = reg.add(conn("c1", "u1")).unwrap().unwrap();
        assert!(Arc::ptr_eq(&replaced, &first));
        assert_eq!(reg.list_for_user("u1").len(), 1);
    }

    #[tokio::test]
    async fn foreign_user_readd_conflicts() {
        let reg = ConnectionRegistry::new();
        let _ = reg.add(conn("c1", "u1")).unwrap();
        assert_matches!(
            reg.add(conn("c1", "u2")),
            Err(ManagerError::ConnectionIdConflict { owner, .. }) if owner.as_str() == "u1"
        );
        assert!(reg.list_for_user("u2").is_empty());
    }

    #[tokio::test]
    async fn remove_prunes_empty_user_set() {
        let reg = ConnectionRegistry::new();
        let _ = reg.add(conn("c1", "u1")).unwrap();
        assert!(reg.remove("c1").is_some());
        assert!(reg.remove("c1").is_none());
        assert!(reg.remove("never").is_none());
        assert_eq!(reg.user_count(), 0);
        assert!(reg.users().is_empty());
    }

    #[tokio::test]
    async fn remove_exact_spares_replacement() {
        let reg = ConnectionRegistry::new();
        let old = conn("c1", "u1");
        let _ = reg.add(Arc::clone(&old)).unwrap();
        let new = conn("c1", "u1");
        let _ = reg.add(Arc::clone(&new)).unwrap();
        assert!(!reg.remove_exact(&old));
        assert!(Arc::ptr_eq(&reg.get("c1").unwrap(), &new));
        assert!(reg.remove_exact(&new));
        assert_eq!(reg.count(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn concurrent_add_remove_keeps_sets_consistent() {
        let reg = Arc::new(ConnectionRegistry::new());
        let ids = ["c0", "c1", "c2", "c3"];
        let workers: Vec<Vec<Arc<ClientConnection>>> = (0..4)
            .map(|_| ids.iter().map(|id| conn(id, "u1")).collect())
            .collect();

        std::thread::scope(|s| {
            for (w, conns) in workers.iter().enumerate() {
                let reg = Arc::clone(&reg);
                let _ = s.spawn(move || {
                    for round in 0..2000 {
                        let conn = &conns[(round + w) % conns.len()];
                        let _ = reg.add(Arc::clone(conn));
                        if round % 2 == w % 2 {
                            let _ = reg.remove(&conn.id);
                        } else {
                            let _ = reg.remove_exact(conn);
                        }
                    }
                });
            }
        });

        // Every listed id has a row and every row is listed.
        let listed: Vec<ConnectionId> = reg.users.get("u1").map(|v| v.clone()).unwrap_or_default();
        for id in &listed {
            assert!(reg.get(id).is_some(), "dangling id {id} in user set");
        }
        for conn in reg.all() {
            assert!(listed.contains(&conn.id), "row {} missing from user set", conn.id);
        }
        for id in ids {
            let _ = reg.remove(id);
        }
        assert_eq!(reg.count(), 0);
        assert_eq!(reg.user_count(), 0);
    }

    #[tokio::test]
    async fn users_are_disjoint() {
        let reg = ConnectionRegistry::new();
        let _ = reg.add(conn("a1", "alice")).unwrap();
        let _ = reg.add(conn("b1", "bob")).unwrap();
        let _ = reg.add(conn("a2", "alice")).unwrap();
        assert!(reg.list_for_user("alice").iter().all(|c| c.user_id.as_str() == "alice"));
        assert_eq!(reg.list_for_user("bob").len(), 1);
        let mut users = reg.users();
        users.sort();
        assert_eq!(users, [UserId::from("alice"), UserId::from("bob")]);
        assert_eq!(reg.all().len(), 3);
    }
}
