use std::collections::HashMap;
use std::sync::Arc;

use beacon_core::{ConnectionId, HubError};
use parking_lot::RwLock;

use crate::connection::Connection;

/// Process-wide set of live connections.
///
/// A plain map behind one RwLock: mutations are mutually exclusive with each
/// other and with snapshot capture, so a snapshot is a true point-in-time
/// copy — fan-out iterates the copy and never races registry mutation.
pub struct ConnectionRegistry {
    inner: RwLock<HashMap<ConnectionId, Arc<Connection>>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(HashMap::new()),
        }
    }

    /// Insert a connection under its id.
    pub fn add(&self, connection: Arc<Connection>) -> Result<(), HubError> {
        let mut map = self.inner.write();
        let id = connection.id().clone();
        if map.contains_key(&id) {
            return Err(HubError::DuplicateIdentity(id));
        }
        map.insert(id, connection);
        Ok(())
    }

    /// Remove by id. Idempotent: removing an absent id is a no-op.
    pub fn remove(&self, id: &ConnectionId) -> Option<Arc<Connection>> {
        self.inner.write().remove(id)
    }

    pub fn lookup(&self, id: &ConnectionId) -> Option<Arc<Connection>> {
        self.inner.read().get(id).cloned()
    }

    /// Point-in-time copy of all live connections.
    pub fn snapshot(&self) -> Vec<Arc<Connection>> {
        self.inner.read().values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.inner.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().is_empty()
    }

    /// Drop all entries. Used at hub teardown after connections closed.
    pub fn clear(&self) {
        self.inner.write().clear();
    }
}

impl Default for ConnectionRegistry {
    fn default() -> Self {
        Self::new()
    }
}
