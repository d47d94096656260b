//! Live connections for one hub, ordered by id (which is accept order).

use std::collections::BTreeMap;

use crate::connection::Connection;
use crate::ids::ConnectionId;

/// Registry of open connections.
#[derive(Debug, Default)]
pub struct ConnectionRegistry {
    connections: BTreeMap<ConnectionId, Connection>,
}

impl ConnectionRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a connection. Returns the previous entry with the same id.
    pub fn insert(&mut self, connection: Connection) -> Option<Connection> {
        self.connections.insert(connection.id().clone(), connection)
    }

    /// Deregister a connection.
    pub fn remove(&mut self, id: &ConnectionId) -> Option<Connection> {
        self.connections.remove(id)
    }

    /// Look up a connection.
    pub fn get(&self, id: &ConnectionId) -> Option<&Connection> {
        self.connections.get(id)
    }

    /// Whether `id` is registered.
    pub fn contains(&self, id: &ConnectionId) -> bool {
        self.connections.contains_key(id)
    }

    /// Number of registered connections.
    pub fn len(&self) -> usize {
        self.connections.len()
    }

    /// Whether no connections are registered.
    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    /// Iterate in accept order.
    pub fn iter(&self) -> impl Iterator<Item = &Connection> {
        self.connections.values()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::extension::ExtensionSet;
    use crate::test_utils::RecordingTransport;
    use crate::transport::Transport;
    use std::sync::Arc;

    fn connection() -> Connection {
        let transport: Arc<dyn Transport> = Arc::new(RecordingTransport::new());
        Connection::establish(transport, None, &ExtensionSet::new())
    }

    #[test]
    fn insert_get_remove() {
        let mut registry = ConnectionRegistry::new();
        let conn = connection();
        assert!(registry.insert(conn.clone()).is_none());
        assert!(registry.contains(conn.id()));
        assert_eq!(registry.get(conn.id()), Some(&conn));
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.remove(conn.id()), Some(conn.clone()));
        assert!(registry.is_empty());
        assert!(registry.remove(conn.id()).is_none());
    }

    #[test]
    fn iterates_in_accept_order() {
        let mut registry = ConnectionRegistry::new();
        let first = connection();
        std::thread::sleep(std::time::Duration::from_millis(2));
        let second = connection();
        let _ = registry.insert(second.clone());
        let _ = registry.insert(first.clone());
        let order: Vec<_> = registry.iter().cloned().collect();
        assert_eq!(order, vec![first, second]);
    }
}
