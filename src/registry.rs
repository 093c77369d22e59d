//! Registry of live connections.
//!
//! The accept loop inserts, each connection task removes itself when its
//! loop ends, and `stop` closes and clears everything. All three run
//! concurrently, so the slab sits behind a mutex. The lock is never held
//! across an await.

use slab::Slab;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio_util::sync::CancellationToken;

use crate::connection::ConnectionInfo;

/// A registered connection.
#[derive(Debug)]
pub struct Connection {
    pub info: ConnectionInfo,
    /// Cancelling this token closes the connection.
    close: CancellationToken,
}

impl Connection {
    /// Ask the owning task to close the socket.
    pub fn close(&self) {
        self.close.cancel();
    }
}

/// Registry of active connections using slab allocation.
#[derive(Debug)]
pub struct ConnectionRegistry {
    connections: Mutex<Slab<Connection>>,
    max_connections: usize,
}

impl ConnectionRegistry {
    /// Create a new registry with specified maximum capacity.
    pub fn new(max_connections: usize) -> Self {
        Self {
            connections: Mutex::new(Slab::new()),
            max_connections,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Slab<Connection>> {
        self.connections
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Register a connection whose close signal is a child of `parent`.
    ///
    /// Returns `None` if the registry is at capacity. The entry is removed
    /// when the returned [`Registration`] is dropped.
    pub fn register(
        self: &Arc<Self>,
        info: ConnectionInfo,
        parent: &CancellationToken,
    ) -> Option<Registration> {
        let close = parent.child_token();
        let id = info.id;

        let key = {
            let mut connections = self.lock();
            if connections.len() >= self.max_connections {
                return None;
            }
            connections.insert(Connection {
                info,
                close: close.clone(),
            })
        };

        Some(Registration {
            registry: Arc::clone(self),
            key,
            id,
            close,
        })
    }

    /// Remove an entry if it still belongs to connection `id`.
    ///
    /// Slab keys are reused, so the id guards against removing a newer
    /// connection after `close_all` already cleared this one.
    fn remove(&self, key: usize, id: u64) -> Option<Connection> {
        let mut connections = self.lock();
        match connections.get(key) {
            Some(conn) if conn.info.id == id => Some(connections.remove(key)),
            _ => None,
        }
    }

    /// Check if connection `id` is registered.
    pub fn contains(&self, id: u64) -> bool {
        self.lock().iter().any(|(_, conn)| conn.info.id == id)
    }

    /// Number of active connections.
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// Check if there are no connections.
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Maximum number of connections allowed.
    pub fn capacity(&self) -> usize {
        self.max_connections
    }

    /// Identities of all registered connections.
    pub fn snapshot(&self) -> Vec<ConnectionInfo> {
        self.lock().iter().map(|(_, conn)| conn.info.clone()).collect()
    }

    /// Close every registered connection and clear the registry.
    ///
    /// Returns the number of connections closed.
    pub fn close_all(&self) -> usize {
        let drained: Vec<Connection> = self.lock().drain().collect();
        for conn in &drained {
            conn.close();
        }
        drained.len()
    }
}

/// Handle owned by a connection task for the lifetime of its entry.
#[derive(Debug)]
pub struct Registration {
    registry: Arc<ConnectionRegistry>,
    key: usize,
    id: u64,
    close: CancellationToken,
}

impl Registration {
    /// Id of the registered connection.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Fires when the connection should be closed.
    pub fn close_signal(&self) -> &CancellationToken {
        &self.close
    }
}

impl Drop for Registration {
    fn drop(&mut self) {
        // Already gone if close_all got there first
        self.registry.remove(self.key, self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn info(id: u64) -> ConnectionInfo {
        ConnectionInfo {
            id,
            peer: format!("127.0.0.1:{}", 40000 + id).parse().unwrap(),
            connected_at: Utc::now(),
        }
    }

    #[test]
    fn test_register_and_drop() {
        let registry = Arc::new(ConnectionRegistry::new(8));
        let root = CancellationToken::new();

        let reg = registry.register(info(1), &root).unwrap();
        assert_eq!(reg.id(), 1);
        assert!(registry.contains(1));
        assert_eq!(registry.len(), 1);

        drop(reg);
        assert!(!registry.contains(1));
        assert!(registry.is_empty());
    }

    #[test]
    fn test_capacity() {
        let registry = Arc::new(ConnectionRegistry::new(2));
        let root = CancellationToken::new();

        let _a = registry.register(info(1), &root).unwrap();
        let _b = registry.register(info(2), &root).unwrap();

        // At capacity
        assert!(registry.register(info(3), &root).is_none());
        assert_eq!(registry.capacity(), 2);
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn test_close_all_signals_and_clears() {
        let registry = Arc::new(ConnectionRegistry::new(8));
        let root = CancellationToken::new();

        let a = registry.register(info(1), &root).unwrap();
        let b = registry.register(info(2), &root).unwrap();

        assert_eq!(registry.close_all(), 2);
        assert!(registry.is_empty());
        assert!(a.close_signal().is_cancelled());
        assert!(b.close_signal().is_cancelled());

        // Closing twice is benign
        assert_eq!(registry.close_all(), 0);
    }

    #[test]
    fn test_stale_registration_does_not_remove_reused_key() {
        let registry = Arc::new(ConnectionRegistry::new(8));
        let root = CancellationToken::new();

        let old = registry.register(info(1), &root).unwrap();
        registry.close_all();

        // The new entry lands in the slot the old one used
        let new = registry.register(info(2), &root).unwrap();
        drop(old);

        assert!(registry.contains(2));
        assert_eq!(registry.len(), 1);
        drop(new);
        assert!(registry.is_empty());
    }

    #[test]
    fn test_parent_cancellation_reaches_connections() {
        let registry = Arc::new(ConnectionRegistry::new(8));
        let root = CancellationToken::new();

        let reg = registry.register(info(1), &root).unwrap();
        root.cancel();
        assert!(reg.close_signal().is_cancelled());
    }

    #[test]
    fn test_snapshot() {
        let registry = Arc::new(ConnectionRegistry::new(8));
        let root = CancellationToken::new();

        let _a = registry.register(info(7), &root).unwrap();
        let ids: Vec<u64> = registry.snapshot().iter().map(|c| c.id).collect();
        assert_eq!(ids, vec![7]);
    }
}
