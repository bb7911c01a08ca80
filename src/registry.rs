//! Registry of live relay connections.
//!
//! Owned by a [`RelayServer`](crate::server::RelayServer) instance. Entries are
//! added when a connection is accepted and removed when its [`Registration`]
//! guard is dropped, whichever way the connection handler exits.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tracing::debug;

pub type ConnectionId = u64;

#[derive(Debug, Clone)]
pub struct ConnectionInfo {
    pub id: ConnectionId,
    pub peer: SocketAddr,
    pub connected_at: Instant,
}

#[derive(Default)]
struct Inner {
    next_id: AtomicU64,
    connections: Mutex<HashMap<ConnectionId, ConnectionInfo>>,
}

/// Cloneable handle to the set of active connections.
#[derive(Clone, Default)]
pub struct ConnectionRegistry {
    inner: Arc<Inner>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a freshly accepted connection.
    pub fn register(&self, peer: SocketAddr) -> Registration {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        let info = ConnectionInfo {
            id,
            peer,
            connected_at: Instant::now(),
        };

        let active = {
            let mut connections = self.inner.connections.lock();
            connections.insert(id, info);
            connections.len()
        };
        debug!("Registered connection {} from {} ({} active)", id, peer, active);

        Registration {
            id,
            registry: self.clone(),
        }
    }

    fn remove(&self, id: ConnectionId) {
        let (removed, active) = {
            let mut connections = self.inner.connections.lock();
            (connections.remove(&id), connections.len())
        };
        if let Some(info) = removed {
            debug!(
                "Removed connection {} from {} after {:?} ({} active)",
                id,
                info.peer,
                info.connected_at.elapsed(),
                active
            );
        }
    }

    pub fn len(&self) -> usize {
        self.inner.connections.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, id: ConnectionId) -> bool {
        self.inner.connections.lock().contains_key(&id)
    }

    /// Copy of the current entries, ordered by id.
    pub fn snapshot(&self) -> Vec<ConnectionInfo> {
        let mut entries: Vec<_> = self.inner.connections.lock().values().cloned().collect();
        entries.sort_by_key(|info| info.id);
        entries
    }
}

/// Keeps a connection registered for as long as it is alive.
pub struct Registration {
    id: ConnectionId,
    registry: ConnectionRegistry,
}

impl Registration {
    pub fn id(&self) -> ConnectionId {
        self.id
    }
}

impl Drop for Registration {
    fn drop(&mut self) {
        self.registry.remove(self.id);
    }
}
