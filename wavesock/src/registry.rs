//! Connection registry
//!
//! Synchronized map of live connections, keyed by connection id. A
//! connection belongs to exactly one registry between reader-task start
//! and end; the entry is released by a drop guard so even a panicking
//! handler cannot leak it.

use crate::connection::Connection;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

#[derive(Clone, Default)]
pub(crate) struct ConnectionRegistry {
    inner: Arc<Mutex<HashMap<u64, Connection>>>,
}

impl std::fmt::Debug for ConnectionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionRegistry")
            .field("len", &self.len())
            .finish()
    }
}

impl ConnectionRegistry {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<u64, Connection>> {
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Enter `conn` into the registry until the returned guard drops
    pub(crate) fn register(&self, conn: &Connection) -> RegistryGuard {
        self.lock().insert(conn.id(), conn.clone());
        RegistryGuard {
            registry: self.clone(),
            id: conn.id(),
        }
    }

    /// Snapshot of the registered connections
    pub(crate) fn list(&self) -> Vec<Connection> {
        self.lock().values().cloned().collect()
    }

    pub(crate) fn len(&self) -> usize {
        self.lock().len()
    }
}

/// Removes the registered connection when dropped
pub(crate) struct RegistryGuard {
    registry: ConnectionRegistry,
    id: u64,
}

impl Drop for RegistryGuard {
    fn drop(&mut self) {
        self.registry.lock().remove(&self.id);
    }
}
