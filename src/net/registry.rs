use std::sync::Arc;

use ahash::AHashMap;
use parking_lot::Mutex;
use tracing::debug;

use crate::config::ConnectionConfig;
use crate::error::{SyncError, SyncResult};
use crate::net::manager::ConnectionManager;
use crate::net::transport::Transport;

#[derive(Debug, Default)]
struct RegistryInner {
    managers: AHashMap<String, Arc<ConnectionManager>>,
    closed: bool,
}

/// Caller-owned set of named connections sharing one transport and config.
pub struct ConnectionRegistry {
    transport: Arc<dyn Transport>,
    config: ConnectionConfig,
    inner: Mutex<RegistryInner>,
}

impl ConnectionRegistry {
    pub fn new(transport: Arc<dyn Transport>, config: ConnectionConfig) -> Self {
        Self { transport, config, inner: Mutex::new(RegistryInner::default()) }
    }

    /// The manager registered under `name`, created on first use.
    pub fn get_or_create(&self, name: &str) -> SyncResult<Arc<ConnectionManager>> {
        let mut inner = self.inner.lock();
        if inner.closed {
            return Err(SyncError::Closed);
        }
        let manager = inner
            .managers
            .entry(name.to_string())
            .or_insert_with(|| {
                debug!(connection = name, "registering connection");
                Arc::new(ConnectionManager::new(name, self.transport.clone(), self.config.clone()))
            })
            .clone();
        Ok(manager)
    }

    pub fn get(&self, name: &str) -> Option<Arc<ConnectionManager>> {
        self.inner.lock().managers.get(name).cloned()
    }

    /// Destroy and forget the connection under `name`.
    pub fn remove(&self, name: &str) -> bool {
        let removed = self.inner.lock().managers.remove(name);
        match removed {
            Some(manager) => {
                manager.destroy();
                true
            }
            None => false,
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().managers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Destroy every connection and refuse new ones.
    pub fn shutdown(&self) {
        let managers: Vec<_> = {
            let mut inner = self.inner.lock();
            inner.closed = true;
            inner.managers.drain().map(|(_, m)| m).collect()
        };
        for manager in managers {
            manager.destroy();
        }
    }
}
