//! In-process registry for tests and embedded clusters.

use super::{parse_addr, service_key, service_prefix, PeerEvent, PeerEventKind, ServiceRegistry};
use crate::error::RegistryError;
use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::broadcast;

const EVENT_BUFFER: usize = 256;

struct MemoryStore {
    entries: RwLock<HashMap<String, String>>,
    events: broadcast::Sender<PeerEvent>,
}

/// A registry backed by a shared in-memory map.
///
/// Clones share the same store, so several nodes in one process can
/// discover each other through it; each clone tracks its own registration
/// for [`unregister`].
///
/// There are no leases: an entry lives until its owner unregisters.
///
/// [`unregister`]: ServiceRegistry::unregister
#[derive(Clone)]
pub struct MemoryRegistry {
    store: Arc<MemoryStore>,
    own_key: Arc<Mutex<Option<String>>>,
}

impl MemoryRegistry {
    /// Create an empty shared store.
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_BUFFER);
        Self {
            store: Arc::new(MemoryStore {
                entries: RwLock::new(HashMap::new()),
                events,
            }),
            own_key: Arc::new(Mutex::new(None)),
        }
    }

    /// A new handle on the same store with its own registration slot.
    pub fn handle(&self) -> Self {
        Self {
            store: self.store.clone(),
            own_key: Arc::new(Mutex::new(None)),
        }
    }
}

impl Default for MemoryRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ServiceRegistry for MemoryRegistry {
    async fn register(&self, service: &str, addr: &str) -> Result<(), RegistryError> {
        if addr.is_empty() {
            return Err(RegistryError::Registration("empty address".to_string()));
        }
        let key = service_key(service, addr);
        self.store
            .entries
            .write()
            .insert(key.clone(), addr.to_string());
        *self.own_key.lock() = Some(key.clone());
        let _ = self.store.events.send(PeerEvent {
            kind: PeerEventKind::Put,
            key,
        });
        Ok(())
    }

    async fn unregister(&self) -> Result<(), RegistryError> {
        let Some(key) = self.own_key.lock().take() else {
            return Ok(());
        };
        self.store.entries.write().remove(&key);
        let _ = self.store.events.send(PeerEvent {
            kind: PeerEventKind::Delete,
            key,
        });
        Ok(())
    }

    async fn list(&self, service: &str) -> Result<Vec<String>, RegistryError> {
        let prefix = service_prefix(service);
        let entries = self.store.entries.read();
        Ok(entries
            .keys()
            .filter(|k| k.starts_with(&prefix))
            .filter_map(|k| parse_addr(service, k))
            .collect())
    }

    async fn watch(
        &self,
        _service: &str,
    ) -> Result<broadcast::Receiver<PeerEvent>, RegistryError> {
        // Watchers filter by prefix themselves, so one event stream serves
        // every service on the store.
        Ok(self.store.events.subscribe())
    }
}
