//! Membership-driven peer selection.
//!
//! The picker mirrors the registry's view of the service into a consistent
//! hash ring of peer addresses plus a map of connected clients. A lookup
//! maps a key to its ring owner; the local node is excluded so callers fall
//! through to their own store or data source.

use crate::error::{Error, Result};
use crate::registry::{parse_addr, PeerEvent, PeerEventKind, ServiceRegistry};
use crate::ring::{BalancerHandle, HashRing, RingConfig};
use crate::peers::PeerClient;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

struct PickerState {
    peers: HashMap<String, Arc<PeerClient>>,
}

/// Selects the peer owning a key, tracking live membership.
///
/// The ring holds every known member of the service, this node included,
/// so a key can be owned locally; the client map holds only remote peers.
/// Peer clients are shared: a client handed out by [`pick_peer`] stays
/// valid even if the peer is removed from the ring while the call is in
/// flight.
///
/// [`pick_peer`]: PeerPicker::pick_peer
pub struct PeerPicker {
    self_addr: String,
    service_name: String,
    ring: Arc<HashRing>,
    state: RwLock<PickerState>,
    stop: broadcast::Sender<()>,
    watch_task: Mutex<Option<JoinHandle<()>>>,
    balancer: Mutex<Option<BalancerHandle>>,
}

impl PeerPicker {
    /// Build a picker for `self_addr`, synchronously listing current peers
    /// and then following membership events in the background.
    ///
    /// Registry bootstrap failure is fatal and surfaces here.
    pub async fn new(
        self_addr: &str,
        service_name: &str,
        registry: Arc<dyn ServiceRegistry>,
        ring_config: RingConfig,
    ) -> Result<Arc<Self>> {
        let (stop, stop_rx) = broadcast::channel::<()>(1);
        let picker = Arc::new(Self {
            self_addr: self_addr.to_string(),
            service_name: service_name.to_string(),
            ring: Arc::new(HashRing::new(ring_config)),
            state: RwLock::new(PickerState {
                peers: HashMap::new(),
            }),
            stop,
            watch_task: Mutex::new(None),
            balancer: Mutex::new(None),
        });

        // This node owns its own partition.
        picker.ring.add(&[self_addr]);

        // Initial membership, before any lookup can happen.
        let addrs = registry.list(service_name).await.map_err(Error::Registry)?;
        for addr in addrs {
            if addr != picker.self_addr {
                picker.add_peer(&addr).await;
            }
        }

        let events = registry.watch(service_name).await.map_err(Error::Registry)?;
        let task = tokio::spawn(Self::watch_loop(picker.clone(), events, stop_rx));
        *picker.watch_task.lock() = Some(task);
        *picker.balancer.lock() = Some(picker.ring.clone().start_balancer());

        info!(
            self_addr = %picker.self_addr,
            service = %picker.service_name,
            peers = picker.peer_count(),
            "Peer picker started"
        );
        Ok(picker)
    }

    /// The peer owning `key`, or `None` when the owner is this node or the
    /// ring is empty.
    pub fn pick_peer(&self, key: &str) -> Option<Arc<PeerClient>> {
        let state = self.state.read();
        let owner = self.ring.get(key)?;
        if owner == self.self_addr {
            debug!(key, "Key owned locally");
            return None;
        }
        state.peers.get(&owner).cloned()
    }

    /// The raw ring owner for `key`, which may be this node.
    pub fn owner(&self, key: &str) -> Option<String> {
        let _state = self.state.read();
        self.ring.get(key)
    }

    /// Snapshot of all connected remote peers (self excluded).
    pub fn all_peers(&self) -> Vec<Arc<PeerClient>> {
        self.state.read().peers.values().cloned().collect()
    }

    /// Number of connected remote peers.
    pub fn peer_count(&self) -> usize {
        self.state.read().peers.len()
    }

    /// This node's advertised address.
    pub fn self_addr(&self) -> &str {
        &self.self_addr
    }

    /// Load share observed per peer address since the last rebalance.
    pub fn ring_stats(&self) -> HashMap<String, f64> {
        self.ring.stats()
    }

    async fn add_peer(&self, addr: &str) {
        if self.state.read().peers.contains_key(addr) {
            return;
        }
        // Connect outside the lock; construction probes the remote.
        match PeerClient::connect(addr).await {
            Ok(client) => {
                let mut state = self.state.write();
                self.ring.add(&[addr]);
                state.peers.insert(addr.to_string(), Arc::new(client));
                crate::metrics::PEER_COUNT
                    .with_label_values(&[self.service_name.as_str()])
                    .set(state.peers.len() as f64);
                debug!(peer = %addr, "Peer added");
            }
            Err(e) => {
                warn!(peer = %addr, error = %e, "Skipping unreachable peer");
            }
        }
    }

    fn remove_peer(&self, addr: &str) {
        let mut state = self.state.write();
        self.ring.remove(addr);
        if state.peers.remove(addr).is_some() {
            crate::metrics::PEER_COUNT
                .with_label_values(&[self.service_name.as_str()])
                .set(state.peers.len() as f64);
            debug!(peer = %addr, "Peer removed");
        }
    }

    async fn watch_loop(
        picker: Arc<Self>,
        mut events: broadcast::Receiver<PeerEvent>,
        mut stop: broadcast::Receiver<()>,
    ) {
        loop {
            tokio::select! {
                _ = stop.recv() => break,
                event = events.recv() => match event {
                    Ok(event) => picker.apply_event(event).await,
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        warn!(missed, "Membership events lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },
            }
        }
        debug!("Membership watch stopped");
    }

    async fn apply_event(&self, event: PeerEvent) {
        let Some(addr) = parse_addr(&self.service_name, &event.key) else {
            return;
        };
        if addr == self.self_addr {
            return;
        }
        match event.kind {
            PeerEventKind::Put => self.add_peer(&addr).await,
            PeerEventKind::Delete => self.remove_peer(&addr),
        }
    }

    /// Stop the watch subscriber and the ring balancer, joining both.
    pub async fn shutdown(&self) {
        let _ = self.stop.send(());
        let task = self.watch_task.lock().take();
        if let Some(task) = task {
            let _ = task.await;
        }
        let balancer = self.balancer.lock().take();
        if let Some(balancer) = balancer {
            balancer.shutdown().await;
        }
    }
}

impl Drop for PeerPicker {
    fn drop(&mut self) {
        if let Some(task) = self.watch_task.lock().take() {
            task.abort();
        }
    }
}
