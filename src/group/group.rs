//! The cache group: local store, loader, and cross-peer propagation.

use super::DataSource;
use crate::metrics;
use crate::peers::PeerPicker;
use crate::singleflight::SingleFlight;
use crate::store::LruStore;
use crate::types::ByteView;
use crate::{Error, Result};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, OnceLock};
use tracing::{debug, warn};

/// A cross-peer propagation operation.
#[derive(Debug, Clone)]
pub enum SyncOp {
    /// Write the value to the ring owner, invalidate everywhere else.
    Set(ByteView),
    /// Remove the key on every peer.
    Delete,
    /// Drop cached copies on every peer other than this node.
    Invalidate,
}

#[derive(Default)]
struct GroupStats {
    local_hits: AtomicI64,
    local_misses: AtomicI64,
    peer_hits: AtomicI64,
    peer_misses: AtomicI64,
    loads: AtomicI64,
    load_errors: AtomicI64,
}

/// Point-in-time view of a group's counters.
#[derive(Debug, Clone, Serialize)]
pub struct GroupStatsSnapshot {
    /// Values served from the local store or loaded from the data source.
    pub local_hits: i64,
    /// Local store misses.
    pub local_misses: i64,
    /// Values fetched from the owning peer.
    pub peer_hits: i64,
    /// Peer fetches that came back empty or failed.
    pub peer_misses: i64,
    /// Loader executions (one per coalesced burst).
    pub loads: i64,
    /// Loader executions that produced no value.
    pub load_errors: i64,
}

struct GroupInner {
    name: String,
    store: LruStore,
    loader: SingleFlight<Option<ByteView>>,
    source: Arc<dyn DataSource>,
    peers: OnceLock<Arc<PeerPicker>>,
    closed: AtomicBool,
    stats: GroupStats,
}

/// A named, size-bounded cache partition federated across the cluster.
///
/// Cloning is cheap and shares the underlying group.
///
/// # Example
///
/// ```
/// use meshcache::{ByteView, CacheGroup, MapSource};
/// use std::sync::Arc;
///
/// # async fn example() {
/// let group = CacheGroup::new(
///     "scores",
///     1 << 20,
///     Arc::new(MapSource::new([("Tom", "400")])),
/// );
/// assert_eq!(group.get("Tom").await, Some(ByteView::from("400")));
/// # }
/// ```
#[derive(Clone)]
pub struct CacheGroup {
    inner: Arc<GroupInner>,
}

impl CacheGroup {
    /// Create a group with the given byte capacity and data source.
    ///
    /// `capacity_bytes == 0` disables the local store's size limit.
    pub fn new(name: &str, capacity_bytes: usize, source: Arc<dyn DataSource>) -> Self {
        let group_label = name.to_string();
        let store = LruStore::new(
            capacity_bytes,
            Some(Box::new(move |key, _value| {
                metrics::CACHE_EVICTIONS
                    .with_label_values(&[group_label.as_str()])
                    .inc();
                debug!(group = %group_label, key, "Entry evicted");
            })),
        );
        Self {
            inner: Arc::new(GroupInner {
                name: name.to_string(),
                store,
                loader: SingleFlight::new(),
                source,
                peers: OnceLock::new(),
                closed: AtomicBool::new(false),
                stats: GroupStats::default(),
            }),
        }
    }

    /// The group's name.
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Attach the peer picker. One-shot: a second registration is a
    /// programming error and fails visibly.
    pub fn register_peer_picker(&self, picker: Arc<PeerPicker>) -> Result<()> {
        self.inner
            .peers
            .set(picker)
            .map_err(|_| Error::PeerPickerAlreadyRegistered(self.inner.name.clone()))
    }

    /// Mark the group closed; every subsequent operation returns a failure
    /// result.
    pub fn close(&self) {
        self.inner.closed.store(true, Ordering::SeqCst);
    }

    /// Whether the group has been closed.
    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    fn reject(&self, key: &str, op: &str) -> bool {
        if self.is_closed() {
            warn!(group = %self.inner.name, op, "Operation on closed group");
            return true;
        }
        if key.is_empty() {
            warn!(group = %self.inner.name, op, "Empty key rejected");
            return true;
        }
        false
    }

    /// Fetch a value: local store first, then the owning peer, then the
    /// data source. Absent keys, closed groups, and empty keys all yield
    /// `None`.
    pub async fn get(&self, key: &str) -> Option<ByteView> {
        if self.reject(key, "get") {
            return None;
        }

        if let Some(value) = self.inner.store.get(key) {
            self.inner.stats.local_hits.fetch_add(1, Ordering::Relaxed);
            metrics::CACHE_LOOKUPS
                .with_label_values(&[self.inner.name.as_str(), "hit"])
                .inc();
            return Some(value);
        }
        self.inner.stats.local_misses.fetch_add(1, Ordering::Relaxed);
        metrics::CACHE_LOOKUPS
            .with_label_values(&[self.inner.name.as_str(), "miss"])
            .inc();

        self.load(key).await
    }

    /// Store a value locally, then propagate unless it arrived from a
    /// peer. Returns `false` for closed groups and empty keys.
    pub async fn set(&self, key: &str, value: ByteView, from_peer: bool) -> bool {
        if self.reject(key, "set") {
            return false;
        }

        // Local state is updated before propagation starts.
        self.inner.store.set(key, value.clone());
        metrics::STORE_BYTES
            .with_label_values(&[self.inner.name.as_str()])
            .set(self.inner.store.bytes_used() as f64);
        debug!(group = %self.inner.name, key, from_peer, "Value set");

        if !from_peer && self.inner.peers.get().is_some() {
            self.sync_to_peers(key, SyncOp::Set(value)).await;
        }
        true
    }

    /// Delete a key locally, then propagate unless it arrived from a peer.
    pub async fn delete(&self, key: &str, from_peer: bool) -> bool {
        if self.reject(key, "delete") {
            return false;
        }

        self.inner.store.delete(key);
        debug!(group = %self.inner.name, key, from_peer, "Key deleted");

        if !from_peer && self.inner.peers.get().is_some() {
            self.sync_to_peers(key, SyncOp::Delete).await;
        }
        true
    }

    /// Actively invalidate: drop the local copy and tell every peer to
    /// drop theirs.
    pub async fn invalidate(&self, key: &str) -> bool {
        if self.reject(key, "invalidate") {
            return false;
        }

        self.inner.store.delete(key);
        if self.inner.peers.get().is_some() {
            self.sync_to_peers(key, SyncOp::Invalidate).await;
        }
        true
    }

    /// Receiver side of a peer-originated invalidation: drop the local
    /// copy only. Never propagates.
    pub fn invalidate_from_peer(&self, key: &str) -> bool {
        if self.reject(key, "invalidate_from_peer") {
            return false;
        }
        self.inner.store.delete(key);
        debug!(group = %self.inner.name, key, "Invalidated from peer");
        true
    }

    /// Coalesced load for a missing key.
    async fn load(&self, key: &str) -> Option<ByteView> {
        let inner = Arc::clone(&self.inner);
        let owned_key = key.to_string();
        let result = self
            .inner
            .loader
            .run(key, move || async move {
                inner.stats.loads.fetch_add(1, Ordering::Relaxed);
                let value = inner.load_value(&owned_key).await;
                let outcome = if value.is_some() { "value" } else { "absent" };
                metrics::CACHE_LOADS
                    .with_label_values(&[inner.name.as_str(), outcome])
                    .inc();
                if value.is_none() {
                    inner.stats.load_errors.fetch_add(1, Ordering::Relaxed);
                }
                value
            })
            .await;

        if let Some(value) = &result {
            self.inner.store.set(key, value.clone());
        }
        result
    }

    /// Apply the cross-peer protocol for one local write.
    ///
    /// Individual peer failures are logged; the aggregate never aborts and
    /// never rolls back. This node's state stays authoritative for its own
    /// partition. No-op until a peer picker is registered.
    pub async fn sync_to_peers(&self, key: &str, op: SyncOp) {
        let Some(picker) = self.inner.peers.get() else {
            return;
        };
        let group = self.inner.name.as_str();

        match op {
            SyncOp::Set(value) => {
                // The ring owner gets the authoritative copy; everyone
                // else must not keep a stale one.
                let owner = picker.pick_peer(key);
                if let Some(owner_peer) = &owner {
                    if !owner_peer.set(group, key, value).await {
                        warn!(
                            group,
                            key,
                            owner = owner_peer.addr(),
                            "Owner write failed during propagation"
                        );
                    }
                }
                let owner_addr = owner.as_ref().map(|p| p.addr().to_string());
                let others: Vec<_> = picker
                    .all_peers()
                    .into_iter()
                    .filter(|p| Some(p.addr()) != owner_addr.as_deref())
                    .collect();
                futures::future::join_all(others.iter().map(|peer| async move {
                    if !peer.invalidate(group, key).await {
                        warn!(group, key, peer = peer.addr(), "Invalidate failed");
                    }
                }))
                .await;
            }
            SyncOp::Delete => {
                let peers = picker.all_peers();
                futures::future::join_all(peers.iter().map(|peer| async move {
                    if !peer.delete(group, key).await {
                        warn!(group, key, peer = peer.addr(), "Delete broadcast failed");
                    }
                }))
                .await;
            }
            SyncOp::Invalidate => {
                let peers = picker.all_peers();
                futures::future::join_all(peers.iter().map(|peer| async move {
                    if !peer.invalidate(group, key).await {
                        warn!(group, key, peer = peer.addr(), "Invalidate broadcast failed");
                    }
                }))
                .await;
            }
        }
    }

    /// Read the local store without loading, promoting, or counting.
    pub fn peek_local(&self, key: &str) -> Option<ByteView> {
        self.inner.store.peek(key)
    }

    /// Bytes held by the local store.
    pub fn bytes_used(&self) -> usize {
        self.inner.store.bytes_used()
    }

    /// Snapshot of the group's counters.
    pub fn stats(&self) -> GroupStatsSnapshot {
        let stats = &self.inner.stats;
        GroupStatsSnapshot {
            local_hits: stats.local_hits.load(Ordering::Relaxed),
            local_misses: stats.local_misses.load(Ordering::Relaxed),
            peer_hits: stats.peer_hits.load(Ordering::Relaxed),
            peer_misses: stats.peer_misses.load(Ordering::Relaxed),
            loads: stats.loads.load(Ordering::Relaxed),
            load_errors: stats.load_errors.load(Ordering::Relaxed),
        }
    }
}

impl GroupInner {
    /// Loader body: owning peer first, data source as the fallback.
    async fn load_value(&self, key: &str) -> Option<ByteView> {
        if let Some(picker) = self.peers.get() {
            if let Some(peer) = picker.pick_peer(key) {
                debug!(group = %self.name, key, peer = peer.addr(), "Loading from peer");
                match peer.get(&self.name, key).await {
                    Some(value) => {
                        self.stats.peer_hits.fetch_add(1, Ordering::Relaxed);
                        return Some(value);
                    }
                    None => {
                        self.stats.peer_misses.fetch_add(1, Ordering::Relaxed);
                    }
                }
            }
        }

        debug!(group = %self.name, key, "Loading from data source");
        let value = self.source.load(key).await;
        if value.is_some() {
            self.stats.local_hits.fetch_add(1, Ordering::Relaxed);
        }
        value
    }
}

impl std::fmt::Debug for CacheGroup {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheGroup")
            .field("name", &self.inner.name)
            .field("closed", &self.is_closed())
            .finish()
    }
}
