//! Consistent-hash ring with virtual nodes and adaptive rebalancing.
//!
//! Each physical node occupies several positions ("virtual nodes") on a
//! ring of 32-bit hash values. A key maps to the node owning the first ring
//! position at or after the key's hash, wrapping at the top. Per-node
//! request counters feed a background balancer that grows cold nodes and
//! shrinks hot ones by adjusting their replica counts.
//!
//! # Concurrency
//!
//! Ring structure is guarded by a read-write lock: lookups take the read
//! side, mutations the write side. Request accounting uses atomics so the
//! lookup path never upgrades its lock. The balancer samples under the read
//! lock and applies changes under a separate write acquisition; readers in
//! between always observe a consistent ring.

use parking_lot::RwLock;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

/// Hash function mapping a key to a ring position.
pub type HashFn = Arc<dyn Fn(&str) -> u32 + Send + Sync>;

/// Minimum sampled requests before the balancer considers acting.
const REBALANCE_MIN_SAMPLE: i64 = 1000;

/// Ring configuration.
#[derive(Clone)]
pub struct RingConfig {
    /// Virtual nodes created per physical node at insertion time.
    pub replicas: usize,
    /// Lower clamp for adaptive replica counts.
    pub min_replicas: usize,
    /// Upper clamp for adaptive replica counts.
    pub max_replicas: usize,
    /// Relative load deviation that triggers a rebalance.
    pub imbalance_threshold: f64,
    /// Hash function for keys and virtual-node labels.
    pub hash_fn: HashFn,
}

impl Default for RingConfig {
    fn default() -> Self {
        Self {
            replicas: 50,
            min_replicas: 10,
            max_replicas: 200,
            imbalance_threshold: 0.25,
            hash_fn: Arc::new(|key| crc32fast::hash(key.as_bytes())),
        }
    }
}

impl fmt::Debug for RingConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RingConfig")
            .field("replicas", &self.replicas)
            .field("min_replicas", &self.min_replicas)
            .field("max_replicas", &self.max_replicas)
            .field("imbalance_threshold", &self.imbalance_threshold)
            .finish()
    }
}

/// Ring structure. Always behind the ring's RwLock.
struct RingState {
    /// Sorted virtual-node positions.
    keys: Vec<u32>,
    /// Position -> physical node.
    hash_to_node: HashMap<u32, String>,
    /// Physical node -> current replica count.
    node_replicas: HashMap<String, usize>,
    /// Physical node -> requests since the last rebalance.
    node_counts: HashMap<String, AtomicI64>,
}

impl RingState {
    fn new() -> Self {
        Self {
            keys: Vec::new(),
            hash_to_node: HashMap::new(),
            node_replicas: HashMap::new(),
            node_counts: HashMap::new(),
        }
    }

    /// Insert `replicas` virtual nodes for `node`. Positions already taken
    /// by any node are skipped; the ring never records a duplicate hash.
    /// The caller re-sorts `keys` afterwards.
    fn add_node(&mut self, node: &str, replicas: usize, hash_fn: &HashFn) {
        for i in 0..replicas {
            let hash = hash_fn(&format!("{node}-{i}"));
            if self.hash_to_node.contains_key(&hash) {
                continue;
            }
            self.keys.push(hash);
            self.hash_to_node.insert(hash, node.to_string());
        }
        self.node_replicas.insert(node.to_string(), replicas);
        self.node_counts
            .entry(node.to_string())
            .or_insert_with(|| AtomicI64::new(0));
    }

    /// Remove every virtual node belonging to `node`. Positions whose
    /// mapping points at a different node (hash collisions at insert time)
    /// are left alone.
    fn remove_virtual_nodes(&mut self, node: &str, replicas: usize, hash_fn: &HashFn) {
        for i in 0..replicas {
            let hash = hash_fn(&format!("{node}-{i}"));
            if self.hash_to_node.get(&hash).map(String::as_str) == Some(node) {
                self.hash_to_node.remove(&hash);
                self.keys.retain(|&h| h != hash);
            }
        }
    }
}

/// A consistent-hash ring over named physical nodes.
///
/// # Example
///
/// ```
/// use meshcache::ring::HashRing;
///
/// let ring = HashRing::with_defaults();
/// ring.add(&["node-a", "node-b"]);
/// let owner = ring.get("some-key").unwrap();
/// assert!(owner == "node-a" || owner == "node-b");
/// ```
pub struct HashRing {
    config: RingConfig,
    state: RwLock<RingState>,
    total_requests: AtomicI64,
}

impl HashRing {
    /// Create a ring with the given configuration.
    pub fn new(config: RingConfig) -> Self {
        Self {
            config,
            state: RwLock::new(RingState::new()),
            total_requests: AtomicI64::new(0),
        }
    }

    /// Create a ring with the default configuration
    /// (50 replicas, clamp [10, 200], CRC32-IEEE, 25% threshold).
    pub fn with_defaults() -> Self {
        Self::new(RingConfig::default())
    }

    /// Add physical nodes to the ring, each with the configured default
    /// replica count. Empty names and names already present are skipped.
    ///
    /// Returns `false` when `nodes` is empty.
    pub fn add<S: AsRef<str>>(&self, nodes: &[S]) -> bool {
        if nodes.is_empty() {
            return false;
        }
        let mut state = self.state.write();
        for node in nodes {
            let node = node.as_ref();
            if node.is_empty() || state.node_replicas.contains_key(node) {
                continue;
            }
            state.add_node(node, self.config.replicas, &self.config.hash_fn);
        }
        state.keys.sort_unstable();
        true
    }

    /// Remove a physical node and all its virtual nodes.
    ///
    /// Returns `true` iff the node was present.
    pub fn remove(&self, node: &str) -> bool {
        if node.is_empty() {
            return false;
        }
        let mut state = self.state.write();
        let Some(replicas) = state.node_replicas.get(node).copied() else {
            return false;
        };
        state.remove_virtual_nodes(node, replicas, &self.config.hash_fn);
        state.node_replicas.remove(node);
        state.node_counts.remove(node);
        true
    }

    /// Map a key to its owning node.
    ///
    /// Returns `None` for an empty key or an empty ring. A successful
    /// lookup increments the owning node's request counter and the total.
    pub fn get(&self, key: &str) -> Option<String> {
        if key.is_empty() {
            return None;
        }
        let state = self.state.read();
        if state.keys.is_empty() {
            return None;
        }

        let hash = (self.config.hash_fn)(key);
        // First position >= hash, wrapping to the ring start.
        let idx = state.keys.partition_point(|&h| h < hash);
        let position = state.keys[if idx == state.keys.len() { 0 } else { idx }];
        let node = state.hash_to_node[&position].clone();

        if let Some(count) = state.node_counts.get(&node) {
            count.fetch_add(1, Ordering::Relaxed);
        }
        self.total_requests.fetch_add(1, Ordering::Relaxed);
        Some(node)
    }

    /// Per-node share of the requests observed since the last rebalance.
    ///
    /// Nodes with no activity are omitted; the result is empty when no
    /// requests were observed. Counters reset on rebalance, so this is a
    /// sample over the current interval, not an all-time total.
    pub fn stats(&self) -> HashMap<String, f64> {
        let state = self.state.read();
        let total = self.total_requests.load(Ordering::Relaxed);
        let mut shares = HashMap::new();
        if total == 0 {
            return shares;
        }
        for (node, count) in &state.node_counts {
            let count = count.load(Ordering::Relaxed);
            if count > 0 {
                shares.insert(node.clone(), count as f64 / total as f64);
            }
        }
        shares
    }

    /// Number of physical nodes currently on the ring.
    pub fn node_count(&self) -> usize {
        self.state.read().node_replicas.len()
    }

    /// Whether the ring holds no nodes.
    pub fn is_empty(&self) -> bool {
        self.node_count() == 0
    }

    /// Sample current load and rebalance when the worst relative deviation
    /// exceeds the configured threshold. Requires at least
    /// `REBALANCE_MIN_SAMPLE` observed requests.
    ///
    /// This is the balancer's loop body; it is public so callers and tests
    /// can drive it without waiting on the background cadence.
    pub fn check_and_rebalance(&self) {
        if self.total_requests.load(Ordering::Relaxed) < REBALANCE_MIN_SAMPLE {
            return;
        }

        let max_deviation = {
            let state = self.state.read();
            if state.node_replicas.is_empty() {
                return;
            }
            let total = self.total_requests.load(Ordering::Relaxed);
            let avg = total as f64 / state.node_replicas.len() as f64;
            let mut max_deviation: f64 = 0.0;
            for count in state.node_counts.values() {
                let count = count.load(Ordering::Relaxed) as f64;
                if avg > 0.0 {
                    max_deviation = max_deviation.max((count - avg).abs() / avg);
                } else if count > 0.0 {
                    max_deviation = 1.0;
                }
            }
            max_deviation
        };

        if max_deviation > self.config.imbalance_threshold {
            self.rebalance();
        }
    }

    /// Recompute replica counts from the observed load distribution.
    ///
    /// Hot nodes (load above average) shrink to `round(old / ratio)`; cold
    /// nodes grow to `round(old * (2 - ratio))`; both clamped to the
    /// configured range. Counters reset afterwards.
    pub fn rebalance(&self) {
        let mut state = self.state.write();
        if state.node_replicas.is_empty() {
            return;
        }

        let total = self.total_requests.load(Ordering::Relaxed);
        let avg = total as f64 / state.node_replicas.len() as f64;

        let snapshot: Vec<(String, usize, i64)> = state
            .node_counts
            .iter()
            .map(|(node, count)| {
                let replicas = state.node_replicas.get(node).copied().unwrap_or(0);
                (node.clone(), replicas, count.load(Ordering::Relaxed))
            })
            .collect();

        for (node, old_replicas, count) in snapshot {
            let ratio = if avg > 0.0 {
                count as f64 / avg
            } else if count > 0 {
                2.0
            } else {
                1.0
            };

            let new_replicas = if ratio > 1.0 {
                (old_replicas as f64 / ratio).round() as usize
            } else {
                (old_replicas as f64 * (2.0 - ratio)).round() as usize
            };
            let new_replicas = new_replicas.clamp(self.config.min_replicas, self.config.max_replicas);

            if new_replicas != old_replicas {
                state.remove_virtual_nodes(&node, old_replicas, &self.config.hash_fn);
                state.node_replicas.remove(&node);
                state.add_node(&node, new_replicas, &self.config.hash_fn);
                tracing::debug!(
                    node = %node,
                    old = old_replicas,
                    new = new_replicas,
                    "Adjusted virtual node count"
                );
            }
        }

        for count in state.node_counts.values() {
            count.store(0, Ordering::Relaxed);
        }
        self.total_requests.store(0, Ordering::Relaxed);
        state.keys.sort_unstable();
        crate::metrics::RING_REBALANCES.inc();
    }

    /// Spawn the 1 Hz background balancer for this ring.
    ///
    /// The returned handle stops and joins the task; see
    /// [`BalancerHandle::shutdown`].
    pub fn start_balancer(self: Arc<Self>) -> BalancerHandle {
        let (stop_tx, mut stop_rx) = broadcast::channel::<()>(1);
        let ring = self;
        let task = tokio::spawn(async move {
            let mut tick = tokio::time::interval(Duration::from_secs(1));
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = tick.tick() => ring.check_and_rebalance(),
                    _ = stop_rx.recv() => break,
                }
            }
            tracing::debug!("Ring balancer stopped");
        });
        BalancerHandle {
            stop: stop_tx,
            task: Some(task),
        }
    }
}

/// Handle for a running ring balancer.
pub struct BalancerHandle {
    stop: broadcast::Sender<()>,
    task: Option<JoinHandle<()>>,
}

impl BalancerHandle {
    /// Signal the balancer to stop and wait for it to finish.
    pub async fn shutdown(mut self) {
        let _ = self.stop.send(());
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }
}

impl Drop for BalancerHandle {
    fn drop(&mut self) {
        if let Some(task) = &self.task {
            task.abort();
        }
    }
}
