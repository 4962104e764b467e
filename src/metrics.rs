//! Prometheus metrics for cache monitoring.

use lazy_static::lazy_static;
use prometheus::{
    register_counter_vec, register_gauge_vec, register_histogram_vec, register_int_counter,
    CounterVec, Encoder, GaugeVec, HistogramVec, IntCounter, TextEncoder,
};

lazy_static! {
    // === Cache counters ===

    /// Local cache lookups by group and outcome (hit/miss)
    pub static ref CACHE_LOOKUPS: CounterVec = register_counter_vec!(
        "meshcache_lookups_total",
        "Local cache lookups",
        &["group", "outcome"]
    )
    .unwrap();

    /// Entries evicted from local stores
    pub static ref CACHE_EVICTIONS: CounterVec = register_counter_vec!(
        "meshcache_evictions_total",
        "Entries evicted from the local store",
        &["group"]
    )
    .unwrap();

    /// Loader executions by group and outcome (value/absent)
    pub static ref CACHE_LOADS: CounterVec = register_counter_vec!(
        "meshcache_loads_total",
        "Data loads after a local miss",
        &["group", "outcome"]
    )
    .unwrap();

    // === Peer RPC ===

    /// Peer calls by operation and outcome (ok/failed)
    pub static ref PEER_CALLS: CounterVec = register_counter_vec!(
        "meshcache_peer_calls_total",
        "Peer RPC calls",
        &["op", "outcome"]
    )
    .unwrap();

    /// Peer call latency
    pub static ref PEER_CALL_DURATION: HistogramVec = register_histogram_vec!(
        "meshcache_peer_call_seconds",
        "Peer RPC latency in seconds",
        &["op"],
        vec![0.001, 0.005, 0.025, 0.1, 0.5, 1.0, 3.0]
    )
    .unwrap();

    // === Ring ===

    /// Rebalance passes executed
    pub static ref RING_REBALANCES: IntCounter = register_int_counter!(
        "meshcache_ring_rebalances_total",
        "Adaptive rebalance passes"
    )
    .unwrap();

    /// Known remote peers
    pub static ref PEER_COUNT: GaugeVec = register_gauge_vec!(
        "meshcache_peers",
        "Connected remote peers",
        &["service"]
    )
    .unwrap();

    // === Store gauges ===

    /// Bytes held by local stores
    pub static ref STORE_BYTES: GaugeVec = register_gauge_vec!(
        "meshcache_store_bytes",
        "Bytes held by the local store",
        &["group"]
    )
    .unwrap();
}

/// Render all registered metrics in the Prometheus text format.
pub fn gather() -> String {
    let encoder = TextEncoder::new();
    let families = prometheus::gather();
    let mut buf = Vec::new();
    if let Err(e) = encoder.encode(&families, &mut buf) {
        tracing::error!(error = %e, "Failed to encode metrics");
        return String::new();
    }
    String::from_utf8(buf).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_register_and_render() {
        CACHE_LOOKUPS.with_label_values(&["test", "hit"]).inc();
        CACHE_EVICTIONS.with_label_values(&["test"]).inc();
        let text = gather();
        assert!(text.contains("meshcache_lookups_total"));
        assert!(text.contains("meshcache_evictions_total"));
    }
}
