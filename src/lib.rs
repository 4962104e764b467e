//! Meshcache - distributed in-memory key/value cache
//!
//! This library federates a set of peer nodes into a single logical cache:
//! - Size-bounded local LRU stores with eviction callbacks
//! - Single-flight load coalescing against thundering herds
//! - Consistent hashing with virtual nodes and adaptive rebalancing
//! - Registry-driven peer discovery with live membership updates
//! - A peer RPC surface and an external HTTP gateway

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod client;
pub mod config;
pub mod error;
pub mod gateway;
pub mod group;
pub mod metrics;
pub mod peers;
pub mod registry;
pub mod ring;
pub mod rpc;
pub mod singleflight;
pub mod store;
pub mod types;

// Re-export main types
pub use client::ClusterClient;
pub use config::Config;
pub use error::{Error, Result};
pub use group::{CacheGroup, DataSource, FnSource, GroupDirectory, MapSource};
pub use peers::{PeerClient, PeerPicker};
pub use registry::{MemoryRegistry, RedisRegistry, ServiceRegistry};
pub use ring::{HashRing, RingConfig};
pub use singleflight::SingleFlight;
pub use store::LruStore;
pub use types::ByteView;
