//! Service-discovery plane.
//!
//! Nodes advertise themselves under `/services/{service_name}/{address}`
//! in a shared coordination store, protected by a lease that a keepalive
//! loop refreshes. Other nodes list the prefix at startup and subscribe to
//! add/remove events to keep their peer sets current.
//!
//! The cache core only depends on the [`ServiceRegistry`] trait; the redis
//! adapter is the production implementation and [`MemoryRegistry`] backs
//! tests and embedded clusters.

mod memory;
mod redis;

pub use self::memory::MemoryRegistry;
pub use self::redis::{RedisRegistry, RedisRegistryConfig};

use crate::error::RegistryError;
use async_trait::async_trait;
use tokio::sync::broadcast;

/// Key prefix for a service's registrations.
pub fn service_prefix(service: &str) -> String {
    format!("/services/{service}/")
}

/// Registration key for one node of a service.
pub fn service_key(service: &str, addr: &str) -> String {
    format!("/services/{service}/{addr}")
}

/// Extract the node address from a registration key.
///
/// Returns `None` for keys outside the service's prefix; watchers ignore
/// those.
pub fn parse_addr(service: &str, key: &str) -> Option<String> {
    let prefix = service_prefix(service);
    let addr = key.strip_prefix(&prefix)?;
    if addr.is_empty() {
        None
    } else {
        Some(addr.to_string())
    }
}

/// Membership change kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerEventKind {
    /// A node registered (or refreshed into existence).
    Put,
    /// A node unregistered or its lease expired.
    Delete,
}

/// A membership change observed on the registry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerEvent {
    /// What happened.
    pub kind: PeerEventKind,
    /// Full registration key, `/services/{service}/{address}`.
    pub key: String,
}

/// Contract the cache core requires from a coordination store.
///
/// Consistency expectations are deliberately weak: events eventually
/// reflect reality and are monotone per key within an observation window.
#[async_trait]
pub trait ServiceRegistry: Send + Sync {
    /// Advertise `addr` under the service's prefix, protected by a lease
    /// that this registry instance keeps alive until [`unregister`].
    ///
    /// [`unregister`]: ServiceRegistry::unregister
    async fn register(&self, service: &str, addr: &str) -> Result<(), RegistryError>;

    /// Revoke this instance's registration and stop its keepalive loop.
    async fn unregister(&self) -> Result<(), RegistryError>;

    /// Current addresses registered for the service.
    async fn list(&self, service: &str) -> Result<Vec<String>, RegistryError>;

    /// Subscribe to membership events for the service. Events stop when
    /// the receiver is dropped.
    async fn watch(&self, service: &str)
        -> Result<broadcast::Receiver<PeerEvent>, RegistryError>;
}
