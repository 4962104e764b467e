//! Named cache groups.
//!
//! A [`CacheGroup`] is one named partition of the federated cache. It owns
//! a local [`LruStore`], coalesces loads through a [`SingleFlight`], pulls
//! missing values from the owning peer or the configured [`DataSource`],
//! and propagates writes across the cluster.
//!
//! [`SingleFlight`]: crate::SingleFlight
//! [`LruStore`]: crate::LruStore

mod directory;
mod group;

pub use directory::GroupDirectory;
pub use group::{CacheGroup, GroupStatsSnapshot, SyncOp};

use crate::types::ByteView;
use async_trait::async_trait;
use std::collections::HashMap;

/// Produces a value for a key when no cached copy exists cluster-wide.
#[async_trait]
pub trait DataSource: Send + Sync {
    /// Load the authoritative value for `key`, or absent when the source
    /// has none.
    async fn load(&self, key: &str) -> Option<ByteView>;
}

/// Adapter turning a plain closure into a [`DataSource`].
pub struct FnSource<F>(
    /// The wrapped loader closure.
    pub F,
);

#[async_trait]
impl<F> DataSource for FnSource<F>
where
    F: Fn(&str) -> Option<ByteView> + Send + Sync,
{
    async fn load(&self, key: &str) -> Option<ByteView> {
        (self.0)(key)
    }
}

/// A fixed in-memory data source, used by the demo node and tests.
pub struct MapSource {
    entries: HashMap<String, ByteView>,
}

impl MapSource {
    /// Build a source from `(key, value)` pairs.
    pub fn new<K, V, I>(entries: I) -> Self
    where
        K: Into<String>,
        V: Into<ByteView>,
        I: IntoIterator<Item = (K, V)>,
    {
        Self {
            entries: entries
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        }
    }
}

#[async_trait]
impl DataSource for MapSource {
    async fn load(&self, key: &str) -> Option<ByteView> {
        self.entries.get(key).cloned()
    }
}
