//! Named-group directory.
//!
//! One directory owns every cache group in the process. It is constructed
//! explicitly and handed to the RPC adapter, so construction order is
//! visible: registry, then directory and groups, then the server.

use super::{CacheGroup, DataSource};
use crate::{Error, Result};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::info;

/// Owns the `name -> CacheGroup` mapping behind a single lock.
#[derive(Default)]
pub struct GroupDirectory {
    groups: RwLock<HashMap<String, CacheGroup>>,
}

impl GroupDirectory {
    /// Create an empty directory.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create and register a group.
    ///
    /// Re-creating an existing name is rejected with
    /// [`Error::GroupExists`]; in-flight requests on the old group are
    /// never silently orphaned.
    pub fn create_group(
        &self,
        name: &str,
        capacity_bytes: usize,
        source: Arc<dyn DataSource>,
    ) -> Result<CacheGroup> {
        if name.is_empty() {
            return Err(Error::Configuration("empty group name".to_string()));
        }
        let mut groups = self.groups.write();
        if groups.contains_key(name) {
            return Err(Error::GroupExists(name.to_string()));
        }
        let group = CacheGroup::new(name, capacity_bytes, source);
        groups.insert(name.to_string(), group.clone());
        info!(group = name, capacity_bytes, "Cache group created");
        Ok(group)
    }

    /// Look up a group by name.
    pub fn get_group(&self, name: &str) -> Option<CacheGroup> {
        self.groups.read().get(name).cloned()
    }

    /// Names of all registered groups.
    pub fn group_names(&self) -> Vec<String> {
        self.groups.read().keys().cloned().collect()
    }

    /// Number of registered groups.
    pub fn len(&self) -> usize {
        self.groups.read().len()
    }

    /// Whether no groups are registered.
    pub fn is_empty(&self) -> bool {
        self.groups.read().is_empty()
    }

    /// Close every group; used during node shutdown.
    pub fn close_all(&self) {
        for group in self.groups.read().values() {
            group.close();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::group::MapSource;

    fn source() -> Arc<MapSource> {
        Arc::new(MapSource::new([("a", "1")]))
    }

    #[test]
    fn create_and_look_up() {
        let directory = GroupDirectory::new();
        directory.create_group("scores", 1024, source()).unwrap();

        assert!(directory.get_group("scores").is_some());
        assert!(directory.get_group("missing").is_none());
        assert_eq!(directory.len(), 1);
    }

    #[test]
    fn recreation_is_rejected() {
        let directory = GroupDirectory::new();
        directory.create_group("scores", 1024, source()).unwrap();

        let err = directory
            .create_group("scores", 2048, source())
            .expect_err("duplicate must be rejected");
        assert!(matches!(err, Error::GroupExists(name) if name == "scores"));

        // The original group is untouched.
        assert!(directory.get_group("scores").is_some());
    }

    #[test]
    fn empty_name_is_a_configuration_error() {
        let directory = GroupDirectory::new();
        let err = directory.create_group("", 1024, source()).unwrap_err();
        assert!(matches!(err, Error::Configuration(_)));
    }

    #[tokio::test]
    async fn close_all_closes_every_group() {
        let directory = GroupDirectory::new();
        let a = directory.create_group("a", 1024, source()).unwrap();
        let b = directory.create_group("b", 1024, source()).unwrap();

        directory.close_all();
        assert!(a.is_closed());
        assert!(b.is_closed());
    }
}
