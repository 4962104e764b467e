//! Local storage for cache groups.

mod lru;

pub use lru::{EvictionCallback, LruStore};
