//! Coordination store abstraction
//!
//! The registry consumes an external key-value store with hierarchical keys,
//! TTL-bound entries, atomic create-if-absent and a blocking watch on a key
//! prefix. [`EtcdStore`] talks to an etcd v2 cluster; [`MemoryStore`] keeps
//! the same semantics in-process.

pub mod etcd;
pub mod memory;

pub use etcd::EtcdStore;
pub use memory::MemoryStore;

use crate::common::Result;
use async_trait::async_trait;
use std::time::Duration;

/// A leaf entry in the store
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreNode {
    pub key: String,
    pub value: String,
    pub modified_index: u64,
}

/// Result of a recursive listing
#[derive(Debug, Clone, Default)]
pub struct Listing {
    pub nodes: Vec<StoreNode>,
    /// Store index at the time of the listing. Watching from `index + 1`
    /// delivers exactly the changes made after the listing.
    pub index: u64,
}

/// A single change notification
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeEvent {
    /// Raw store action (`set`, `create`, `delete`, `expire`, ...)
    pub action: String,
    pub node: StoreNode,
    /// Index of this change
    pub index: u64,
}

/// Operations the registry needs from the coordination store
#[async_trait]
pub trait CoordinationStore: Send + Sync {
    /// All leaf nodes under `prefix`, recursively
    async fn list(&self, prefix: &str) -> Result<Listing>;

    /// Block until the first change under `prefix` with index >= `from_index`
    async fn watch(&self, prefix: &str, from_index: u64) -> Result<ChangeEvent>;

    /// Atomically create `key` unless it exists. Returns `false` if it exists.
    async fn create_if_absent(&self, key: &str, value: &str, ttl: Option<Duration>)
        -> Result<bool>;

    /// Create or overwrite `key`
    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<()>;
}
