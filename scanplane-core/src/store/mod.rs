//! Watched key-value store contract and the typed layer on top of it.
//!
//! The store is the single source of truth shared by every controller. All
//! local caches are rebuilt from its change notifications.

mod cluster;
pub mod codec;
pub mod keys;
mod memory;
mod watch;

use std::fmt;

use async_trait::async_trait;
use tokio::sync::broadcast;

use crate::error::Result;

pub use cluster::ClusterStore;
pub use keys::StoreKey;
pub use memory::InMemoryStore;
pub use watch::{ChangeDispatcher, ChangeHandler, ChangeRoute};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ChangeKind {
    Add,
    Modify,
    Delete,
}

impl fmt::Display for ChangeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChangeKind::Add => f.write_str("add"),
            ChangeKind::Modify => f.write_str("modify"),
            ChangeKind::Delete => f.write_str("delete"),
        }
    }
}

/// One key mutation as seen by watchers. `value` is `None` for deletes.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ChangeEvent {
    pub kind: ChangeKind,
    pub key: String,
    pub value: Option<Vec<u8>>,
    pub revision: u64,
}

/// Linearizable per-key store with change notifications.
///
/// Notifications are delivered at least once; handlers must tolerate
/// re-delivery and arrival interleaved with their own writes.
#[async_trait]
pub trait KvStore: Send + Sync + fmt::Debug {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;

    /// Write `value` and return the new store revision.
    async fn put(&self, key: &str, value: Vec<u8>) -> Result<u64>;

    /// Returns whether the key existed.
    async fn delete(&self, key: &str) -> Result<bool>;

    /// Returns the number of keys removed.
    async fn delete_prefix(&self, prefix: &str) -> Result<usize>;

    /// Keys and values under `prefix`, in key order.
    async fn list_prefix(&self, prefix: &str) -> Result<Vec<(String, Vec<u8>)>>;

    fn subscribe(&self) -> broadcast::Receiver<ChangeEvent>;
}
