use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use tokio::sync::{RwLock, broadcast};

use crate::error::Result;

use super::{ChangeEvent, ChangeKind, KvStore};

/// Single-process [`KvStore`] used by the standalone controller and tests.
///
/// Events are published while the write lock is held so every subscriber
/// observes mutations in revision order.
pub struct InMemoryStore {
    entries: RwLock<BTreeMap<String, Vec<u8>>>,
    revision: AtomicU64,
    events: broadcast::Sender<ChangeEvent>,
}

impl fmt::Debug for InMemoryStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let entry_count = self
            .entries
            .try_read()
            .map(|guard| guard.len())
            .unwrap_or_default();
        f.debug_struct("InMemoryStore")
            .field("entry_count", &entry_count)
            .field("revision", &self.revision.load(Ordering::Relaxed))
            .field("subscribers", &self.events.receiver_count())
            .finish()
    }
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new(4096)
    }
}

impl InMemoryStore {
    pub fn new(event_capacity: usize) -> Self {
        let (events, _) = broadcast::channel(event_capacity.max(1));
        Self {
            entries: RwLock::new(BTreeMap::new()),
            revision: AtomicU64::new(0),
            events,
        }
    }

    pub fn revision(&self) -> u64 {
        self.revision.load(Ordering::SeqCst)
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }

    fn publish(&self, kind: ChangeKind, key: String, value: Option<Vec<u8>>) -> u64 {
        let revision = self.revision.fetch_add(1, Ordering::SeqCst) + 1;
        // No subscribers is not an error.
        let _ = self.events.send(ChangeEvent {
            kind,
            key,
            value,
            revision,
        });
        revision
    }
}

#[async_trait]
impl KvStore for InMemoryStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.entries.read().await.get(key).cloned())
    }

    async fn put(&self, key: &str, value: Vec<u8>) -> Result<u64> {
        let mut guard = self.entries.write().await;
        let kind = if guard.contains_key(key) {
            ChangeKind::Modify
        } else {
            ChangeKind::Add
        };
        guard.insert(key.to_string(), value.clone());
        let revision = self.publish(kind, key.to_string(), Some(value));
        tracing::trace!(target: "scan::store", key, revision, %kind, "put");
        Ok(revision)
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        let mut guard = self.entries.write().await;
        if guard.remove(key).is_some() {
            let revision = self.publish(ChangeKind::Delete, key.to_string(), None);
            tracing::trace!(target: "scan::store", key, revision, "delete");
            Ok(true)
        } else {
            Ok(false)
        }
    }

    async fn delete_prefix(&self, prefix: &str) -> Result<usize> {
        let mut guard = self.entries.write().await;
        let doomed: Vec<String> = guard
            .range(prefix.to_string()..)
            .take_while(|(key, _)| key.starts_with(prefix))
            .map(|(key, _)| key.clone())
            .collect();
        for key in &doomed {
            guard.remove(key);
            self.publish(ChangeKind::Delete, key.clone(), None);
        }
        Ok(doomed.len())
    }

    async fn list_prefix(&self, prefix: &str) -> Result<Vec<(String, Vec<u8>)>> {
        let guard = self.entries.read().await;
        Ok(guard
            .range(prefix.to_string()..)
            .take_while(|(key, _)| key.starts_with(prefix))
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect())
    }

    fn subscribe(&self) -> broadcast::Receiver<ChangeEvent> {
        self.events.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn put_reports_add_then_modify() {
        let store = InMemoryStore::default();
        let mut rx = store.subscribe();

        store.put("a", b"1".to_vec()).await.unwrap();
        store.put("a", b"2".to_vec()).await.unwrap();

        let first = rx.recv().await.unwrap();
        let second = rx.recv().await.unwrap();
        assert_eq!(first.kind, ChangeKind::Add);
        assert_eq!(second.kind, ChangeKind::Modify);
        assert!(second.revision > first.revision);
        assert_eq!(store.get("a").await.unwrap(), Some(b"2".to_vec()));
    }

    #[tokio::test]
    async fn delete_of_missing_key_is_silent() {
        let store = InMemoryStore::default();
        let mut rx = store.subscribe();
        assert!(!store.delete("missing").await.unwrap());
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn prefix_operations_only_touch_matching_keys() {
        let store = InMemoryStore::default();
        store.put("scan/state/image/r1/a", vec![1]).await.unwrap();
        store.put("scan/state/image/r1/b", vec![2]).await.unwrap();
        store.put("scan/state/image/r10/c", vec![3]).await.unwrap();

        let listed = store.list_prefix("scan/state/image/r1/").await.unwrap();
        assert_eq!(listed.len(), 2);

        let removed = store.delete_prefix("scan/state/image/r1/").await.unwrap();
        assert_eq!(removed, 2);
        assert_eq!(store.len().await, 1);
    }
}
