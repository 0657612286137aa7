//! Image-stream cache. Tracks the tag set of each `{domain, repo}` and which
//! registries want to hear about tag changes.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use scanplane_model::ImageRef;
use tokio::sync::RwLock;

/// Tag changes of one image stream, with the registries to notify.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct BankDiff {
    pub added: Vec<ImageRef>,
    pub removed: Vec<ImageRef>,
    pub subscribers: Vec<String>,
}

impl BankDiff {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty()
    }
}

#[derive(Debug, Default)]
struct BankState {
    streams: BTreeMap<(String, String), BTreeSet<String>>,
    subscribers: BTreeSet<String>,
}

#[derive(Clone, Debug, Default)]
pub struct ImageBank {
    state: Arc<RwLock<BankState>>,
}

impl ImageBank {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn register(&self, registry: &str) {
        let mut state = self.state.write().await;
        if state.subscribers.insert(registry.to_string()) {
            tracing::debug!(target: "scan::registry", registry, "subscribed to image bank");
        }
    }

    pub async fn deregister(&self, registry: &str) {
        let mut state = self.state.write().await;
        if state.subscribers.remove(registry) {
            tracing::debug!(target: "scan::registry", registry, "unsubscribed from image bank");
        }
    }

    pub async fn subscribers(&self) -> Vec<String> {
        self.state.read().await.subscribers.iter().cloned().collect()
    }

    pub async fn tags(&self, domain: &str, repo: &str) -> Vec<String> {
        let state = self.state.read().await;
        state
            .streams
            .get(&(domain.to_string(), repo.to_string()))
            .map(|tags| tags.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Replace the tag set of a stream and report what changed.
    pub async fn update(&self, domain: &str, repo: &str, tags: impl IntoIterator<Item = String>) -> BankDiff {
        let new: BTreeSet<String> = tags.into_iter().collect();
        let mut state = self.state.write().await;
        let key = (domain.to_string(), repo.to_string());
        let old = state.streams.insert(key, new.clone()).unwrap_or_default();

        BankDiff {
            added: new
                .difference(&old)
                .map(|tag| ImageRef::new(domain, repo, tag.as_str()))
                .collect(),
            removed: old
                .difference(&new)
                .map(|tag| ImageRef::new(domain, repo, tag.as_str()))
                .collect(),
            subscribers: state.subscribers.iter().cloned().collect(),
        }
    }

    /// Forget a stream; every tag it had is reported as removed.
    pub async fn remove(&self, domain: &str, repo: &str) -> BankDiff {
        let mut state = self.state.write().await;
        let old = state
            .streams
            .remove(&(domain.to_string(), repo.to_string()))
            .unwrap_or_default();
        BankDiff {
            added: Vec::new(),
            removed: old
                .iter()
                .map(|tag| ImageRef::new(domain, repo, tag.as_str()))
                .collect(),
            subscribers: state.subscribers.iter().cloned().collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tags(list: &[&str]) -> Vec<String> {
        list.iter().map(|t| t.to_string()).collect()
    }

    #[tokio::test]
    async fn update_reports_added_and_removed_tags() {
        let bank = ImageBank::new();
        bank.register("ocp").await;

        let diff = bank.update("team-a", "team-a/web", tags(&["v1", "v2"])).await;
        assert_eq!(diff.added.len(), 2);
        assert!(diff.removed.is_empty());
        assert_eq!(diff.subscribers, vec!["ocp".to_string()]);

        let diff = bank.update("team-a", "team-a/web", tags(&["v2", "v3"])).await;
        assert_eq!(diff.added, vec![ImageRef::new("team-a", "team-a/web", "v3")]);
        assert_eq!(diff.removed, vec![ImageRef::new("team-a", "team-a/web", "v1")]);

        let diff = bank.update("team-a", "team-a/web", tags(&["v3", "v2"])).await;
        assert!(diff.is_empty());
    }

    #[tokio::test]
    async fn remove_drops_every_tag() {
        let bank = ImageBank::new();
        bank.update("", "web", tags(&["a", "b"])).await;
        let diff = bank.remove("", "web").await;
        assert_eq!(diff.removed.len(), 2);
        assert!(diff.subscribers.is_empty());
        assert!(bank.tags("", "web").await.is_empty());
    }

    #[tokio::test]
    async fn deregister_stops_notifications() {
        let bank = ImageBank::new();
        bank.register("ocp").await;
        bank.deregister("ocp").await;
        let diff = bank.update("", "web", tags(&["a"])).await;
        assert!(diff.subscribers.is_empty());
    }
}
