use std::fmt;
use std::sync::Arc;

use scanplane_model::{
    ImageSummary, RegistryConfig, RegistryState, ScanConfig, ScanObjectType, ScanReport,
    ScanState, ScannerRecord, VulnerabilityProfile,
};

use crate::error::Result;

use super::codec::{decode_compressed, decode_json, encode_compressed, encode_json};
use super::{KvStore, keys};

/// Typed access to the shared store.
#[derive(Clone)]
pub struct ClusterStore {
    kv: Arc<dyn KvStore>,
}

impl fmt::Debug for ClusterStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClusterStore").field("kv", &self.kv).finish()
    }
}

impl ClusterStore {
    pub fn new(kv: Arc<dyn KvStore>) -> Self {
        Self { kv }
    }

    pub fn kv(&self) -> Arc<dyn KvStore> {
        Arc::clone(&self.kv)
    }

    async fn get_json<T: serde::de::DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        match self.kv.get(key).await? {
            Some(bytes) => decode_json(&bytes).map(Some),
            None => Ok(None),
        }
    }

    async fn put_json<T: serde::Serialize>(&self, key: &str, value: &T) -> Result<()> {
        self.kv.put(key, encode_json(value)?).await?;
        Ok(())
    }

    // Scan configuration

    /// Missing configuration reads as the default (auto-scan off).
    pub async fn scan_config(&self) -> Result<ScanConfig> {
        Ok(self
            .get_json(keys::SCAN_CONFIG_KEY)
            .await?
            .unwrap_or_default())
    }

    pub async fn put_scan_config(&self, config: &ScanConfig) -> Result<()> {
        self.put_json(keys::SCAN_CONFIG_KEY, config).await
    }

    // Objects

    pub async fn object_state(&self, kind: ScanObjectType, id: &str) -> Result<Option<ScanState>> {
        self.get_json(&keys::object_state_key(kind, id)).await
    }

    pub async fn put_object_state(
        &self,
        kind: ScanObjectType,
        id: &str,
        state: &ScanState,
    ) -> Result<()> {
        self.put_json(&keys::object_state_key(kind, id), state).await
    }

    pub async fn object_report(
        &self,
        kind: ScanObjectType,
        id: &str,
    ) -> Result<Option<ScanReport>> {
        match self.kv.get(&keys::object_report_key(kind, id)).await? {
            Some(bytes) => decode_compressed(&bytes).map(Some),
            None => Ok(None),
        }
    }

    pub async fn put_object_report(
        &self,
        kind: ScanObjectType,
        id: &str,
        report: &ScanReport,
    ) -> Result<()> {
        self.kv
            .put(&keys::object_report_key(kind, id), encode_compressed(report)?)
            .await?;
        Ok(())
    }

    pub async fn delete_object(&self, kind: ScanObjectType, id: &str) -> Result<()> {
        self.kv.delete(&keys::object_report_key(kind, id)).await?;
        self.kv.delete(&keys::object_state_key(kind, id)).await?;
        Ok(())
    }

    // Registries

    pub async fn registry_config(&self, name: &str) -> Result<Option<RegistryConfig>> {
        self.get_json(&keys::registry_config_key(name)).await
    }

    pub async fn put_registry_config(&self, config: &RegistryConfig) -> Result<()> {
        self.put_json(&keys::registry_config_key(&config.name), config)
            .await
    }

    pub async fn delete_registry_config(&self, name: &str) -> Result<bool> {
        self.kv.delete(&keys::registry_config_key(name)).await
    }

    pub async fn registry_configs(&self) -> Result<Vec<RegistryConfig>> {
        let entries = self.kv.list_prefix(keys::REGISTRY_CONFIG_PREFIX).await?;
        entries
            .iter()
            .map(|(_, bytes)| decode_json(bytes))
            .collect()
    }

    pub async fn registry_state(&self, name: &str) -> Result<Option<RegistryState>> {
        self.get_json(&keys::registry_state_key(name)).await
    }

    pub async fn put_registry_state(&self, name: &str, state: &RegistryState) -> Result<()> {
        self.put_json(&keys::registry_state_key(name), state).await
    }

    /// Remove the registry state and every image summary and report.
    pub async fn delete_registry_keys(&self, name: &str) -> Result<()> {
        self.kv.delete_prefix(&keys::image_report_prefix(name)).await?;
        self.kv.delete_prefix(&keys::image_state_prefix(name)).await?;
        self.kv.delete(&keys::registry_state_key(name)).await?;
        Ok(())
    }

    // Images

    pub async fn image_summary(&self, registry: &str, id: &str) -> Result<Option<ImageSummary>> {
        self.get_json(&keys::image_state_key(registry, id)).await
    }

    pub async fn image_summaries(&self, registry: &str) -> Result<Vec<ImageSummary>> {
        let entries = self
            .kv
            .list_prefix(&keys::image_state_prefix(registry))
            .await?;
        entries
            .iter()
            .map(|(_, bytes)| decode_json(bytes))
            .collect()
    }

    pub async fn put_image_summary(&self, registry: &str, summary: &ImageSummary) -> Result<()> {
        self.put_json(&keys::image_state_key(registry, &summary.image_id), summary)
            .await
    }

    /// The report lands before the summary so a watcher that sees a finished
    /// summary can always read its report.
    pub async fn put_image_summary_and_report(
        &self,
        registry: &str,
        summary: &ImageSummary,
        report: &ScanReport,
    ) -> Result<()> {
        self.kv
            .put(
                &keys::image_report_key(registry, &summary.image_id),
                encode_compressed(report)?,
            )
            .await?;
        self.put_image_summary(registry, summary).await
    }

    pub async fn image_report(&self, registry: &str, id: &str) -> Result<Option<ScanReport>> {
        match self.kv.get(&keys::image_report_key(registry, id)).await? {
            Some(bytes) => decode_compressed(&bytes).map(Some),
            None => Ok(None),
        }
    }

    pub async fn delete_image(&self, registry: &str, id: &str) -> Result<()> {
        self.kv.delete(&keys::image_report_key(registry, id)).await?;
        self.kv.delete(&keys::image_state_key(registry, id)).await?;
        Ok(())
    }

    // Profiles and scanners

    pub async fn profile(&self, name: &str) -> Result<Option<VulnerabilityProfile>> {
        self.get_json(&keys::profile_key(name)).await
    }

    pub async fn put_profile(&self, profile: &VulnerabilityProfile) -> Result<()> {
        self.put_json(&keys::profile_key(&profile.name), profile)
            .await
    }

    pub async fn put_scanner(&self, record: &ScannerRecord) -> Result<()> {
        self.put_json(&keys::scanner_key(&record.id), record).await
    }

    pub async fn delete_scanner(&self, id: &str) -> Result<bool> {
        self.kv.delete(&keys::scanner_key(id)).await
    }

    pub async fn scanners(&self) -> Result<Vec<ScannerRecord>> {
        let entries = self.kv.list_prefix(keys::SCANNER_PREFIX).await?;
        entries
            .iter()
            .map(|(_, bytes)| decode_json(bytes))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InMemoryStore;
    use scanplane_model::{ImageRef, ScanResult, ScanStatus};

    fn store() -> ClusterStore {
        ClusterStore::new(Arc::new(InMemoryStore::default()))
    }

    #[tokio::test]
    async fn missing_scan_config_reads_as_default() {
        let store = store();
        assert!(!store.scan_config().await.unwrap().auto_scan);
        store
            .put_scan_config(&ScanConfig { auto_scan: true })
            .await
            .unwrap();
        assert!(store.scan_config().await.unwrap().auto_scan);
    }

    #[tokio::test]
    async fn delete_registry_keys_clears_images_and_state() {
        let store = store();
        let summary = ImageSummary {
            image_id: "abc".into(),
            images: vec![ImageRef::new("", "myorg/app", "v1")],
            status: ScanStatus::Finished,
            ..ImageSummary::default()
        };
        store
            .put_image_summary_and_report("hub", &summary, &ScanReport::new(ScanResult::default()))
            .await
            .unwrap();
        store
            .put_registry_state("hub", &RegistryState::scanning())
            .await
            .unwrap();
        assert_eq!(store.image_summaries("hub").await.unwrap().len(), 1);

        store.delete_registry_keys("hub").await.unwrap();

        assert!(store.image_summaries("hub").await.unwrap().is_empty());
        assert!(store.image_report("hub", "abc").await.unwrap().is_none());
        assert!(store.registry_state("hub").await.unwrap().is_none());
    }
}
