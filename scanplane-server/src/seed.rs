//! Initial store content for a standalone controller.

use std::path::Path;

use anyhow::Context;
use scanplane_core::registry::RegistryCatalog;
use scanplane_core::{ClusterStore, ScanObjectStore};
use scanplane_model::{
    RegistryConfig, ScanConfig, ScanObjectType, ScannerRecord, VulnerabilityProfile,
};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SeedObject {
    pub id: String,
    #[serde(default)]
    pub agent_id: String,
    pub kind: ScanObjectType,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Seed {
    /// Repositories served by the catalog registry driver.
    pub catalog: RegistryCatalog,
    pub scan_config: Option<ScanConfig>,
    pub registries: Vec<RegistryConfig>,
    pub profiles: Vec<VulnerabilityProfile>,
    pub scanners: Vec<ScannerRecord>,
    /// Workloads, hosts and the platform, added once the controller runs.
    pub objects: Vec<SeedObject>,
}

impl Seed {
    pub fn from_path(path: &Path) -> anyhow::Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read seed {}", path.display()))?;
        serde_json::from_str(&raw).with_context(|| format!("invalid seed {}", path.display()))
    }

    /// Write the persisted part of the seed. Run before the control plane
    /// starts so its initial load picks everything up.
    pub async fn write(&self, store: &ClusterStore) -> anyhow::Result<()> {
        if let Some(config) = &self.scan_config {
            store.put_scan_config(config).await?;
        }
        for profile in &self.profiles {
            store
                .put_profile(profile)
                .await
                .with_context(|| format!("failed to seed profile {}", profile.name))?;
        }
        for record in &self.scanners {
            store
                .put_scanner(record)
                .await
                .with_context(|| format!("failed to seed scanner {}", record.id))?;
        }
        for config in &self.registries {
            store
                .put_registry_config(config)
                .await
                .with_context(|| format!("failed to seed registry {}", config.name))?;
        }
        tracing::info!(
            registries = self.registries.len(),
            profiles = self.profiles.len(),
            scanners = self.scanners.len(),
            repositories = self.catalog.repositories.len(),
            "seed written"
        );
        Ok(())
    }

    pub async fn add_objects(&self, objects: &ScanObjectStore) -> anyhow::Result<()> {
        for object in &self.objects {
            objects
                .add(&object.id, &object.agent_id, object.kind)
                .await
                .with_context(|| format!("failed to add scan object {}", object.id))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use scanplane_core::InMemoryStore;

    use super::*;

    const SEED: &str = r#"{
        "catalog": {
            "repositories": {
                "myorg/app": {
                    "v1": {"id": "abc", "digest": "sha256:abc"}
                }
            }
        },
        "scan_config": {"auto_scan": true},
        "registries": [
            {"name": "reg", "registry": "https://registry.internal/", "filters": [{"org": "myorg", "repo": ".*", "tag": ".*"}]}
        ],
        "profiles": [
            {"name": "default", "entries": [{"name": "CVE-2026-0001"}], "updated_at": "2026-09-01T00:00:00Z"}
        ],
        "scanners": [{"id": "scanner-1", "address": "127.0.0.1:18402"}],
        "objects": [{"id": "platform", "kind": "platform"}]
    }"#;

    #[tokio::test]
    async fn seed_lands_in_the_store() {
        let seed: Seed = serde_json::from_str(SEED).unwrap();
        assert_eq!(seed.catalog.repositories.len(), 1);
        assert_eq!(seed.objects.len(), 1);

        let store = ClusterStore::new(Arc::new(InMemoryStore::default()));
        seed.write(&store).await.unwrap();

        assert!(store.scan_config().await.unwrap().auto_scan);
        assert_eq!(store.registry_configs().await.unwrap().len(), 1);
        assert_eq!(store.scanners().await.unwrap().len(), 1);
        let profile = store.profile("default").await.unwrap().unwrap();
        assert_eq!(profile.entries.len(), 1);
    }

    #[test]
    fn empty_seed_is_valid() {
        let seed: Seed = serde_json::from_str("{}").unwrap();
        assert!(seed.registries.is_empty());
        assert!(seed.scan_config.is_none());
    }
}
