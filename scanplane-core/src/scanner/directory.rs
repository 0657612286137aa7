use std::fmt;

use scanplane_model::{CveDbInfo, ScannerRecord};

use crate::objects::{ObjectScanTask, ScanObjectStore};
use crate::registry::{RegistryImageTask, RegistryService};
use crate::scheduler::TaskScheduler;

use super::ScannerCache;

/// Turns scanner records into processors on both schedulers. The CVE
/// database marker record carries the database version instead.
#[derive(Clone)]
pub struct ScannerDirectory {
    controller_id: String,
    cache: ScannerCache,
    objects: ScanObjectStore,
    registries: RegistryService,
}

impl fmt::Debug for ScannerDirectory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScannerDirectory")
            .field("controller_id", &self.controller_id)
            .field("cache", &self.cache)
            .finish_non_exhaustive()
    }
}

impl ScannerDirectory {
    pub fn new(
        controller_id: impl Into<String>,
        cache: ScannerCache,
        objects: ScanObjectStore,
        registries: RegistryService,
    ) -> Self {
        Self {
            controller_id: controller_id.into(),
            cache,
            objects,
            registries,
        }
    }

    fn object_scheduler(&self) -> &TaskScheduler<ObjectScanTask> {
        self.objects.scheduler()
    }

    fn image_scheduler(&self) -> &TaskScheduler<RegistryImageTask> {
        self.registries.scheduler()
    }

    /// A built-in scanner only serves the controller it runs beside.
    fn serves_here(&self, record: &ScannerRecord) -> bool {
        !record.built_in || record.id == self.controller_id
    }

    pub async fn on_put(&self, record: ScannerRecord) {
        if record.is_db_marker() {
            let db = CveDbInfo {
                version: record.cve_db_version.clone(),
                create_time: record.cve_db_create_time.clone(),
            };
            tracing::info!(target: "scan::scanner", version = %db.version, created = %db.create_time, "CVE database updated");
            self.registries.set_db(db.clone()).await;
            self.objects.scanner_db_change(db).await;
            return;
        }

        let serves = self.serves_here(&record);
        let id = record.id.clone();
        let fresh = self.cache.get(&id).is_none();
        self.cache.upsert(record);
        if !serves {
            tracing::debug!(target: "scan::scanner", scanner = %id, "built-in scanner of another controller");
            return;
        }
        if fresh {
            tracing::info!(target: "scan::scanner", scanner = %id, "scanner joined");
        }
        self.object_scheduler().add_processor(&id).await;
        self.image_scheduler().add_processor(&id).await;
    }

    pub async fn on_delete(&self, id: &str) {
        if id == scanplane_model::CVE_DB_VERSION_ID {
            tracing::error!(target: "scan::scanner", "CVE database version record deleted");
            return;
        }
        if self.cache.remove(id).is_some() {
            tracing::info!(target: "scan::scanner", scanner = id, "scanner left");
        }
        self.object_scheduler().del_processor(id).await;
        self.image_scheduler().del_processor(id).await;
    }

    pub fn all(&self) -> Vec<ScannerRecord> {
        self.cache.all()
    }

    pub fn cache(&self) -> &ScannerCache {
        &self.cache
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use async_trait::async_trait;
    use scanplane_model::{CVE_DB_VERSION_ID, RegistryConfig, ScanResult};

    use super::*;
    use crate::config::RegistryScanConfig;
    use crate::error::{Result, ScanError};
    use crate::leadership::LeadershipFlag;
    use crate::profile::ProfileStore;
    use crate::registry::{CatalogDriverFactory, RegistryCatalog, RegistryDeps};
    use crate::scanner::{ImageScanRequest, ScannerRpc};
    use crate::store::{ClusterStore, InMemoryStore};

    #[derive(Debug)]
    struct NoopRpc;

    #[async_trait]
    impl ScannerRpc for NoopRpc {
        async fn scan_workload(&self, _: &str, _: &str, _: &str, _: Duration) -> Result<ScanResult> {
            Err(ScanError::Rpc("unused".into()))
        }

        async fn scan_host(&self, _: &str, _: &str, _: &str, _: Duration) -> Result<ScanResult> {
            Err(ScanError::Rpc("unused".into()))
        }

        async fn scan_platform(&self, _: &str, _: Duration) -> Result<ScanResult> {
            Err(ScanError::Rpc("unused".into()))
        }

        async fn scan_image(&self, _: &str, _: &ImageScanRequest, _: Duration) -> Result<ScanResult> {
            Err(ScanError::Rpc("unused".into()))
        }
    }

    fn directory() -> ScannerDirectory {
        let store = ClusterStore::new(Arc::new(InMemoryStore::default()));
        let role = Arc::new(LeadershipFlag::new(false));
        let profiles = ProfileStore::new();
        let objects = ScanObjectStore::new(
            store.clone(),
            TaskScheduler::new("object"),
            role.clone(),
            profiles.clone(),
        );
        let deps = RegistryDeps::new(
            store,
            TaskScheduler::new("registry"),
            role,
            profiles,
            Arc::new(CatalogDriverFactory::new(RegistryCatalog::default(), Arc::new(NoopRpc))),
            RegistryScanConfig::default(),
        );
        let registries = RegistryService::new(Arc::new(deps));
        ScannerDirectory::new("ctl-1", ScannerCache::new(), objects, registries)
    }

    fn scanner(id: &str, built_in: bool) -> ScannerRecord {
        ScannerRecord {
            id: id.into(),
            address: "127.0.0.1:18402".into(),
            built_in,
            ..ScannerRecord::default()
        }
    }

    #[tokio::test]
    async fn scanners_become_processors_on_both_queues() {
        let dir = directory();
        dir.on_put(scanner("s1", false)).await;
        dir.on_put(scanner("s1", false)).await;

        assert_eq!(dir.object_scheduler().snapshot().await.processors, 1);
        assert_eq!(dir.image_scheduler().snapshot().await.processors, 1);
        assert_eq!(dir.all().len(), 1);

        dir.on_delete("s1").await;
        assert_eq!(dir.object_scheduler().snapshot().await.processors, 0);
        assert_eq!(dir.image_scheduler().snapshot().await.processors, 0);
        assert!(dir.all().is_empty());
    }

    #[tokio::test]
    async fn foreign_built_in_scanner_is_not_a_processor() {
        let dir = directory();
        dir.on_put(scanner("ctl-2", true)).await;
        dir.on_put(scanner("ctl-1", true)).await;

        let snapshot = dir.object_scheduler().snapshot().await;
        assert_eq!(snapshot.processors, 1);
        assert_eq!(dir.all().len(), 2);
    }

    #[tokio::test]
    async fn db_marker_updates_database_version() {
        let dir = directory();
        let marker = ScannerRecord {
            id: CVE_DB_VERSION_ID.into(),
            cve_db_version: "3.200".into(),
            cve_db_create_time: "2026-09-01T00:00:00Z".into(),
            ..ScannerRecord::default()
        };
        dir.on_put(marker).await;

        assert_eq!(dir.object_scheduler().snapshot().await.processors, 0);
        assert_eq!(dir.objects.status_summary().await.cve_db_version, "3.200");
        dir.registries
            .handle_config("reg", Some(RegistryConfig {
                name: "reg".into(),
                ..RegistryConfig::default()
            }))
            .await;
        let view = dir.registries.summary("reg").await.unwrap();
        assert_eq!(view.cve_db_version, "3.200");
        assert!(dir.all().is_empty());
    }
}
