//! Registry aggregates: configuration, persisted state, the image summary
//! table and the scan pass lifecycle for each configured registry.
//!
//! Every controller mirrors summaries and states from the shared store.
//! Only the active scanner talks to drivers and dispatches image scans; the
//! persisted registry state is the switch that starts and stops a pass.

mod cache;
mod catalog;
mod discovery;
mod driver;
mod image_bank;
mod lifecycle;
mod schedule;
mod service;
mod task;

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use chrono::{DateTime, Utc};
use scanplane_model::{
    CveDbInfo, ImageRef, ImageSummary, RegistryConfig, RegistryState, RegistryStatus,
    ScanStatus,
};
use serde::Serialize;
use tokio::sync::{Mutex, MutexGuard, RwLock};
use tokio_util::sync::CancellationToken;

use crate::config::RegistryScanConfig;
use crate::leadership::ScannerRole;
use crate::profile::ProfileStore;
use crate::scheduler::{SchedulerTask, TaskPriority, TaskScheduler};
use crate::store::ClusterStore;

pub use cache::ImageInfoCache;
pub use catalog::{CatalogDriver, CatalogDriverFactory, RegistryCatalog, SharedCatalog};
pub use discovery::{DiscoveredImages, filter_repos, filter_tags};
pub use driver::{DriverFactory, RegistryDriver};
pub use image_bank::{BankDiff, ImageBank};
pub use service::RegistryService;
pub use task::RegistryImageHandler;

pub const REGISTRY_ERR_CONNECT: &str = "Failed to connect to the registry";
pub const REGISTRY_ERR_IMAGE: &str = "Failed to get scanning image list";
pub const REGISTRY_ERR_AUTH: &str = "Authentication error";

/// Built-in registry that collects summaries of ad-hoc repository scans.
pub const REPO_SCAN_REGISTRY: &str = "_repo_scan";

/// Collaborators shared by every registry of a controller.
#[derive(Debug)]
pub struct RegistryDeps {
    pub store: ClusterStore,
    pub scheduler: TaskScheduler<RegistryImageTask>,
    pub role: Arc<dyn ScannerRole>,
    pub profiles: ProfileStore,
    pub drivers: Arc<dyn DriverFactory>,
    pub config: RegistryScanConfig,
    pub image_bank: ImageBank,
    pub(crate) db: RwLock<CveDbInfo>,
}

impl RegistryDeps {
    pub fn new(
        store: ClusterStore,
        scheduler: TaskScheduler<RegistryImageTask>,
        role: Arc<dyn ScannerRole>,
        profiles: ProfileStore,
        drivers: Arc<dyn DriverFactory>,
        config: RegistryScanConfig,
    ) -> Self {
        Self {
            store,
            scheduler,
            role,
            profiles,
            drivers,
            config,
            image_bank: ImageBank::new(),
            db: RwLock::new(CveDbInfo::default()),
        }
    }

    fn is_scanner(&self) -> bool {
        self.role.is_scanner()
    }

    /// CVE database the scanners currently report.
    pub async fn db(&self) -> CveDbInfo {
        self.db.read().await.clone()
    }
}

/// Cancellation scope of one scan pass. `scheduling` is raised while
/// discovery may still add tasks, which keeps an empty task queue from
/// ending the pass early.
#[derive(Clone, Debug, Default)]
pub struct ScanContext {
    token: CancellationToken,
    scheduling: Arc<AtomicBool>,
}

impl ScanContext {
    fn new() -> Self {
        Self::default()
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    fn cancel(&self) {
        self.token.cancel();
    }

    fn is_scheduling(&self) -> bool {
        self.scheduling.load(Ordering::SeqCst)
    }

    fn set_scheduling(&self, scheduling: bool) {
        self.scheduling.store(scheduling, Ordering::SeqCst);
    }
}

/// Scheduler record for one registry image scan.
#[derive(Clone, Debug)]
pub struct RegistryImageTask {
    pub registry: String,
    pub image_id: String,
    pub retries: u32,
    scan: ScanContext,
}

impl RegistryImageTask {
    fn new(registry: &str, image_id: &str, scan: &ScanContext) -> Self {
        Self {
            registry: registry.to_string(),
            image_id: image_id.to_string(),
            retries: 0,
            scan: scan.clone(),
        }
    }
}

/// The same content ID can live in several registries, so keys are
/// qualified by registry name.
pub fn image_task_key(registry: &str, image_id: &str) -> String {
    format!("{registry}@{image_id}")
}

impl SchedulerTask for RegistryImageTask {
    fn key(&self) -> String {
        image_task_key(&self.registry, &self.image_id)
    }

    fn priority(&self) -> TaskPriority {
        TaskPriority::Low
    }
}

/// Everything guarded by a registry's state lock.
struct RegistryContent {
    config: RegistryConfig,
    public: bool,
    state: RegistryState,
    summary: HashMap<String, ImageSummary>,
    cache: HashMap<String, ImageInfoCache>,
    image2id: HashMap<ImageRef, String>,
    digest2id: HashMap<String, String>,
    task_queue: HashSet<String>,
    scan: Option<ScanContext>,
    poll: Option<CancellationToken>,
    driver: Arc<dyn RegistryDriver>,
    backup: Arc<dyn RegistryDriver>,
    err_detail: String,
}

impl RegistryContent {
    /// Keep the reverse indexes in step with `summary[id]`.
    fn index_summary(&mut self, id: &str, sum: ImageSummary) {
        if let Some(old) = self.summary.get(id) {
            for image in &old.images {
                if self.image2id.get(image).is_some_and(|owner| owner == id) {
                    self.image2id.remove(image);
                }
            }
        }
        for image in &sum.images {
            self.image2id.insert(image.clone(), id.to_string());
        }
        self.digest2id.insert(sum.digest.clone(), id.to_string());
        self.summary.insert(id.to_string(), sum);
    }

    fn unindex_summary(&mut self, id: &str) {
        if let Some(sum) = self.summary.remove(id) {
            for image in &sum.images {
                if self.image2id.get(image).is_some_and(|owner| owner == id) {
                    self.image2id.remove(image);
                }
            }
            if self.digest2id.get(&sum.digest).is_some_and(|owner| owner == id) {
                self.digest2id.remove(&sum.digest);
            }
        }
        self.cache.remove(id);
    }
}

pub(crate) struct RegistryInner {
    name: String,
    deps: Arc<RegistryDeps>,
    content: Mutex<RegistryContent>,
}

/// Cloneable handle to one registry aggregate.
#[derive(Clone)]
pub struct Registry {
    inner: Arc<RegistryInner>,
}

impl fmt::Debug for Registry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut debug = f.debug_struct("Registry");
        debug.field("name", &self.inner.name);
        if let Ok(content) = self.inner.content.try_lock() {
            debug
                .field("status", &content.state.status)
                .field("images", &content.summary.len())
                .field("queued", &content.task_queue.len());
        }
        debug.finish()
    }
}

impl Registry {
    pub fn new(config: RegistryConfig, deps: Arc<RegistryDeps>) -> Self {
        let public = config.is_public();
        let driver = deps.drivers.create(&config, public);
        let backup = deps.drivers.create(&config, public);
        tracing::debug!(target: "scan::registry", registry = %config.name, public, "registry created");
        Self {
            inner: Arc::new(RegistryInner {
                name: config.name.clone(),
                deps,
                content: Mutex::new(RegistryContent {
                    config,
                    public,
                    state: RegistryState::idle(),
                    summary: HashMap::new(),
                    cache: HashMap::new(),
                    image2id: HashMap::new(),
                    digest2id: HashMap::new(),
                    task_queue: HashSet::new(),
                    scan: None,
                    poll: None,
                    driver,
                    backup,
                    err_detail: String::new(),
                }),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    fn deps(&self) -> &RegistryDeps {
        &self.inner.deps
    }

    async fn lock(&self) -> MutexGuard<'_, RegistryContent> {
        self.inner.content.lock().await
    }

    pub(crate) fn same_as(&self, other: &Registry) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Current configuration.
    pub async fn config(&self) -> RegistryConfig {
        self.lock().await.config.clone()
    }

    /// Last persisted state seen by this controller.
    pub async fn state(&self) -> RegistryState {
        self.lock().await.state.clone()
    }

    async fn scan_driver(&self) -> Arc<dyn RegistryDriver> {
        Arc::clone(&self.lock().await.driver)
    }

    /// Summary of one content ID.
    pub async fn image_summary(&self, id: &str) -> Option<ImageSummary> {
        self.lock().await.summary.get(id).cloned()
    }

    /// Summaries sorted by image ID.
    pub async fn image_summaries(&self) -> Vec<ImageSummary> {
        let content = self.lock().await;
        let mut list: Vec<_> = content.summary.values().cloned().collect();
        list.sort_by(|a, b| a.image_id.cmp(&b.image_id));
        list
    }

    /// Content ID a repository reference currently resolves to.
    pub async fn image_id_for(&self, image: &ImageRef) -> Option<String> {
        self.lock().await.image2id.get(image).cloned()
    }

    /// Content ID holding a manifest digest.
    pub async fn image_id_for_digest(&self, digest: &str) -> Option<String> {
        self.lock().await.digest2id.get(digest).cloned()
    }

    /// Filtered vulnerability cache of a finished image.
    pub async fn image_cache(&self, id: &str) -> Option<ImageInfoCache> {
        self.lock().await.cache.get(id).cloned()
    }

    /// Number of image IDs with an outstanding task in the current pass.
    pub async fn queued_images(&self) -> usize {
        self.lock().await.task_queue.len()
    }

    /// Whether this controller runs a pass for the registry.
    pub async fn is_scanning(&self) -> bool {
        self.lock().await.scan.is_some()
    }

    /// Whether the periodic poll timer is armed.
    pub async fn is_polling(&self) -> bool {
        self.lock().await.poll.is_some()
    }

    /// Configuration, state and per-status image reference counts.
    pub async fn summary_view(&self) -> RegistrySummaryView {
        let db = self.deps().db().await;
        let content = self.lock().await;
        let mut view = RegistrySummaryView {
            name: content.config.name.clone(),
            config: content.config.clone(),
            status: content.state.status,
            err_msg: content.state.err_msg.clone(),
            err_detail: content.state.err_detail.clone(),
            started_at: content.state.started_at,
            scheduled: 0,
            scanning: 0,
            failed: 0,
            scanned: 0,
            cve_db_version: db.version,
            cve_db_create_time: db.create_time,
        };
        for sum in content.summary.values() {
            let refs = sum.images.len();
            match sum.status {
                ScanStatus::Scheduled => view.scheduled += refs,
                ScanStatus::Scanning => view.scanning += refs,
                ScanStatus::Failed => view.failed += refs,
                ScanStatus::Finished => view.scanned += refs,
                ScanStatus::Idle => {}
            }
        }
        view
    }
}

/// Read model of one registry for display.
#[derive(Clone, Debug, Serialize)]
pub struct RegistrySummaryView {
    pub name: String,
    #[serde(skip)]
    pub config: RegistryConfig,
    pub status: RegistryStatus,
    pub err_msg: String,
    pub err_detail: String,
    pub started_at: Option<DateTime<Utc>>,
    pub scheduled: usize,
    pub scanning: usize,
    pub failed: usize,
    pub scanned: usize,
    pub cve_db_version: String,
    pub cve_db_create_time: String,
}

#[cfg(test)]
mod tests;
