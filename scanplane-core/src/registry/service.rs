use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use scanplane_model::{
    CveDbInfo, ImageRef, ImageSummary, RegistryConfig, RegistryState, RegistryStatus,
    RegistryType, ScanSchedule,
};
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;

use crate::error::{Result, ScanError};
use crate::profile::VulnerabilityProfileFilter;
use crate::scheduler::TaskScheduler;

use super::discovery::DiscoveredImages;
use super::image_bank::{BankDiff, ImageBank};
use super::{
    REPO_SCAN_REGISTRY, Registry, RegistryDeps, RegistryImageTask, RegistrySummaryView,
    ScanContext,
};

struct ServiceInner {
    registries: RwLock<HashMap<String, Registry>>,
    repo_scan: Registry,
    deps: Arc<RegistryDeps>,
}

/// Owns every registry of the controller. The map lock only guards
/// structural changes; content changes go through each registry's own lock.
#[derive(Clone)]
pub struct RegistryService {
    inner: Arc<ServiceInner>,
}

impl fmt::Debug for RegistryService {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut debug = f.debug_struct("RegistryService");
        if let Ok(map) = self.inner.registries.try_read() {
            debug.field("registries", &map.len());
        }
        debug.finish_non_exhaustive()
    }
}

fn bank_subscriber(config: &RegistryConfig) -> bool {
    config.registry_type == RegistryType::OpenShift && config.schedule == ScanSchedule::Auto
}

impl RegistryService {
    pub fn new(deps: Arc<RegistryDeps>) -> Self {
        let repo_scan = Registry::new(
            RegistryConfig {
                name: REPO_SCAN_REGISTRY.to_string(),
                ..RegistryConfig::default()
            },
            Arc::clone(&deps),
        );
        Self {
            inner: Arc::new(ServiceInner {
                registries: RwLock::new(HashMap::new()),
                repo_scan,
                deps,
            }),
        }
    }

    fn deps(&self) -> &RegistryDeps {
        &self.inner.deps
    }

    pub fn scheduler(&self) -> &TaskScheduler<RegistryImageTask> {
        &self.inner.deps.scheduler
    }

    pub fn image_bank(&self) -> &ImageBank {
        &self.inner.deps.image_bank
    }

    pub fn repo_scan(&self) -> &Registry {
        &self.inner.repo_scan
    }

    pub async fn lookup(&self, name: &str) -> Option<Registry> {
        self.inner.registries.read().await.get(name).cloned()
    }

    /// Configured registries sorted by name.
    pub async fn all(&self) -> Vec<Registry> {
        let mut list: Vec<Registry> = self.inner.registries.read().await.values().cloned().collect();
        list.sort_by(|a, b| a.name().cmp(b.name()));
        list
    }

    pub async fn len(&self) -> usize {
        self.inner.registries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.inner.registries.read().await.is_empty()
    }

    /// Build the registry table from the store without triggering scans;
    /// scanner duties start with [`RegistryService::become_scanner`].
    pub async fn load(&self) -> Result<usize> {
        let configs = self.deps().store.registry_configs().await?;
        let mut loaded = Vec::with_capacity(configs.len());
        {
            let mut map = self.inner.registries.write().await;
            for config in configs {
                if config.name == REPO_SCAN_REGISTRY {
                    continue;
                }
                if bank_subscriber(&config) {
                    self.image_bank().register(&config.name).await;
                }
                let registry = Registry::new(config, Arc::clone(&self.inner.deps));
                map.insert(registry.name().to_string(), registry.clone());
                loaded.push(registry);
            }
        }
        for registry in loaded.iter().chain(std::iter::once(&self.inner.repo_scan)) {
            registry.restore().await?;
        }
        tracing::info!(target: "scan::registry", count = loaded.len(), "registries loaded");
        Ok(loaded.len())
    }

    /// Apply a configuration change; `None` deletes the registry.
    pub async fn handle_config(&self, name: &str, config: Option<RegistryConfig>) {
        match config {
            Some(config) => self.put_config(config).await,
            None => self.delete(name).await,
        }
    }

    async fn put_config(&self, config: RegistryConfig) {
        let scanner = self.deps().is_scanner();
        let name = config.name.clone();
        let (registry, added) = {
            let mut map = self.inner.registries.write().await;
            match map.get(&name).cloned() {
                Some(registry) => (registry, false),
                None => {
                    let registry = Registry::new(config.clone(), Arc::clone(&self.inner.deps));
                    if scanner && config.schedule == ScanSchedule::Periodical {
                        let mut content = registry.lock().await;
                        registry.start_polling(&mut content);
                    }
                    map.insert(name.clone(), registry.clone());
                    tracing::info!(target: "scan::registry", registry = %name, "registry added");
                    (registry, true)
                }
            }
        };
        // Driver calls run with the map lock released.
        let (old_schedule, creds_changed) = if added {
            (ScanSchedule::Manual, false)
        } else {
            let old_schedule = registry.config().await.schedule;
            (old_schedule, registry.apply_config(config.clone()).await)
        };

        if config.registry_type == RegistryType::OpenShift {
            let was_auto = old_schedule == ScanSchedule::Auto;
            let is_auto = config.schedule == ScanSchedule::Auto;
            if is_auto && !was_auto {
                self.image_bank().register(&name).await;
            } else if was_auto && !is_auto {
                self.image_bank().deregister(&name).await;
            }
        }
        if creds_changed {
            return;
        }

        if scanner && old_schedule != ScanSchedule::Auto && config.schedule == ScanSchedule::Auto {
            let content = registry.lock().await;
            if content.state.status == RegistryStatus::Idle {
                tracing::info!(target: "scan::registry", registry = %name, "auto scan enabled, start scan");
                registry.put_state(&RegistryState::scanning()).await;
            }
        }
    }

    async fn delete(&self, name: &str) {
        let removed = self.inner.registries.write().await.remove(name);
        let Some(registry) = removed else {
            return;
        };
        registry.retire().await;
        tracing::info!(target: "scan::registry", registry = name, "registry deleted");

        if self.deps().is_scanner()
            && let Err(err) = self.deps().store.delete_registry_keys(name).await
        {
            tracing::error!(target: "scan::registry", registry = name, error = %err, "failed to delete registry keys");
        }
        if bank_subscriber(&registry.config().await) {
            self.image_bank().deregister(name).await;
        }
    }

    /// Mirror a persisted registry state. A removed state key needs no
    /// action; it only disappears together with the registry.
    pub async fn handle_state(&self, name: &str, state: Option<RegistryState>) {
        let Some(state) = state else {
            return;
        };
        match self.lookup(name).await {
            Some(registry) => registry.apply_state(state).await,
            None => {
                tracing::debug!(target: "scan::registry", registry = name, "state for unknown registry");
            }
        }
    }

    /// Mirror a persisted image summary; `None` means it was deleted.
    pub async fn handle_image_state(&self, name: &str, id: &str, summary: Option<ImageSummary>) {
        let registry = if name == REPO_SCAN_REGISTRY {
            self.inner.repo_scan.clone()
        } else {
            match self.lookup(name).await {
                Some(registry) => registry,
                None => return,
            }
        };
        registry.apply_image_state(id, summary).await;
    }

    pub async fn become_scanner(&self) {
        let registries = self.all().await;
        tracing::info!(target: "scan::registry", count = registries.len(), "resume registry scanning");
        for registry in registries {
            registry.become_scanner().await;
        }
    }

    /// Record a new CVE database. Finished images are rescanned by the next
    /// pass of registries with rescan-after-update enabled.
    pub async fn set_db(&self, db: CveDbInfo) {
        *self.inner.deps.db.write().await = db;
    }

    /// Re-filter finished image caches against a new profile filter.
    pub async fn refresh(&self, filter: Arc<VulnerabilityProfileFilter>, cancel: CancellationToken) {
        let mut registries = self.all().await;
        registries.push(self.inner.repo_scan.clone());
        let mut refreshed = 0;
        for registry in registries {
            if cancel.is_cancelled() {
                tracing::debug!(target: "scan::profile", refreshed, "image refresh cancelled");
                return;
            }
            refreshed += registry.refresh_cache(&filter, &cancel).await;
        }
        tracing::debug!(target: "scan::profile", refreshed, "image refresh finished");
    }

    pub async fn summary(&self, name: &str) -> Option<RegistrySummaryView> {
        match self.lookup(name).await {
            Some(registry) => Some(registry.summary_view().await),
            None => None,
        }
    }

    pub async fn summaries(&self) -> Vec<RegistrySummaryView> {
        let mut views = Vec::new();
        for registry in self.all().await {
            views.push(registry.summary_view().await);
        }
        views
    }

    /// Manually start a scan pass.
    pub async fn request_start(&self, name: &str) -> Result<()> {
        let registry = self
            .lookup(name)
            .await
            .ok_or_else(|| ScanError::NotFound(format!("registry {name}")))?;
        if registry.state().await.status == RegistryStatus::Scanning {
            return Ok(());
        }
        self.deps()
            .store
            .put_registry_state(registry.name(), &RegistryState::scanning())
            .await
    }

    /// Manually stop a running scan pass.
    pub async fn request_stop(&self, name: &str) -> Result<()> {
        let registry = self
            .lookup(name)
            .await
            .ok_or_else(|| ScanError::NotFound(format!("registry {name}")))?;
        let current = registry.state().await;
        if current.status == RegistryStatus::Idle {
            return Ok(());
        }
        let state = RegistryState {
            status: RegistryStatus::Idle,
            started_at: current.started_at,
            ..RegistryState::default()
        };
        self.deps().store.put_registry_state(registry.name(), &state).await
    }

    /// Record the tag set of an image stream and forward the changes to
    /// subscribed registries.
    pub async fn image_bank_update(&self, domain: &str, repo: &str, tags: Vec<String>) {
        let diff = self.image_bank().update(domain, repo, tags).await;
        self.apply_bank_diff(diff).await;
    }

    pub async fn image_bank_delete(&self, domain: &str, repo: &str) {
        let diff = self.image_bank().remove(domain, repo).await;
        self.apply_bank_diff(diff).await;
    }

    async fn apply_bank_diff(&self, diff: BankDiff) {
        if diff.is_empty() || !self.deps().is_scanner() {
            return;
        }
        for name in &diff.subscribers {
            let Some(registry) = self.lookup(name).await else {
                continue;
            };
            for image in &diff.added {
                self.image_scan_add(&registry, image).await;
            }
            for image in &diff.removed {
                registry.image_scan_delete(image).await;
            }
        }
    }

    async fn image_scan_add(&self, registry: &Registry, image: &ImageRef) {
        let metas = match registry.resolve_image(image).await {
            Ok(metas) => metas,
            Err(err) => {
                tracing::debug!(target: "scan::registry", registry = registry.name(), %image, error = %err, "image not added");
                return;
            }
        };
        // The registry may have been replaced while the driver was busy.
        match self.lookup(registry.name()).await {
            Some(current) if current.same_as(registry) => registry.schedule_added(metas).await,
            _ => {
                tracing::debug!(target: "scan::registry", registry = registry.name(), "registry changed, drop added image");
            }
        }
    }

    /// Run discovery for `config` without scheduling or persisting anything.
    pub async fn dry_run(&self, config: RegistryConfig) -> Result<DiscoveredImages> {
        let registry = Registry::new(config.clone(), Arc::clone(&self.inner.deps));
        let driver = registry.scan_driver().await;
        driver.login(&config).await?;
        let result = registry
            .get_scan_images(&ScanContext::new(), Arc::clone(&driver), true)
            .await;
        driver.logout(false).await;
        result
    }

    /// Stop every pass and poll timer without touching persisted state.
    pub async fn shutdown(&self) {
        for registry in self.all().await {
            registry.halt().await;
        }
    }
}

impl Registry {
    /// Load persisted state and summaries into the local tables.
    async fn restore(&self) -> Result<()> {
        let deps = self.deps();
        if let Some(state) = deps.store.registry_state(self.name()).await? {
            self.lock().await.state = state;
        }
        let summaries = deps.store.image_summaries(self.name()).await?;
        let count = summaries.len();
        for sum in summaries {
            let id = sum.image_id.clone();
            self.apply_image_state(&id, Some(sum)).await;
        }
        tracing::debug!(target: "scan::registry", registry = self.name(), images = count, "registry restored");
        Ok(())
    }
}
