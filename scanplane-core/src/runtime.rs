//! Control-plane runtime: wires the stores, both schedulers and the change
//! routing into one process and supervises their background tasks.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use scanplane_model::{
    DEFAULT_PROFILE_NAME, ImageSummary, RegistryConfig, RegistryState, ScanConfig, ScanState,
    ScannerRecord, VulnerabilityProfile,
};
use serde::de::DeserializeOwned;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::ControlPlaneConfig;
use crate::error::{Result, ScanError};
use crate::leadership::{LeadershipFlag, ScannerRole};
use crate::objects::{ObjectScanHandler, ScanObjectStore};
use crate::profile::{ProfileStore, VulnerabilityProfileFilter};
use crate::registry::{DriverFactory, RegistryDeps, RegistryImageHandler, RegistryService};
use crate::scanner::{HttpScannerRpc, ScannerCache, ScannerDirectory, ScannerRpc};
use crate::scheduler::TaskScheduler;
use crate::store::codec::decode_json;
use crate::store::{ChangeDispatcher, ChangeEvent, ChangeHandler, ChangeRoute, ClusterStore, KvStore, StoreKey};

/// One controller's scan control plane.
pub struct ScanControlPlane {
    config: ControlPlaneConfig,
    controller_id: String,
    store: ClusterStore,
    leadership: LeadershipFlag,
    profiles: ProfileStore,
    objects: ScanObjectStore,
    registries: RegistryService,
    directory: ScannerDirectory,
    rpc: Arc<dyn ScannerRpc>,
    started: AtomicBool,
    shutdown_token: CancellationToken,
    worker_handles: Mutex<Vec<JoinHandle<()>>>,
}

impl fmt::Debug for ScanControlPlane {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let worker_handle_count = self
            .worker_handles
            .try_lock()
            .map(|handles| handles.len())
            .unwrap_or_default();
        f.debug_struct("ScanControlPlane")
            .field("controller_id", &self.controller_id)
            .field("config", &self.config)
            .field("is_scanner", &self.leadership.is_scanner())
            .field("started", &self.started.load(Ordering::SeqCst))
            .field("worker_handle_count", &worker_handle_count)
            .field("shutdown_cancelled", &self.shutdown_token.is_cancelled())
            .finish()
    }
}

impl ScanControlPlane {
    pub fn builder(config: ControlPlaneConfig) -> ScanControlPlaneBuilder {
        ScanControlPlaneBuilder::new(config)
    }

    pub fn controller_id(&self) -> &str {
        &self.controller_id
    }

    pub fn config(&self) -> &ControlPlaneConfig {
        &self.config
    }

    pub fn store(&self) -> &ClusterStore {
        &self.store
    }

    pub fn leadership(&self) -> &LeadershipFlag {
        &self.leadership
    }

    pub fn profiles(&self) -> &ProfileStore {
        &self.profiles
    }

    pub fn objects(&self) -> &ScanObjectStore {
        &self.objects
    }

    pub fn registries(&self) -> &RegistryService {
        &self.registries
    }

    pub fn scanners(&self) -> &ScannerDirectory {
        &self.directory
    }

    /// Load the persisted configuration, start consuming store changes and
    /// spawn both dispatch loops. Scanner duties resume right away when the
    /// controller already holds the scanner role.
    pub async fn start(&self) -> Result<()> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(ScanError::Internal("control plane already started".into()));
        }
        tracing::info!(target: "scan::registry", controller = %self.controller_id, "starting scan control plane");

        // Subscribe before loading so changes racing the load are replayed.
        let dispatcher = ChangeDispatcher::new(
            self.store.kv(),
            self.config.watch.route_capacity,
        );
        self.load().await?;

        let router = Arc::new(ChangeRouter {
            objects: self.objects.clone(),
            registries: self.registries.clone(),
            directory: self.directory.clone(),
            profiles: self.profiles.clone(),
        });
        let mut handles = dispatcher.spawn(router, self.shutdown_token.clone());

        let object_handler = Arc::new(ObjectScanHandler::new(
            self.objects.clone(),
            Arc::clone(&self.rpc),
            self.config.object_scan,
        ));
        handles.push(
            self.objects
                .scheduler()
                .spawn_dispatcher(object_handler, self.shutdown_token.clone()),
        );
        let image_handler = Arc::new(RegistryImageHandler::new(
            self.registries.clone(),
            self.config.registry_scan,
        ));
        handles.push(
            self.registries
                .scheduler()
                .spawn_dispatcher(image_handler, self.shutdown_token.clone()),
        );
        handles.push(self.spawn_leadership_watch());

        self.worker_handles.lock().await.extend(handles);

        if self.leadership.is_scanner() {
            self.become_scanner().await;
        }
        Ok(())
    }

    async fn load(&self) -> Result<()> {
        let scan_config = self.store.scan_config().await?;
        self.objects.init_auto_scan(scan_config.auto_scan);

        match self.store.profile(DEFAULT_PROFILE_NAME).await? {
            Some(profile) => {
                self.profiles.update(&profile).await?;
            }
            None => {
                self.profiles.reset().await;
            }
        }

        let scanners = self.store.scanners().await?;
        let scanner_count = scanners.len();
        for record in scanners {
            self.directory.on_put(record).await;
        }

        let registry_count = self.registries.load().await?;
        tracing::info!(
            target: "scan::registry",
            auto_scan = scan_config.auto_scan,
            scanners = scanner_count,
            registries = registry_count,
            "control plane state loaded"
        );
        Ok(())
    }

    async fn become_scanner(&self) {
        tracing::info!(target: "scan::registry", controller = %self.controller_id, "acting as scanner");
        self.objects.become_scanner().await;
        self.registries.become_scanner().await;
    }

    fn spawn_leadership_watch(&self) -> JoinHandle<()> {
        let mut rx = self.leadership.subscribe();
        let shutdown = self.shutdown_token.clone();
        let objects = self.objects.clone();
        let registries = self.registries.clone();
        let controller_id = self.controller_id.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    changed = rx.changed() => {
                        if changed.is_err() {
                            break;
                        }
                        let is_scanner = *rx.borrow_and_update();
                        if is_scanner {
                            tracing::info!(target: "scan::registry", controller = %controller_id, "acting as scanner");
                            objects.become_scanner().await;
                            registries.become_scanner().await;
                        } else {
                            tracing::info!(target: "scan::registry", controller = %controller_id, "scanner role lost");
                        }
                    }
                }
            }
        })
    }

    /// Stop every background task, waiting up to the configured grace
    /// period for each one.
    pub async fn shutdown(&self) -> Result<()> {
        tracing::info!(target: "scan::registry", "shutting down scan control plane");
        self.shutdown_token.cancel();
        self.registries.shutdown().await;

        let handles = {
            let mut guard = self.worker_handles.lock().await;
            std::mem::take(&mut *guard)
        };
        let grace = self.config.shutdown_grace();
        for handle in handles {
            match tokio::time::timeout(grace, handle).await {
                Ok(Ok(())) => {}
                Ok(Err(err)) => tracing::warn!(target: "scan::registry", error = %err, "background task failed"),
                Err(_) => tracing::warn!(target: "scan::registry", "background task timed out during shutdown"),
            }
        }
        tracing::info!(target: "scan::registry", "scan control plane stopped");
        Ok(())
    }
}

/// Turns store changes into calls on the owning component.
struct ChangeRouter {
    objects: ScanObjectStore,
    registries: RegistryService,
    directory: ScannerDirectory,
    profiles: ProfileStore,
}

fn decode_value<T: DeserializeOwned>(event: &ChangeEvent) -> Option<T> {
    let bytes = event.value.as_deref()?;
    match decode_json(bytes) {
        Ok(value) => Some(value),
        Err(err) => {
            tracing::warn!(target: "scan::watch", key = %event.key, error = %err, "undecodable value");
            None
        }
    }
}

impl ChangeRouter {
    fn spawn_refresh(&self, filter: Arc<VulnerabilityProfileFilter>, cancel: CancellationToken) {
        let objects = self.objects.clone();
        let registries = self.registries.clone();
        tokio::spawn(async move {
            objects.refresh(Arc::clone(&filter), cancel.clone()).await;
            registries.refresh(filter, cancel).await;
        });
    }

    async fn profile_changed(&self, name: &str, event: &ChangeEvent) {
        if name != DEFAULT_PROFILE_NAME {
            tracing::debug!(target: "scan::profile", name, "ignoring non-default profile");
            return;
        }
        if event.value.is_none() {
            let (filter, cancel) = self.profiles.reset().await;
            self.spawn_refresh(filter, cancel);
            return;
        }
        let Some(profile) = decode_value::<VulnerabilityProfile>(event) else {
            return;
        };
        match self.profiles.update(&profile).await {
            Ok(Some((filter, cancel))) => self.spawn_refresh(filter, cancel),
            Ok(None) => {}
            Err(err) => {
                tracing::error!(target: "scan::profile", name, error = %err, "invalid vulnerability profile");
            }
        }
    }
}

#[async_trait]
impl ChangeHandler for ChangeRouter {
    async fn handle_change(&self, route: ChangeRoute, event: ChangeEvent) {
        let key = match StoreKey::parse(&event.key) {
            Ok(key) => key,
            Err(err) => {
                tracing::warn!(target: "scan::watch", %route, key = %event.key, error = %err, "unrecognised key");
                return;
            }
        };
        tracing::trace!(target: "scan::watch", %route, key = %event.key, kind = %event.kind, "change");

        match key {
            StoreKey::ObjectState { kind, id } => {
                let state = decode_value::<ScanState>(&event);
                if let Err(err) = self.objects.handle_state(kind, &id, state).await {
                    tracing::warn!(target: "scan::object", id, error = %err, "failed to apply scan state");
                }
            }
            StoreKey::RegistryState { name } => {
                let state = decode_value::<RegistryState>(&event);
                self.registries.handle_state(&name, state).await;
            }
            StoreKey::ImageState { registry, id } => {
                let summary = decode_value::<ImageSummary>(&event);
                self.registries
                    .handle_image_state(&registry, &id, summary)
                    .await;
            }
            StoreKey::RegistryConfig { name } => {
                let config = decode_value::<RegistryConfig>(&event);
                if event.value.is_some() && config.is_none() {
                    return;
                }
                self.registries.handle_config(&name, config).await;
            }
            StoreKey::ScanConfig => {
                if let Some(config) = decode_value::<ScanConfig>(&event) {
                    self.objects.set_auto_scan(config.auto_scan).await;
                }
            }
            StoreKey::Profile { name } => self.profile_changed(&name, &event).await,
            StoreKey::Scanner { id } => match decode_value::<ScannerRecord>(&event) {
                Some(record) => self.directory.on_put(record).await,
                None if event.value.is_none() => self.directory.on_delete(&id).await,
                None => {}
            },
            StoreKey::ObjectReport { .. } | StoreKey::ImageReport { .. } => {}
        }
    }
}

/// Assembles a [`ScanControlPlane`]. The store and the registry driver
/// factory are required; everything else has a default.
pub struct ScanControlPlaneBuilder {
    config: ControlPlaneConfig,
    controller_id: Option<String>,
    store: Option<Arc<dyn KvStore>>,
    drivers: Option<Arc<dyn DriverFactory>>,
    rpc: Option<Arc<dyn ScannerRpc>>,
    scanners: Option<ScannerCache>,
    leadership: Option<LeadershipFlag>,
}

impl fmt::Debug for ScanControlPlaneBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScanControlPlaneBuilder")
            .field("config", &self.config)
            .field("controller_id", &self.controller_id)
            .field("store_set", &self.store.is_some())
            .field("drivers_set", &self.drivers.is_some())
            .field("rpc_set", &self.rpc.is_some())
            .field("scanners_set", &self.scanners.is_some())
            .field("leadership_set", &self.leadership.is_some())
            .finish()
    }
}

impl ScanControlPlaneBuilder {
    pub fn new(config: ControlPlaneConfig) -> Self {
        Self {
            config,
            controller_id: None,
            store: None,
            drivers: None,
            rpc: None,
            scanners: None,
            leadership: None,
        }
    }

    pub fn with_controller_id(mut self, id: impl Into<String>) -> Self {
        self.controller_id = Some(id.into());
        self
    }

    pub fn with_store(mut self, store: Arc<dyn KvStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn with_drivers(mut self, drivers: Arc<dyn DriverFactory>) -> Self {
        self.drivers = Some(drivers);
        self
    }

    /// Defaults to [`HttpScannerRpc`] over the scanner cache.
    pub fn with_rpc(mut self, rpc: Arc<dyn ScannerRpc>) -> Self {
        self.rpc = Some(rpc);
        self
    }

    /// Share a scanner cache with an RPC client built outside the runtime.
    pub fn with_scanner_cache(mut self, scanners: ScannerCache) -> Self {
        self.scanners = Some(scanners);
        self
    }

    pub fn with_leadership(mut self, leadership: LeadershipFlag) -> Self {
        self.leadership = Some(leadership);
        self
    }

    pub fn build(self) -> Result<ScanControlPlane> {
        let kv = self
            .store
            .ok_or_else(|| ScanError::Internal("store dependency missing".into()))?;
        let drivers = self
            .drivers
            .ok_or_else(|| ScanError::Internal("registry driver factory missing".into()))?;
        let controller_id = self
            .controller_id
            .filter(|id| !id.is_empty())
            .ok_or_else(|| ScanError::Internal("controller id missing".into()))?;

        let scanners = self.scanners.unwrap_or_default();
        let rpc = self
            .rpc
            .unwrap_or_else(|| Arc::new(HttpScannerRpc::new(scanners.clone())));
        let leadership = self.leadership.unwrap_or_else(|| LeadershipFlag::new(false));
        let role: Arc<dyn ScannerRole> = Arc::new(leadership.clone());

        let store = ClusterStore::new(kv);
        let profiles = ProfileStore::new();
        let objects = ScanObjectStore::new(
            store.clone(),
            TaskScheduler::new("object"),
            Arc::clone(&role),
            profiles.clone(),
        );
        let registries = RegistryService::new(Arc::new(RegistryDeps::new(
            store.clone(),
            TaskScheduler::new("registry"),
            role,
            profiles.clone(),
            drivers,
            self.config.registry_scan,
        )));
        let directory = ScannerDirectory::new(
            controller_id.clone(),
            scanners,
            objects.clone(),
            registries.clone(),
        );

        Ok(ScanControlPlane {
            config: self.config,
            controller_id,
            store,
            leadership,
            profiles,
            objects,
            registries,
            directory,
            rpc,
            started: AtomicBool::new(false),
            shutdown_token: CancellationToken::new(),
            worker_handles: Mutex::new(Vec::new()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::{CatalogDriverFactory, RegistryCatalog};
    use crate::store::InMemoryStore;

    fn builder() -> ScanControlPlaneBuilder {
        let scanners = ScannerCache::new();
        let rpc: Arc<dyn ScannerRpc> = Arc::new(HttpScannerRpc::new(scanners.clone()));
        ScanControlPlane::builder(ControlPlaneConfig::default())
            .with_controller_id("ctl-1")
            .with_store(Arc::new(InMemoryStore::default()))
            .with_scanner_cache(scanners)
            .with_drivers(Arc::new(CatalogDriverFactory::new(
                RegistryCatalog::default(),
                rpc,
            )))
    }

    #[test]
    fn build_requires_store_and_drivers() {
        let err = ScanControlPlane::builder(ControlPlaneConfig::default())
            .with_controller_id("ctl-1")
            .build()
            .unwrap_err();
        assert!(matches!(err, ScanError::Internal(_)));

        let err = ScanControlPlane::builder(ControlPlaneConfig::default())
            .with_controller_id("ctl-1")
            .with_store(Arc::new(InMemoryStore::default()))
            .build()
            .unwrap_err();
        assert!(matches!(err, ScanError::Internal(_)));
    }

    #[test]
    fn build_requires_controller_id() {
        let err = builder().with_controller_id("").build().unwrap_err();
        assert!(matches!(err, ScanError::Internal(_)));
    }

    #[tokio::test]
    async fn start_twice_is_rejected() {
        let plane = builder().build().unwrap();
        plane.start().await.unwrap();
        assert!(plane.start().await.is_err());
        plane.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn start_loads_scan_config() {
        let plane = builder().build().unwrap();
        plane
            .store()
            .put_scan_config(&ScanConfig { auto_scan: true })
            .await
            .unwrap();
        plane.start().await.unwrap();
        assert!(plane.objects().auto_scan());
        plane.shutdown().await.unwrap();
    }
}
