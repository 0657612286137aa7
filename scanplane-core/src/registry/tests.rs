use std::time::Duration;

use async_trait::async_trait;
use scanplane_model::{
    ImageInfo, RegistryFilter, ScanErrorCode, ScanFlags, ScanResult, ScanSchedule,
};
use tokio::sync::{Semaphore, mpsc};

use super::*;
use crate::error::{Result, ScanError};
use crate::leadership::LeadershipFlag;
use crate::scanner::{ImageScanRequest, ScannerRpc};
use crate::scheduler::{TaskAction, TaskHandler};
use crate::store::InMemoryStore;

#[derive(Debug)]
struct NoopRpc;

#[async_trait]
impl ScannerRpc for NoopRpc {
    async fn scan_workload(&self, _: &str, _: &str, _: &str, _: Duration) -> Result<ScanResult> {
        Ok(ScanResult::default())
    }

    async fn scan_host(&self, _: &str, _: &str, _: &str, _: Duration) -> Result<ScanResult> {
        Ok(ScanResult::default())
    }

    async fn scan_platform(&self, _: &str, _: Duration) -> Result<ScanResult> {
        Ok(ScanResult::default())
    }

    async fn scan_image(&self, _: &str, _: &ImageScanRequest, _: Duration) -> Result<ScanResult> {
        Err(ScanError::Rpc("no scanner".into()))
    }
}

struct Fixture {
    service: RegistryService,
    deps: Arc<RegistryDeps>,
    store: ClusterStore,
    catalog: SharedCatalog,
}

/// Holds `set_config` and `logout` until the test hands out a permit.
#[derive(Debug)]
struct GatedDriver {
    inner: Arc<dyn RegistryDriver>,
    gate: Arc<Semaphore>,
}

impl GatedDriver {
    async fn pass_gate(&self) {
        let _permit = self.gate.acquire().await;
    }
}

#[async_trait]
impl RegistryDriver for GatedDriver {
    async fn login(&self, config: &RegistryConfig) -> Result<()> {
        self.inner.login(config).await
    }

    async fn logout(&self, force: bool) {
        self.pass_gate().await;
        self.inner.logout(force).await;
    }

    async fn set_config(&self, config: &RegistryConfig) {
        self.pass_gate().await;
        self.inner.set_config(config).await;
    }

    async fn get_repo_list(&self, org: &str, name: &str, limit: usize) -> Result<Vec<ImageRef>> {
        self.inner.get_repo_list(org, name, limit).await
    }

    async fn get_tag_list(&self, domain: &str, repo: &str, tag: &str) -> Result<Vec<String>> {
        self.inner.get_tag_list(domain, repo, tag).await
    }

    async fn get_all_images(&self) -> Result<Option<HashMap<ImageRef, Vec<String>>>> {
        self.inner.get_all_images().await
    }

    async fn get_image_meta(
        &self,
        domain: &str,
        repo: &str,
        tag: &str,
    ) -> std::result::Result<ImageInfo, ScanErrorCode> {
        self.inner.get_image_meta(domain, repo, tag).await
    }

    async fn scan_image(
        &self,
        scanner: &str,
        image_id: &str,
        repo: &str,
        tag: &str,
        timeout: Duration,
    ) -> ScanResult {
        self.inner.scan_image(scanner, image_id, repo, tag, timeout).await
    }
}

#[derive(Debug)]
struct GatedFactory {
    inner: CatalogDriverFactory,
    gate: Arc<Semaphore>,
}

impl DriverFactory for GatedFactory {
    fn create(&self, config: &RegistryConfig, public: bool) -> Arc<dyn RegistryDriver> {
        Arc::new(GatedDriver {
            inner: self.inner.create(config, public),
            gate: Arc::clone(&self.gate),
        })
    }
}

/// Answers `Wait` so a dispatched task stays in flight until `task_done`.
struct HoldingHandler {
    tx: mpsc::UnboundedSender<String>,
}

#[async_trait]
impl TaskHandler<RegistryImageTask> for HoldingHandler {
    async fn handle(&self, task: RegistryImageTask, _processor: &str) -> TaskAction {
        let _ = self.tx.send(task.image_id.clone());
        TaskAction::Wait
    }
}

fn fixture_with(is_scanner: bool, catalog: RegistryCatalog, config: RegistryScanConfig) -> Fixture {
    let drivers = CatalogDriverFactory::new(catalog, Arc::new(NoopRpc));
    let catalog = drivers.catalog();
    fixture_from(is_scanner, Arc::new(drivers), catalog, config)
}

fn gated_fixture(catalog: RegistryCatalog, gate: &Arc<Semaphore>) -> Fixture {
    let inner = CatalogDriverFactory::new(catalog, Arc::new(NoopRpc));
    let catalog = inner.catalog();
    let drivers = GatedFactory {
        inner,
        gate: Arc::clone(gate),
    };
    fixture_from(true, Arc::new(drivers), catalog, RegistryScanConfig::default())
}

fn fixture_from(
    is_scanner: bool,
    drivers: Arc<dyn DriverFactory>,
    catalog: SharedCatalog,
    config: RegistryScanConfig,
) -> Fixture {
    let store = ClusterStore::new(Arc::new(InMemoryStore::default()));
    let deps = Arc::new(RegistryDeps::new(
        store.clone(),
        TaskScheduler::new("registry"),
        Arc::new(LeadershipFlag::new(is_scanner)),
        ProfileStore::new(),
        drivers,
        config,
    ));
    Fixture {
        service: RegistryService::new(Arc::clone(&deps)),
        deps,
        store,
        catalog,
    }
}

fn fixture(is_scanner: bool, catalog: RegistryCatalog) -> Fixture {
    fixture_with(is_scanner, catalog, RegistryScanConfig::default())
}

fn info(id: &str) -> ImageInfo {
    ImageInfo {
        id: id.into(),
        digest: format!("sha256:{id}"),
        ..ImageInfo::default()
    }
}

fn app_catalog() -> RegistryCatalog {
    let mut catalog = RegistryCatalog::default();
    catalog.insert("myorg/app", "v1", info("abc"));
    catalog.insert("myorg/app", "v2", info("abc"));
    catalog.insert("myorg/db", "latest", info("def"));
    catalog.insert("other/tool", "latest", info("zzz"));
    catalog
}

fn config(name: &str, filters: &[&str]) -> RegistryConfig {
    RegistryConfig {
        name: name.into(),
        registry: "https://registry.internal:5000/".into(),
        filters: filters
            .iter()
            .map(|f| RegistryFilter::parse(f).unwrap())
            .collect(),
        ..RegistryConfig::default()
    }
}

fn image(repo: &str, tag: &str) -> ImageRef {
    ImageRef::new("", repo, tag)
}

async fn wait_until<F, Fut>(mut check: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    for _ in 0..200 {
        if check().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached in time");
}

async fn pass(reg: &Registry) -> (ScanContext, DiscoveredImages) {
    let scan = ScanContext::new();
    let found = reg
        .get_scan_images(&scan, reg.scan_driver().await, false)
        .await
        .unwrap();
    (scan, found)
}

/// Run discovery as the registry's current pass.
async fn owned_pass(reg: &Registry) -> ScanContext {
    let scan = ScanContext::new();
    reg.lock().await.scan = Some(scan.clone());
    reg.get_scan_images(&scan, reg.scan_driver().await, false)
        .await
        .unwrap();
    scan
}

async fn stop(reg: &Registry) {
    let mut content = reg.lock().await;
    reg.stop_scan(&mut content).await;
}

async fn finish(reg: &Registry, scan: &ScanContext, id: &str) -> Option<usize> {
    let result = ScanResult {
        secrets: Some(Vec::new()),
        ..ScanResult::default()
    };
    reg.check_and_put_image_result(scan, id, result, TaskAction::Done)
        .await
}

#[tokio::test]
async fn discovery_schedules_each_content_id_once() {
    let fx = fixture(true, app_catalog());
    let reg = Registry::new(config("reg", &["myorg/*:*"]), Arc::clone(&fx.deps));

    let (_, found) = pass(&reg).await;

    assert_eq!(found.total, 3);
    assert_eq!(found.images.len(), 2);
    assert_eq!(reg.queued_images().await, 2);
    assert_eq!(fx.deps.scheduler.snapshot().await.low, 2);

    let sum = reg.image_summary("abc").await.unwrap();
    assert_eq!(sum.status, ScanStatus::Scheduled);
    assert_eq!(sum.images.len(), 2);
    assert_eq!(
        reg.image_id_for(&image("myorg/app", "v2")).await.as_deref(),
        Some("abc")
    );
    assert_eq!(reg.image_id_for_digest("sha256:def").await.as_deref(), Some("def"));
    assert!(fx.store.image_summary("reg", "abc").await.unwrap().is_some());
    assert!(reg.image_id_for(&image("other/tool", "latest")).await.is_none());
}

#[tokio::test]
async fn finished_images_are_skipped_on_the_next_pass() {
    let fx = fixture(true, app_catalog());
    let reg = Registry::new(config("reg", &["myorg/*:*"]), Arc::clone(&fx.deps));

    let (scan, _) = pass(&reg).await;
    assert_eq!(finish(&reg, &scan, "abc").await, Some(1));
    assert_eq!(finish(&reg, &scan, "def").await, Some(0));

    let sum = reg.image_summary("abc").await.unwrap();
    assert_eq!(sum.status, ScanStatus::Finished);
    assert!(sum.scan_flags.contains(ScanFlags::CVE));
    assert!(sum.scan_flags.contains(ScanFlags::FILES));
    assert!(fx.store.image_report("reg", "abc").await.unwrap().is_some());
    let state = fx.store.registry_state("reg").await.unwrap().unwrap();
    assert_eq!(state.status, RegistryStatus::Idle);

    let (_, found) = pass(&reg).await;
    assert_eq!(found.images.len(), 2);
    assert_eq!(reg.queued_images().await, 0);
}

#[tokio::test]
async fn db_update_reschedules_finished_images() {
    let fx = fixture(true, app_catalog());
    let reg = Registry::new(config("reg", &["myorg/*:*"]), Arc::clone(&fx.deps));

    let (scan, _) = pass(&reg).await;
    finish(&reg, &scan, "abc").await;
    finish(&reg, &scan, "def").await;

    fx.service
        .set_db(CveDbInfo {
            version: "2.0".into(),
            create_time: "2026-01-01".into(),
        })
        .await;
    pass(&reg).await;

    assert_eq!(reg.queued_images().await, 2);
    assert_eq!(
        reg.image_summary("def").await.unwrap().status,
        ScanStatus::Scheduled
    );
}

#[tokio::test]
async fn moved_tag_follows_its_new_content() {
    let fx = fixture(true, app_catalog());
    let reg = Registry::new(config("reg", &["myorg/app:*"]), Arc::clone(&fx.deps));

    let (scan, _) = pass(&reg).await;
    finish(&reg, &scan, "abc").await;

    fx.catalog.write().await.insert("myorg/app", "v2", info("xyz"));
    let (_, found) = pass(&reg).await;
    let mut content = reg.lock().await;
    reg.cleanup_images(&mut content, &found).await;
    drop(content);

    assert_eq!(
        reg.image_id_for(&image("myorg/app", "v2")).await.as_deref(),
        Some("xyz")
    );
    assert_eq!(
        reg.image_summary("abc").await.unwrap().images,
        vec![image("myorg/app", "v1")]
    );
    let stored = fx.store.image_summary("reg", "abc").await.unwrap().unwrap();
    assert_eq!(stored.images, vec![image("myorg/app", "v1")]);
    assert_eq!(reg.queued_images().await, 1);
}

#[tokio::test]
async fn vanished_content_is_deleted() {
    let fx = fixture(true, app_catalog());
    let reg = Registry::new(config("reg", &["myorg/*:*"]), Arc::clone(&fx.deps));

    pass(&reg).await;
    fx.catalog.write().await.remove("myorg/db", "latest");
    let (_, found) = pass(&reg).await;
    let mut content = reg.lock().await;
    reg.cleanup_images(&mut content, &found).await;
    drop(content);

    assert!(fx.store.image_summary("reg", "def").await.unwrap().is_none());
    assert!(fx.store.image_summary("reg", "abc").await.unwrap().is_some());
}

#[tokio::test]
async fn oldest_finished_images_are_purged() {
    let mut catalog = RegistryCatalog::default();
    for name in ["a", "b", "c"] {
        catalog.insert(name, "latest", info(&format!("id-{name}")));
    }
    let limits = RegistryScanConfig {
        persist_image_max: 2,
        persist_image_extra: 0,
        ..RegistryScanConfig::default()
    };
    let fx = fixture_with(true, catalog, limits);
    let reg = Registry::new(config("reg", &["*:latest"]), Arc::clone(&fx.deps));

    let (scan, found) = pass(&reg).await;
    assert_eq!(found.images.len(), 3);
    for id in ["id-a", "id-b", "id-c"] {
        finish(&reg, &scan, id).await;
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    assert!(fx.store.image_summary("reg", "id-a").await.unwrap().is_none());
    assert!(fx.store.image_summary("reg", "id-b").await.unwrap().is_some());
    assert!(fx.store.image_summary("reg", "id-c").await.unwrap().is_some());
}

#[tokio::test]
async fn cancelled_pass_ignores_results() {
    let fx = fixture(true, app_catalog());
    let reg = Registry::new(config("reg", &["myorg/*:*"]), Arc::clone(&fx.deps));

    let (scan, _) = pass(&reg).await;
    scan.cancel();
    assert_eq!(finish(&reg, &scan, "abc").await, None);
    assert_eq!(
        reg.image_summary("abc").await.unwrap().status,
        ScanStatus::Scheduled
    );
}

#[tokio::test]
async fn discovery_tail_of_a_stopped_pass_schedules_nothing() {
    let fx = fixture(true, app_catalog());
    let reg = Registry::new(config("reg", &["myorg/*:*"]), Arc::clone(&fx.deps));

    let old = ScanContext::new();
    reg.lock().await.scan = Some(old.clone());
    stop(&reg).await;

    let driver = reg.scan_driver().await;
    let expanded = vec![(ImageRef::new("", "myorg/app", ""), vec!["v1".to_string()])];
    reg.schedule_scan_images(&old, driver.as_ref(), &expanded).await;

    assert_eq!(reg.queued_images().await, 0);
    assert!(reg.image_summary("abc").await.is_none());
    assert!(fx.store.image_summary("reg", "abc").await.unwrap().is_none());
    assert_eq!(fx.deps.scheduler.snapshot().await.low, 0);

    let new = owned_pass(&reg).await;
    assert_eq!(reg.queued_images().await, 2);
    assert_eq!(finish(&reg, &new, "abc").await, Some(1));
    assert_eq!(finish(&reg, &new, "def").await, Some(0));
    let state = fx.store.registry_state("reg").await.unwrap().unwrap();
    assert_eq!(state.status, RegistryStatus::Idle);
}

#[tokio::test]
async fn stale_task_releases_its_queue_entry() {
    let fx = fixture(true, app_catalog());
    let reg = Registry::new(config("reg", &["myorg/*:*"]), Arc::clone(&fx.deps));

    let (old, _) = pass(&reg).await;
    assert_eq!(reg.queued_images().await, 2);
    old.cancel();

    let stale = RegistryImageTask::new("reg", "abc", &old);
    assert!(reg.mark_image_scanning(&stale).await.is_none());
    assert_eq!(reg.queued_images().await, 1);
    assert!(!reg.lock().await.task_queue.contains("abc"));
}

#[tokio::test]
async fn new_pass_clears_leftover_queue_entries() {
    let fx = fixture(true, app_catalog());
    let reg = Registry::new(config("reg", &["myorg/*:*"]), Arc::clone(&fx.deps));

    let (old, _) = pass(&reg).await;
    old.cancel();
    assert_eq!(reg.queued_images().await, 2);

    let new = {
        let mut content = reg.lock().await;
        reg.open_scan(&mut content).await.unwrap()
    };
    assert_eq!(reg.queued_images().await, 0);
    assert_eq!(fx.deps.scheduler.snapshot().await.low, 0);
    assert!(!new.is_cancelled());
}

#[tokio::test]
async fn rejected_enqueue_stays_out_of_the_pass() {
    let fx = fixture(true, app_catalog());
    let reg = Registry::new(config("reg", &["myorg/*:*"]), Arc::clone(&fx.deps));
    let other = ScanContext::new();
    assert!(
        fx.deps
            .scheduler
            .add_task(RegistryImageTask::new("reg", "abc", &other), false)
            .await
    );

    let (scan, _) = pass(&reg).await;

    assert_eq!(reg.queued_images().await, 1);
    assert!(!reg.lock().await.task_queue.contains("abc"));
    assert_eq!(fx.deps.scheduler.snapshot().await.low, 2);
    assert_eq!(finish(&reg, &scan, "def").await, Some(0));
}

#[tokio::test]
async fn late_result_of_a_stopped_pass_leaves_the_new_pass_alone() {
    let fx = fixture(true, app_catalog());
    let reg = Registry::new(config("reg", &["myorg/*:*"]), Arc::clone(&fx.deps));
    let (tx, mut rx) = mpsc::unbounded_channel();
    let shutdown = CancellationToken::new();
    let dispatcher = fx
        .deps
        .scheduler
        .spawn_dispatcher(Arc::new(HoldingHandler { tx }), shutdown.clone());

    let old = owned_pass(&reg).await;
    fx.deps.scheduler.add_processor("scanner-1").await;
    let dispatched = tokio::time::timeout(Duration::from_secs(2), rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(dispatched, "abc");

    stop(&reg).await;
    let new = owned_pass(&reg).await;
    // abc is still in flight for the stopped pass.
    assert_eq!(reg.queued_images().await, 1);
    assert_eq!(
        reg.image_summary("abc").await.unwrap().status,
        ScanStatus::Scheduled
    );

    assert_eq!(finish(&reg, &old, "abc").await, None);
    assert_eq!(reg.queued_images().await, 1);
    assert!(reg.lock().await.task_queue.contains("def"));

    fx.deps
        .scheduler
        .task_done(RegistryImageTask::new("reg", "abc", &old), TaskAction::Done)
        .await;
    assert!(reg.reclaim_image("abc").await);
    assert_eq!(reg.queued_images().await, 2);

    assert_eq!(finish(&reg, &new, "abc").await, Some(1));
    assert_eq!(finish(&reg, &new, "def").await, Some(0));
    let state = fx.store.registry_state("reg").await.unwrap().unwrap();
    assert_eq!(state.status, RegistryStatus::Idle);

    shutdown.cancel();
    dispatcher.await.unwrap();
}

#[tokio::test]
async fn driver_calls_run_without_the_registry_map_lock() {
    let gate = Arc::new(Semaphore::new(0));
    let fx = gated_fixture(app_catalog(), &gate);
    fx.service
        .handle_config("slow", Some(config("slow", &["myorg/*:*"])))
        .await;
    fx.service
        .handle_config("other", Some(config("other", &["*"])))
        .await;

    let service = fx.service.clone();
    let update = tokio::spawn(async move {
        service
            .handle_config("slow", Some(config("slow", &["myorg/app:*"])))
            .await
    });
    tokio::time::sleep(Duration::from_millis(50)).await;
    let other = tokio::time::timeout(Duration::from_secs(1), fx.service.lookup("other"))
        .await
        .expect("lookup while set_config is pending");
    assert!(other.is_some());
    assert!(!update.is_finished());

    gate.add_permits(1);
    tokio::time::timeout(Duration::from_secs(2), update)
        .await
        .unwrap()
        .unwrap();
    let slow = fx.service.lookup("slow").await.unwrap();
    assert_eq!(
        slow.config().await.filters,
        vec![RegistryFilter::parse("myorg/app:*").unwrap()]
    );
    gate.acquire().await.unwrap().forget();

    let service = fx.service.clone();
    let delete = tokio::spawn(async move { service.handle_config("slow", None).await });
    tokio::time::sleep(Duration::from_millis(50)).await;
    let all = tokio::time::timeout(Duration::from_secs(1), fx.service.all())
        .await
        .expect("listing while logout is pending");
    assert_eq!(all.len(), 1);
    assert!(!delete.is_finished());

    gate.add_permits(1);
    tokio::time::timeout(Duration::from_secs(2), delete)
        .await
        .unwrap()
        .unwrap();
    assert!(fx.service.lookup("slow").await.is_none());
}

#[tokio::test]
async fn scanning_state_starts_and_idle_stops_a_pass() {
    let fx = fixture(true, app_catalog());
    let reg = Registry::new(config("reg", &["myorg/*:*"]), Arc::clone(&fx.deps));

    reg.apply_state(RegistryState::scanning()).await;
    assert!(reg.is_scanning().await);
    wait_until(|| async { reg.queued_images().await == 2 }).await;
    wait_until(|| async { !reg.lock().await.scan.as_ref().is_some_and(|s| s.is_scheduling()) }).await;

    reg.apply_state(RegistryState::idle()).await;

    assert!(!reg.is_scanning().await);
    assert_eq!(reg.queued_images().await, 0);
    assert_eq!(fx.deps.scheduler.snapshot().await.low, 0);
    for id in ["abc", "def"] {
        let stored = fx.store.image_summary("reg", id).await.unwrap().unwrap();
        assert_eq!(stored.status, ScanStatus::Idle);
    }
}

#[tokio::test]
async fn failed_login_records_connect_error() {
    let catalog = RegistryCatalog {
        username: Some("admin".into()),
        ..app_catalog()
    };
    let fx = fixture(true, catalog);
    let reg = Registry::new(config("reg", &["myorg/*:*"]), Arc::clone(&fx.deps));

    let started = RegistryState::scanning();
    reg.apply_state(started.clone()).await;

    assert!(!reg.is_scanning().await);
    let state = fx.store.registry_state("reg").await.unwrap().unwrap();
    assert_eq!(state.status, RegistryStatus::Idle);
    assert_eq!(state.err_msg, REGISTRY_ERR_CONNECT);
    assert!(state.err_detail.contains("UNAUTHORIZED"));
    assert_eq!(state.started_at, started.started_at);
}

#[tokio::test]
async fn non_scanner_only_mirrors_state() {
    let fx = fixture(false, app_catalog());
    let reg = Registry::new(config("reg", &["myorg/*:*"]), Arc::clone(&fx.deps));

    reg.apply_state(RegistryState::scanning()).await;

    assert_eq!(reg.state().await.status, RegistryStatus::Scanning);
    assert!(!reg.is_scanning().await);
    assert_eq!(fx.deps.scheduler.snapshot().await.low, 0);
}

#[tokio::test]
async fn summary_view_counts_references() {
    let fx = fixture(true, app_catalog());
    let reg = Registry::new(config("reg", &["myorg/*:*"]), Arc::clone(&fx.deps));

    let (scan, _) = pass(&reg).await;
    finish(&reg, &scan, "def").await;

    let view = reg.summary_view().await;
    assert_eq!(view.scheduled, 2);
    assert_eq!(view.scanned, 1);
    assert_eq!(view.failed, 0);
}

#[tokio::test]
async fn new_auto_registry_starts_scanning() {
    let fx = fixture(true, app_catalog());
    let mut cfg = config("auto", &["myorg/*:*"]);
    cfg.schedule = ScanSchedule::Auto;

    fx.service.handle_config("auto", Some(cfg)).await;

    assert!(fx.service.lookup("auto").await.is_some());
    let state = fx.store.registry_state("auto").await.unwrap().unwrap();
    assert_eq!(state.status, RegistryStatus::Scanning);
}

#[tokio::test]
async fn non_scanner_config_change_writes_nothing() {
    let fx = fixture(false, app_catalog());
    let mut cfg = config("auto", &["myorg/*:*"]);
    cfg.schedule = ScanSchedule::Auto;

    fx.service.handle_config("auto", Some(cfg)).await;

    assert!(fx.service.lookup("auto").await.is_some());
    assert!(fx.store.registry_state("auto").await.unwrap().is_none());
}

#[tokio::test]
async fn periodical_schedule_controls_polling() {
    let fx = fixture(true, app_catalog());
    let mut cfg = config("poll", &["myorg/*:*"]);
    cfg.schedule = ScanSchedule::Periodical;
    cfg.poll_period_secs = 3600;

    fx.service.handle_config("poll", Some(cfg.clone())).await;
    let reg = fx.service.lookup("poll").await.unwrap();
    assert!(reg.is_polling().await);

    cfg.schedule = ScanSchedule::Manual;
    fx.service.handle_config("poll", Some(cfg)).await;
    assert!(!reg.is_polling().await);
}

#[tokio::test]
async fn deleting_a_registry_removes_its_keys() {
    let fx = fixture(true, app_catalog());
    fx.service
        .handle_config("reg", Some(config("reg", &["myorg/*:*"])))
        .await;
    let reg = fx.service.lookup("reg").await.unwrap();
    pass(&reg).await;
    assert!(fx.store.image_summary("reg", "abc").await.unwrap().is_some());

    fx.service.handle_config("reg", None).await;

    assert!(fx.service.lookup("reg").await.is_none());
    assert!(fx.store.image_summary("reg", "abc").await.unwrap().is_none());
    assert_eq!(fx.deps.scheduler.snapshot().await.low, 0);
}

#[tokio::test]
async fn image_state_changes_are_mirrored() {
    let fx = fixture(false, RegistryCatalog::default());
    fx.service
        .handle_config("reg", Some(config("reg", &["*"])))
        .await;
    let sum = ImageSummary {
        image_id: "abc".into(),
        digest: "sha256:abc".into(),
        images: vec![image("web", "v1")],
        status: ScanStatus::Scheduled,
        ..ImageSummary::default()
    };

    fx.service.handle_image_state("reg", "abc", Some(sum)).await;
    let reg = fx.service.lookup("reg").await.unwrap();
    assert_eq!(reg.image_id_for(&image("web", "v1")).await.as_deref(), Some("abc"));

    fx.service.handle_image_state("reg", "abc", None).await;
    assert!(reg.image_id_for(&image("web", "v1")).await.is_none());
    assert!(reg.image_id_for_digest("sha256:abc").await.is_none());
}

#[tokio::test]
async fn repo_scan_summaries_land_in_the_builtin_registry() {
    let fx = fixture(false, RegistryCatalog::default());
    let sum = ImageSummary {
        image_id: "abc".into(),
        images: vec![image("web", "v1")],
        ..ImageSummary::default()
    };

    fx.service
        .handle_image_state(REPO_SCAN_REGISTRY, "abc", Some(sum))
        .await;

    assert!(fx.service.repo_scan().image_summary("abc").await.is_some());
    assert!(fx.service.lookup(REPO_SCAN_REGISTRY).await.is_none());
}

#[tokio::test]
async fn dry_run_discovers_without_writing() {
    let fx = fixture(true, app_catalog());

    let found = fx
        .service
        .dry_run(config("preview", &["myorg/app:v1", "myorg/db"]))
        .await
        .unwrap();

    assert_eq!(found.total, 2);
    assert_eq!(found.images.len(), 2);
    assert!(fx.store.image_summaries("preview").await.unwrap().is_empty());
    assert_eq!(fx.deps.scheduler.snapshot().await.low, 0);
}

#[tokio::test]
async fn manual_requests_need_a_known_registry() {
    let fx = fixture(true, app_catalog());
    assert!(matches!(
        fx.service.request_start("missing").await,
        Err(ScanError::NotFound(_))
    ));

    fx.service
        .handle_config("reg", Some(config("reg", &["myorg/*:*"])))
        .await;
    fx.service.request_start("reg").await.unwrap();
    let state = fx.store.registry_state("reg").await.unwrap().unwrap();
    assert_eq!(state.status, RegistryStatus::Scanning);
}

#[tokio::test]
async fn loading_restores_state_and_summaries() {
    let fx = fixture(false, RegistryCatalog::default());
    fx.store
        .put_registry_config(&config("reg", &["*"]))
        .await
        .unwrap();
    fx.store
        .put_registry_state("reg", &RegistryState::scanning())
        .await
        .unwrap();
    let sum = ImageSummary {
        image_id: "abc".into(),
        images: vec![image("web", "v1")],
        status: ScanStatus::Scheduled,
        ..ImageSummary::default()
    };
    fx.store.put_image_summary("reg", &sum).await.unwrap();

    assert_eq!(fx.service.load().await.unwrap(), 1);

    let reg = fx.service.lookup("reg").await.unwrap();
    assert_eq!(reg.state().await.status, RegistryStatus::Scanning);
    assert_eq!(reg.image_summaries().await, vec![sum]);
    assert!(!reg.is_scanning().await);
}
