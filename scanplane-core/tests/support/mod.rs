#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use scanplane_core::registry::{CatalogDriverFactory, RegistryCatalog};
use scanplane_core::scanner::{ImageScanRequest, ScannerRpc};
use scanplane_core::{ControlPlaneConfig, InMemoryStore, LeadershipFlag, ScanControlPlane};
use scanplane_model::{
    ImageInfo, RegistryConfig, RegistryFilter, ScanErrorCode, ScanResult, ScannerRecord, Severity,
    Vulnerability,
};

pub const CONTROLLER_ID: &str = "ctl-1";
pub const HIGH_CVE: &str = "CVE-2026-0001";

/// One scripted answer: the error code to report and how long to take.
#[derive(Clone, Copy, Debug)]
pub struct Reply {
    pub error: ScanErrorCode,
    pub delay: Duration,
}

impl Reply {
    pub fn ok() -> Self {
        Self::error(ScanErrorCode::None)
    }

    pub fn error(error: ScanErrorCode) -> Self {
        Self {
            error,
            delay: Duration::ZERO,
        }
    }

    pub fn after(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }
}

#[derive(Debug, Default)]
struct RpcState {
    scripts: HashMap<String, VecDeque<Reply>>,
    calls: Vec<String>,
    inflight: HashMap<String, usize>,
    max_inflight: HashMap<String, usize>,
}

/// Scanner double answering from per-target scripts. Unscripted calls
/// succeed with one high-severity vulnerability. Targets are the object id,
/// or `repo:tag` for images.
#[derive(Debug, Default)]
pub struct ScriptedRpc {
    state: Mutex<RpcState>,
    default_delay: Duration,
    db_version: Mutex<String>,
}

impl ScriptedRpc {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn with_delay(delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            default_delay: delay,
            ..Self::default()
        })
    }

    pub fn script(&self, target: &str, replies: impl IntoIterator<Item = Reply>) {
        self.state
            .lock()
            .unwrap()
            .scripts
            .entry(target.to_string())
            .or_default()
            .extend(replies);
    }

    pub fn set_db_version(&self, version: &str) {
        *self.db_version.lock().unwrap() = version.to_string();
    }

    pub fn calls(&self) -> Vec<String> {
        self.state.lock().unwrap().calls.clone()
    }

    pub fn calls_for(&self, target: &str) -> usize {
        self.state
            .lock()
            .unwrap()
            .calls
            .iter()
            .filter(|call| call.as_str() == target)
            .count()
    }

    pub fn max_inflight(&self, target: &str) -> usize {
        self.state
            .lock()
            .unwrap()
            .max_inflight
            .get(target)
            .copied()
            .unwrap_or_default()
    }

    async fn answer(&self, target: String) -> ScanResult {
        let reply = {
            let mut state = self.state.lock().unwrap();
            state.calls.push(target.clone());
            let running = state.inflight.entry(target.clone()).or_default();
            *running += 1;
            let running = *running;
            let max = state.max_inflight.entry(target.clone()).or_default();
            *max = (*max).max(running);
            state
                .scripts
                .get_mut(&target)
                .and_then(VecDeque::pop_front)
                .unwrap_or(Reply::ok().after(self.default_delay))
        };

        if !reply.delay.is_zero() {
            tokio::time::sleep(reply.delay).await;
        }

        if let Some(running) = self.state.lock().unwrap().inflight.get_mut(&target) {
            *running -= 1;
        }

        if reply.error != ScanErrorCode::None {
            return ScanResult::from_error(reply.error);
        }
        ScanResult {
            namespace: "ubuntu:22.04".into(),
            version: self.db_version.lock().unwrap().clone(),
            vulnerabilities: vec![Vulnerability {
                name: HIGH_CVE.into(),
                severity: Severity::High,
                score: 8.1,
                fixed_version: "1.0.1".into(),
                ..Vulnerability::default()
            }],
            secrets: Some(Vec::new()),
            ..ScanResult::default()
        }
    }
}

#[async_trait]
impl ScannerRpc for ScriptedRpc {
    async fn scan_workload(
        &self,
        _scanner: &str,
        _agent_id: &str,
        id: &str,
        _timeout: Duration,
    ) -> scanplane_core::Result<ScanResult> {
        Ok(self.answer(id.to_string()).await)
    }

    async fn scan_host(
        &self,
        _scanner: &str,
        _agent_id: &str,
        id: &str,
        _timeout: Duration,
    ) -> scanplane_core::Result<ScanResult> {
        Ok(self.answer(id.to_string()).await)
    }

    async fn scan_platform(
        &self,
        _scanner: &str,
        _timeout: Duration,
    ) -> scanplane_core::Result<ScanResult> {
        Ok(self.answer("platform".to_string()).await)
    }

    async fn scan_image(
        &self,
        _scanner: &str,
        request: &ImageScanRequest,
        _timeout: Duration,
    ) -> scanplane_core::Result<ScanResult> {
        Ok(self
            .answer(format!("{}:{}", request.repository, request.tag))
            .await)
    }
}

pub struct TestPlane {
    pub plane: ScanControlPlane,
    pub rpc: Arc<ScriptedRpc>,
    pub leadership: LeadershipFlag,
}

impl TestPlane {
    /// Register a scanner process; it becomes a processor on both queues
    /// once the change is routed.
    pub async fn add_scanner(&self, id: &str) -> Result<()> {
        let record = ScannerRecord {
            id: id.into(),
            address: "127.0.0.1:18402".into(),
            ..ScannerRecord::default()
        };
        self.plane
            .store()
            .put_scanner(&record)
            .await
            .context("put scanner")?;
        let objects = self.plane.objects().scheduler().clone();
        wait_until(|| {
            let objects = objects.clone();
            async move { objects.snapshot().await.processors > 0 }
        })
        .await;
        Ok(())
    }

    pub async fn shutdown(self) {
        self.plane.shutdown().await.expect("shutdown");
    }
}

/// Build a control plane on an in-memory store. The plane is not started.
pub fn build_plane(
    is_scanner: bool,
    rpc: Arc<ScriptedRpc>,
    catalog: RegistryCatalog,
) -> Result<TestPlane> {
    let leadership = LeadershipFlag::new(is_scanner);
    let scanner_rpc: Arc<dyn ScannerRpc> = rpc.clone();
    let plane = ScanControlPlane::builder(ControlPlaneConfig::default())
        .with_controller_id(CONTROLLER_ID)
        .with_store(Arc::new(InMemoryStore::default()))
        .with_rpc(Arc::clone(&scanner_rpc))
        .with_drivers(Arc::new(CatalogDriverFactory::new(catalog, scanner_rpc)))
        .with_leadership(leadership.clone())
        .build()
        .context("build control plane")?;
    Ok(TestPlane {
        plane,
        rpc,
        leadership,
    })
}

pub async fn start_plane(
    is_scanner: bool,
    rpc: Arc<ScriptedRpc>,
    catalog: RegistryCatalog,
) -> Result<TestPlane> {
    let test = build_plane(is_scanner, rpc, catalog)?;
    test.plane.start().await.context("start control plane")?;
    Ok(test)
}

pub fn image_info(id: &str) -> ImageInfo {
    ImageInfo {
        id: id.into(),
        digest: format!("sha256:{id}"),
        ..ImageInfo::default()
    }
}

/// `myorg/app` with two tags sharing content `abc`.
pub fn app_catalog() -> RegistryCatalog {
    let mut catalog = RegistryCatalog::default();
    catalog.insert("myorg/app", "v1", image_info("abc"));
    catalog.insert("myorg/app", "v2", image_info("abc"));
    catalog
}

pub fn registry_config(name: &str, filters: &[&str]) -> RegistryConfig {
    RegistryConfig {
        name: name.into(),
        registry: "https://registry.internal:5000/".into(),
        filters: filters
            .iter()
            .map(|f| RegistryFilter::parse(f).expect("valid filter"))
            .collect(),
        ..RegistryConfig::default()
    }
}

/// Poll `check` until it holds, panicking after five seconds.
pub async fn wait_until<F, Fut>(mut check: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    for _ in 0..500 {
        if check().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached in time");
}
