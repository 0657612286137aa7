//! Scan state for workloads, hosts and the platform singleton.
//!
//! Every controller keeps a [`ScanObjectStore`] in sync with the persisted
//! per-object scan state. Only the active scanner enqueues work for
//! automatic sweeps, resumes and DB changes, and reclaims storage.

mod brief;
mod task;

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use chrono::{DateTime, Utc};
use scanplane_model::{
    CveDbInfo, IdName, ScanBrief, ScanErrorCode, ScanObjectType, ScanReport, ScanResult,
    ScanState, ScanStatus, ScanStatusSummary, Vulnerability,
};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use crate::error::{Result, ScanError};
use crate::leadership::ScannerRole;
use crate::profile::{
    ProfileStore, VulTrait, VulnerabilityProfileFilter, extract_vul_traits, gather_vul_traits,
};
use crate::scheduler::{SchedulerTask, TaskAction, TaskPriority, TaskScheduler};
use crate::store::ClusterStore;

pub use task::ObjectScanHandler;

/// Id of the platform singleton.
pub const PLATFORM_ID: &str = "platform";

/// Controller-local status. Only the intent is persisted.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum ObjectStatus {
    #[default]
    None,
    Scheduled,
    Scanning,
}

/// Scheduler record for one object scan.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ObjectScanTask {
    pub id: String,
    pub priority: TaskPriority,
}

impl ObjectScanTask {
    pub fn new(id: impl Into<String>, priority: TaskPriority) -> Self {
        Self {
            id: id.into(),
            priority,
        }
    }
}

impl SchedulerTask for ObjectScanTask {
    fn key(&self) -> String {
        self.id.clone()
    }

    fn priority(&self) -> TaskPriority {
        self.priority
    }
}

#[derive(Clone, Debug)]
pub struct ScanInfo {
    pub agent_id: String,
    pub kind: ScanObjectType,
    pub status: ObjectStatus,
    pub priority: TaskPriority,
    pub retry: u32,
    pub last_result: ScanErrorCode,
    /// `None` until a scan outcome has been recorded.
    pub last_scan_time: Option<DateTime<Utc>>,
    pub base_os: String,
    pub version: String,
    pub cve_db_create_time: String,
    /// Consumer scopes used when filtering this object's vulnerabilities.
    pub idns: Vec<IdName>,
    pub vul_traits: Vec<VulTrait>,
    pub high_vuls: Vec<String>,
    pub med_vuls: Vec<String>,
    pub filtered_time: Option<DateTime<Utc>>,
}

impl ScanInfo {
    fn new(agent_id: &str, kind: ScanObjectType, idns: Vec<IdName>) -> Self {
        Self {
            agent_id: agent_id.to_string(),
            kind,
            status: ObjectStatus::None,
            priority: TaskPriority::Low,
            retry: 0,
            last_result: ScanErrorCode::None,
            last_scan_time: None,
            base_os: String::new(),
            version: String::new(),
            cve_db_create_time: String::new(),
            idns,
            vul_traits: Vec::new(),
            high_vuls: Vec::new(),
            med_vuls: Vec::new(),
            filtered_time: None,
        }
    }

    fn schedule(&mut self, priority: TaskPriority) {
        self.status = ObjectStatus::Scheduled;
        self.priority = priority;
    }

    fn refilter(&mut self, filter: &VulnerabilityProfileFilter) {
        filter.filter_vul_traits(&mut self.vul_traits, &self.idns);
        let (highs, meds) = gather_vul_traits(&self.vul_traits);
        self.high_vuls = highs;
        self.med_vuls = meds;
        self.filtered_time = Some(Utc::now());
    }
}

struct ObjectTable {
    objects: HashMap<String, ScanInfo>,
    db: CveDbInfo,
}

struct ObjectStoreInner {
    table: Mutex<ObjectTable>,
    auto_scan: AtomicBool,
    scheduler: TaskScheduler<ObjectScanTask>,
    store: ClusterStore,
    role: Arc<dyn ScannerRole>,
    profiles: ProfileStore,
}

/// Cloneable handle to the object scan table.
#[derive(Clone)]
pub struct ScanObjectStore {
    inner: Arc<ObjectStoreInner>,
}

impl fmt::Debug for ScanObjectStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let object_count = self
            .inner
            .table
            .try_lock()
            .map(|table| table.objects.len())
            .unwrap_or_default();
        f.debug_struct("ScanObjectStore")
            .field("object_count", &object_count)
            .field("auto_scan", &self.auto_scan())
            .field("scheduler", &self.inner.scheduler)
            .field("role", &self.inner.role)
            .finish()
    }
}

impl ScanObjectStore {
    pub fn new(
        store: ClusterStore,
        scheduler: TaskScheduler<ObjectScanTask>,
        role: Arc<dyn ScannerRole>,
        profiles: ProfileStore,
    ) -> Self {
        Self {
            inner: Arc::new(ObjectStoreInner {
                table: Mutex::new(ObjectTable {
                    objects: HashMap::new(),
                    db: CveDbInfo::default(),
                }),
                auto_scan: AtomicBool::new(false),
                scheduler,
                store,
                role,
                profiles,
            }),
        }
    }

    pub fn scheduler(&self) -> &TaskScheduler<ObjectScanTask> {
        &self.inner.scheduler
    }

    pub fn auto_scan(&self) -> bool {
        self.inner.auto_scan.load(Ordering::SeqCst)
    }

    fn is_scanner(&self) -> bool {
        self.inner.role.is_scanner()
    }

    /// Seed the auto-scan flag at startup without sweeping.
    pub fn init_auto_scan(&self, enabled: bool) {
        self.inner.auto_scan.store(enabled, Ordering::SeqCst);
    }

    pub async fn get(&self, id: &str) -> Option<ScanInfo> {
        self.inner.table.lock().await.objects.get(id).cloned()
    }

    pub async fn len(&self) -> usize {
        self.inner.table.lock().await.objects.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    async fn put_state(&self, kind: ScanObjectType, id: &str, status: ScanStatus) {
        if let Err(err) = self
            .inner
            .store
            .put_object_state(kind, id, &ScanState::new(status))
            .await
        {
            tracing::warn!(target: "scan::object", id, %status, error = %err, "failed to persist scan state");
        }
    }

    async fn enqueue(&self, id: &str, priority: TaskPriority, front: bool) -> bool {
        self.inner
            .scheduler
            .add_task(ObjectScanTask::new(id, priority), front)
            .await
    }

    pub async fn add(&self, id: &str, agent_id: &str, kind: ScanObjectType) -> Result<()> {
        self.add_with_scope(id, agent_id, kind, Vec::new()).await
    }

    /// Containers should pass their domain as scope so profile entries
    /// scoped by namespace apply to them.
    pub async fn add_with_scope(
        &self,
        id: &str,
        agent_id: &str,
        kind: ScanObjectType,
        idns: Vec<IdName>,
    ) -> Result<()> {
        let mut table = self.inner.table.lock().await;
        if let Some(info) = table.objects.get_mut(id) {
            info.agent_id = agent_id.to_string();
            return Ok(());
        }
        table
            .objects
            .insert(id.to_string(), ScanInfo::new(agent_id, kind, idns));

        // Objects scanned before this controller started are caught up from
        // their persisted state, never rescanned.
        if let Some(state) = self.inner.store.object_state(kind, id).await? {
            drop(table);
            tracing::debug!(target: "scan::object", id, status = %state.status, "loaded persisted scan state");
            return self.handle_state(kind, id, Some(state)).await;
        }

        if !self.is_scanner() {
            return Ok(());
        }
        let priority = match kind {
            ScanObjectType::Platform => TaskPriority::High,
            _ if self.auto_scan() => TaskPriority::Low,
            _ => return Ok(()),
        };
        if let Some(info) = table.objects.get_mut(id) {
            info.schedule(priority);
        }
        let front = priority == TaskPriority::High;
        self.enqueue(id, priority, front).await;
        self.put_state(kind, id, ScanStatus::Scheduled).await;
        tracing::debug!(target: "scan::object", id, %kind, %priority, "new object scheduled");
        Ok(())
    }

    pub async fn update_agent(&self, id: &str, agent_id: &str) {
        if let Some(info) = self.inner.table.lock().await.objects.get_mut(id) {
            info.agent_id = agent_id.to_string();
        }
    }

    /// On-demand scan at High priority. A Low-priority queued entry is
    /// moved so it overtakes the Low backlog.
    pub async fn request_scan(&self, id: &str) -> Result<()> {
        let mut table = self.inner.table.lock().await;
        let Some(info) = table.objects.get_mut(id) else {
            tracing::error!(target: "scan::object", id, "scan object not found");
            return Err(ScanError::NotFound(format!("scan object {id}")));
        };
        let kind = info.kind;
        match info.status {
            ObjectStatus::None => {
                info.schedule(TaskPriority::High);
                self.enqueue(id, TaskPriority::High, false).await;
                self.put_state(kind, id, ScanStatus::Scheduled).await;
            }
            ObjectStatus::Scheduled | ObjectStatus::Scanning => {
                info.priority = TaskPriority::High;
                if self.inner.scheduler.delete_task(id, TaskPriority::Low).await {
                    self.enqueue(id, TaskPriority::High, false).await;
                    self.put_state(kind, id, ScanStatus::Scheduled).await;
                }
            }
        }
        tracing::info!(target: "scan::object", id, %kind, "scan requested");
        Ok(())
    }

    pub async fn delete(&self, id: &str) -> Result<()> {
        let removed = self.inner.table.lock().await.objects.remove(id);
        let Some(info) = removed else {
            return Ok(());
        };
        self.inner.scheduler.delete_task(id, info.priority).await;
        if self.is_scanner() {
            self.inner.store.delete_object(info.kind, id).await?;
        }
        tracing::debug!(target: "scan::object", id, kind = %info.kind, "scan object removed");
        Ok(())
    }

    /// Apply a scan configuration change.
    pub async fn set_auto_scan(&self, enabled: bool) {
        match (self.auto_scan(), enabled) {
            (false, true) => self.enable_auto_scan().await,
            (true, false) => self.disable_auto_scan().await,
            _ => {}
        }
    }

    pub async fn enable_auto_scan(&self) {
        self.inner.auto_scan.store(true, Ordering::SeqCst);
        if !self.is_scanner() {
            return;
        }

        let ids: Vec<String> = {
            let table = self.inner.table.lock().await;
            table.objects.keys().cloned().collect()
        };
        let mut queued = 0usize;
        for id in ids {
            if !self.auto_scan() {
                break;
            }
            let mut table = self.inner.table.lock().await;
            let Some(info) = table.objects.get_mut(&id) else {
                continue;
            };
            if info.status == ObjectStatus::Scheduled {
                continue;
            }
            if info.status == ObjectStatus::Scanning {
                self.inner.scheduler.delete_task(&id, TaskPriority::Low).await;
            }
            if self.enqueue(&id, TaskPriority::Low, false).await {
                info.schedule(TaskPriority::Low);
                info.retry = 0;
                let kind = info.kind;
                self.put_state(kind, &id, ScanStatus::Scheduled).await;
                queued += 1;
            }
        }
        tracing::info!(target: "scan::object", queued, "auto-scan enabled");
    }

    pub async fn disable_auto_scan(&self) {
        self.inner.auto_scan.store(false, Ordering::SeqCst);
        if !self.is_scanner() {
            return;
        }

        let mut table = self.inner.table.lock().await;
        let mut reverted = 0usize;
        for (id, info) in table.objects.iter_mut() {
            if info.status == ObjectStatus::Scheduled && info.priority == TaskPriority::Low {
                info.status = ObjectStatus::None;
                info.retry = 0;
                self.put_state(info.kind, id, ScanStatus::Idle).await;
                reverted += 1;
            }
        }
        let dropped = self.inner.scheduler.clear_task_queue(TaskPriority::Low).await;
        tracing::info!(target: "scan::object", reverted, dropped, "auto-scan disabled");
    }

    /// Record a new CVE database and rescan objects scanned with an older
    /// one when auto-scan is on.
    pub async fn scanner_db_change(&self, db: CveDbInfo) {
        let mut table = self.inner.table.lock().await;
        let version = db.version.clone();
        table.db = db;
        if !self.is_scanner() || !self.auto_scan() {
            return;
        }

        let mut queued = 0usize;
        for (id, info) in table.objects.iter_mut() {
            if info.status == ObjectStatus::None && info.version != version {
                info.schedule(TaskPriority::Low);
                info.retry = 0;
                self.enqueue(id, TaskPriority::Low, false).await;
                self.put_state(info.kind, id, ScanStatus::Scheduled).await;
                queued += 1;
            }
        }
        tracing::info!(target: "scan::object", version, queued, "scanner database changed");
    }

    /// Requeue everything left mid-flight by the previous scanner.
    pub async fn become_scanner(&self) {
        let mut table = self.inner.table.lock().await;
        let mut queued = 0usize;
        for (id, info) in table.objects.iter_mut() {
            if info.status == ObjectStatus::None {
                continue;
            }
            let priority = info.priority;
            info.schedule(priority);
            self.enqueue(id, priority, priority == TaskPriority::High)
                .await;
            self.put_state(info.kind, id, ScanStatus::Scheduled).await;
            queued += 1;
        }
        tracing::info!(target: "scan::object", queued, "resumed object scans as scanner");
    }

    /// React to a persisted scan state change. Tolerates re-delivery.
    pub async fn handle_state(
        &self,
        kind: ScanObjectType,
        id: &str,
        state: Option<ScanState>,
    ) -> Result<()> {
        let Some(state) = state else {
            return Ok(());
        };
        {
            let mut table = self.inner.table.lock().await;
            let Some(info) = table.objects.get_mut(id) else {
                return Ok(());
            };
            match state.status {
                ScanStatus::Scheduled => {
                    info.status = ObjectStatus::Scheduled;
                    return Ok(());
                }
                ScanStatus::Idle => {
                    info.status = ObjectStatus::None;
                    return Ok(());
                }
                ScanStatus::Scanning => {
                    info.status = ObjectStatus::Scanning;
                    return Ok(());
                }
                ScanStatus::Finished | ScanStatus::Failed => {}
            }
        }

        match self.inner.store.object_report(kind, id).await? {
            Some(report) => self.scan_done(id, &report).await,
            None if state.status == ScanStatus::Failed => {
                if let Some(info) = self.inner.table.lock().await.objects.get_mut(id) {
                    info.status = ObjectStatus::None;
                    info.retry = 0;
                }
            }
            None => {
                tracing::warn!(target: "scan::object", id, "finished state without a report");
            }
        }
        Ok(())
    }

    /// Fold a report into the local cache. Runs on every controller.
    pub async fn scan_done(&self, id: &str, report: &ScanReport) {
        let filter = self.inner.profiles.current().await;
        let mut table = self.inner.table.lock().await;
        let Some(info) = table.objects.get_mut(id) else {
            tracing::debug!(target: "scan::object", id, "scan object is gone");
            return;
        };
        let result = &report.result;
        info.status = ObjectStatus::None;
        info.retry = 0;
        info.last_result = result.error;
        info.last_scan_time = Some(report.scanned_at);
        info.base_os = result.namespace.clone();
        info.version = result.version.clone();
        info.cve_db_create_time = result.cve_db_create_time.clone();
        info.vul_traits = extract_vul_traits(&result.vulnerabilities);
        info.refilter(&filter);
        tracing::debug!(
            target: "scan::object",
            id,
            result = %result.error,
            high = info.high_vuls.len(),
            medium = info.med_vuls.len(),
            "scan done"
        );
    }

    /// Mark an object Scanning before its RPC starts.
    pub(crate) async fn mark_scanning(&self, id: &str) -> Option<(ScanObjectType, String)> {
        let mut table = self.inner.table.lock().await;
        let info = table.objects.get_mut(id)?;
        info.status = ObjectStatus::Scanning;
        let picked = (info.kind, info.agent_id.clone());
        self.put_state(picked.0, id, ScanStatus::Scanning).await;
        Some(picked)
    }

    /// Persist an RPC outcome, or schedule a retry when the scanner gave
    /// no usable answer.
    pub(crate) async fn complete_scan(
        &self,
        id: &str,
        result: Option<ScanResult>,
        max_retry: u32,
    ) -> TaskAction {
        let auto_scan = self.auto_scan();
        let mut table = self.inner.table.lock().await;
        let Some(info) = table.objects.get_mut(id) else {
            tracing::debug!(target: "scan::object", id, "scan object is gone, dropping result");
            return TaskAction::Done;
        };
        let kind = info.kind;

        let mut result = match result {
            Some(result) => result,
            None => {
                if (info.priority == TaskPriority::High || auto_scan) && info.retry < max_retry {
                    info.retry += 1;
                    info.status = ObjectStatus::Scheduled;
                    info.last_result = ScanErrorCode::Timeout;
                    info.last_scan_time = Some(Utc::now());
                    tracing::warn!(target: "scan::task", id, %kind, retry = info.retry, "no usable response, requeue");
                    self.put_state(kind, id, ScanStatus::Scheduled).await;
                    return TaskAction::Requeue;
                }
                ScanResult::from_error(ScanErrorCode::Timeout)
            }
        };
        if result.error.is_benign() {
            result.error = ScanErrorCode::None;
        }

        let report = ScanReport::new(result);
        match self.inner.store.put_object_report(kind, id, &report).await {
            Ok(()) => self.put_state(kind, id, ScanStatus::Finished).await,
            Err(err) => {
                tracing::error!(target: "scan::task", id, error = %err, "failed to store scan report");
                self.put_state(kind, id, ScanStatus::Failed).await;
            }
        }
        TaskAction::Done
    }

    /// Re-filter scanned idle objects whose traits predate `filter`.
    pub async fn refresh(&self, filter: Arc<VulnerabilityProfileFilter>, cancel: CancellationToken) {
        let ids: Vec<String> = {
            let table = self.inner.table.lock().await;
            table.objects.keys().cloned().collect()
        };
        let mut refreshed = 0usize;
        for id in ids {
            if cancel.is_cancelled() {
                tracing::debug!(target: "scan::profile", refreshed, "object refresh cancelled");
                return;
            }
            let mut table = self.inner.table.lock().await;
            let Some(info) = table.objects.get_mut(&id) else {
                continue;
            };
            let stale = info
                .filtered_time
                .is_none_or(|filtered| filter.updated_at() > filtered);
            if info.status == ObjectStatus::None && info.last_scan_time.is_some() && stale {
                info.refilter(&filter);
                refreshed += 1;
            }
        }
        tracing::debug!(target: "scan::profile", refreshed, "object refresh finished");
    }

    pub async fn status_summary(&self) -> ScanStatusSummary {
        let table = self.inner.table.lock().await;
        let mut summary = ScanStatusSummary {
            cve_db_version: table.db.version.clone(),
            cve_db_create_time: table.db.create_time.clone(),
            ..ScanStatusSummary::default()
        };
        for info in table.objects.values() {
            match info.status {
                ObjectStatus::Scheduled => summary.scheduled += 1,
                ObjectStatus::Scanning => summary.scanning += 1,
                ObjectStatus::None if info.last_scan_time.is_some() => summary.scanned += 1,
                ObjectStatus::None => {}
            }
        }
        summary
    }

    pub async fn brief(&self, id: &str) -> Option<ScanBrief> {
        let table = self.inner.table.lock().await;
        table.objects.get(id).map(brief::fill_brief)
    }

    /// The object's vulnerabilities after profile filtering. Suppressed
    /// entries are dropped, or kept and tagged with `show_tag`.
    pub async fn vulnerability_report(
        &self,
        id: &str,
        show_tag: Option<&str>,
    ) -> Result<Vec<Vulnerability>> {
        let (kind, idns) = {
            let table = self.inner.table.lock().await;
            let info = table
                .objects
                .get(id)
                .ok_or_else(|| ScanError::NotFound(format!("scan object {id}")))?;
            (info.kind, info.idns.clone())
        };
        let report = self
            .inner
            .store
            .object_report(kind, id)
            .await?
            .ok_or_else(|| ScanError::NotFound(format!("scan report {id}")))?;
        let filter = self.inner.profiles.current().await;
        Ok(filter.filter_vulnerabilities(report.result.vulnerabilities, &idns, show_tag))
    }
}
