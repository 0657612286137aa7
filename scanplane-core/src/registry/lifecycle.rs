use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use scanplane_model::{
    ImageRef, RegistryConfig, RegistryState, RegistryStatus, ScanSchedule, ScanStatus,
};
use tokio::time::{Instant, interval_at};
use tokio_util::sync::CancellationToken;

use crate::error::{Result, ScanError};

use super::discovery::{ImageMeta, filter_repos, filter_tags, get_image_meta};
use super::driver::RegistryDriver;
use super::{
    REGISTRY_ERR_AUTH, REGISTRY_ERR_CONNECT, REGISTRY_ERR_IMAGE, Registry, RegistryContent,
    ScanContext,
};

impl Registry {
    /// Log in and launch a discovery pass. Runs with the state lock held.
    pub(super) async fn start_scan(&self, content: &mut RegistryContent) {
        let Some(scan) = self.open_scan(content).await else {
            return;
        };
        tracing::info!(target: "scan::registry", registry = self.name(), "registry scan started");
        self.spawn_pass(scan, Arc::clone(&content.driver));
    }

    /// Re-queue images left pending by a previous scanner. When nothing was
    /// pending a fresh discovery pass is started instead.
    pub(super) async fn resume_scan(&self, content: &mut RegistryContent) {
        let Some(scan) = self.open_scan(content).await else {
            return;
        };
        let pending: Vec<String> = content
            .summary
            .values()
            .filter(|sum| sum.status.is_pending())
            .map(|sum| sum.image_id.clone())
            .collect();
        if pending.is_empty() {
            tracing::info!(target: "scan::registry", registry = self.name(), "nothing to resume, rescan registry");
            self.spawn_pass(scan, Arc::clone(&content.driver));
            return;
        }

        for id in &pending {
            let Some(mut sum) = content.summary.get(id).cloned() else {
                continue;
            };
            sum.status = ScanStatus::Scheduled;
            self.put_summary(&sum).await;
            content.index_summary(id, sum);
            self.enqueue(content, &scan, id).await;
        }
        tracing::info!(target: "scan::registry", registry = self.name(), count = pending.len(), "registry scan resumed");
    }

    /// Log in and install a fresh pass, dropping leftovers of the previous one.
    pub(super) async fn open_scan(&self, content: &mut RegistryContent) -> Option<ScanContext> {
        if let Err(err) = content.driver.login(&content.config).await {
            tracing::error!(target: "scan::registry", registry = self.name(), error = %err, "registry login failed");
            content.err_detail = err.to_string();
            let state = RegistryState {
                started_at: content.state.started_at,
                ..RegistryState::failed(REGISTRY_ERR_CONNECT, content.err_detail.clone())
            };
            self.put_state(&state).await;
            return None;
        }
        content.err_detail.clear();
        self.drop_queued_tasks(content).await;
        let scan = ScanContext::new();
        content.scan = Some(scan.clone());
        Some(scan)
    }

    fn spawn_pass(&self, scan: ScanContext, driver: Arc<dyn RegistryDriver>) {
        let registry = self.clone();
        tokio::spawn(async move { registry.image_scan_start(scan, driver).await });
    }

    /// Cancel the pass and return its pending images to Idle.
    pub(super) async fn stop_scan(&self, content: &mut RegistryContent) {
        if let Some(scan) = content.scan.take() {
            scan.cancel();
        }
        content.driver.logout(false).await;

        let pending: Vec<String> = content
            .summary
            .values()
            .filter(|sum| sum.status.is_pending())
            .map(|sum| sum.image_id.clone())
            .collect();
        for id in &pending {
            if let Some(mut sum) = content.summary.get(id).cloned() {
                sum.reset_to_idle();
                self.put_summary(&sum).await;
                content.index_summary(id, sum);
            }
        }
        self.drop_queued_tasks(content).await;
        tracing::info!(target: "scan::registry", registry = self.name(), reset = pending.len(), "registry scan stopped");
    }

    async fn image_scan_start(&self, scan: ScanContext, driver: Arc<dyn RegistryDriver>) {
        let found = match self.get_scan_images(&scan, driver, false).await {
            Ok(found) => found,
            Err(ScanError::Cancelled(_)) => return,
            Err(err) => {
                let detail = err.to_string();
                let msg = if detail.contains("UNAUTHORIZED") {
                    REGISTRY_ERR_AUTH
                } else {
                    REGISTRY_ERR_IMAGE
                };
                tracing::error!(target: "scan::registry", registry = self.name(), error = %err, "failed to get scan images");
                self.lock().await.err_detail = detail;
                self.check_and_put_reg_state(&scan, msg).await;
                return;
            }
        };
        if !self.check_and_put_reg_state(&scan, "").await {
            return;
        }

        let mut content = self.lock().await;
        if scan.is_cancelled() {
            return;
        }
        self.cleanup_images(&mut content, &found).await;
        tracing::info!(target: "scan::registry", registry = self.name(), images = found.images.len(), total = found.total, queued = content.task_queue.len(), "discovery finished");
        if content.task_queue.is_empty() {
            self.put_idle(&content).await;
        }
    }

    /// React to a persisted state change. The status edge starts or stops
    /// the pass on the active scanner.
    pub(super) async fn apply_state(&self, state: RegistryState) {
        let mut content = self.lock().await;
        let old = content.state.status;
        content.state = state;
        if !self.deps().is_scanner() {
            return;
        }
        match (old, content.state.status) {
            (RegistryStatus::Idle, RegistryStatus::Scanning) => {
                if content.scan.is_none() {
                    self.start_scan(&mut content).await;
                } else {
                    tracing::debug!(target: "scan::registry", registry = self.name(), "scan already running");
                }
            }
            (RegistryStatus::Scanning, RegistryStatus::Idle) => {
                if content.scan.is_some() {
                    self.stop_scan(&mut content).await;
                }
            }
            _ => {}
        }
    }

    /// Take over scanning duties for this registry.
    pub(super) async fn become_scanner(&self) {
        let mut content = self.lock().await;
        if content.state.status == RegistryStatus::Scanning {
            if content.scan.is_none() {
                self.resume_scan(&mut content).await;
            }
        } else if content.config.schedule == ScanSchedule::Auto {
            self.put_state(&RegistryState::scanning()).await;
        }
        if content.config.schedule == ScanSchedule::Periodical && content.poll.is_none() {
            self.start_polling(&mut content);
        }
    }

    /// Replace the configuration of a live registry. Returns whether the
    /// connection identity changed.
    pub(super) async fn apply_config(&self, config: RegistryConfig) -> bool {
        let scanner = self.deps().is_scanner();
        let mut content = self.lock().await;
        let old = std::mem::replace(&mut content.config, config);
        content.state.err_msg.clear();
        content.driver.set_config(&content.config).await;
        content.backup.set_config(&content.config).await;

        let public = content.config.is_public();
        let creds_changed = old.registry != content.config.registry
            || old.credentials_differ(&content.config)
            || public != content.public;
        if creds_changed {
            content.driver.logout(true).await;
            content.backup.logout(true).await;
            if public != content.public {
                content.public = public;
                content.driver = self.deps().drivers.create(&content.config, public);
                content.backup = self.deps().drivers.create(&content.config, public);
            }
            if scanner && content.state.status == RegistryStatus::Scanning {
                tracing::info!(target: "scan::registry", registry = self.name(), "connection changed, stop scan");
                let state = RegistryState {
                    status: RegistryStatus::Idle,
                    started_at: content.state.started_at,
                    ..RegistryState::default()
                };
                self.put_state(&state).await;
            }
        }

        if scanner {
            let was = old.schedule == ScanSchedule::Periodical;
            let now = content.config.schedule == ScanSchedule::Periodical;
            match (was, now) {
                (true, false) => Self::stop_polling(&mut content),
                (false, true) => self.start_polling(&mut content),
                (true, true) if old.poll_period_secs != content.config.poll_period_secs => {
                    self.start_polling(&mut content)
                }
                _ => {}
            }
        }
        creds_changed
    }

    /// Cancel background work before the registry is dropped.
    pub(super) async fn retire(&self) {
        let mut content = self.lock().await;
        if let Some(scan) = content.scan.take() {
            scan.cancel();
            content.driver.logout(true).await;
        }
        Self::stop_polling(&mut content);
        content.backup.logout(true).await;
        self.drop_queued_tasks(&mut content).await;
    }

    /// Stop timers and passes without touching persisted state.
    pub(super) async fn halt(&self) {
        let mut content = self.lock().await;
        if let Some(scan) = content.scan.take() {
            scan.cancel();
        }
        Self::stop_polling(&mut content);
    }

    pub(super) fn start_polling(&self, content: &mut RegistryContent) {
        Self::stop_polling(content);
        let token = CancellationToken::new();
        content.poll = Some(token.clone());
        let period = self
            .deps()
            .config
            .poll_interval(content.config.poll_period_secs);
        tracing::info!(target: "scan::poll", registry = self.name(), period = ?period, "start polling");
        let registry = self.clone();
        tokio::spawn(async move { registry.polling(period, token).await });
    }

    fn stop_polling(content: &mut RegistryContent) {
        if let Some(token) = content.poll.take() {
            token.cancel();
        }
    }

    async fn polling(&self, period: Duration, token: CancellationToken) {
        let mut ticker = interval_at(Instant::now() + period, period);
        loop {
            tokio::select! {
                _ = token.cancelled() => {
                    tracing::debug!(target: "scan::poll", registry = self.name(), "polling stopped");
                    return;
                }
                _ = ticker.tick() => {}
            }
            if !self.deps().is_scanner() {
                continue;
            }
            let _content = self.lock().await;
            match self.deps().store.registry_state(self.name()).await {
                Ok(Some(state)) if state.status == RegistryStatus::Scanning => {
                    tracing::debug!(target: "scan::poll", registry = self.name(), "scan in progress, skip poll");
                }
                Ok(_) => {
                    tracing::debug!(target: "scan::poll", registry = self.name(), "poll triggers scan");
                    self.put_state(&RegistryState::scanning()).await;
                }
                Err(err) => {
                    tracing::warn!(target: "scan::poll", registry = self.name(), error = %err, "failed to read registry state");
                }
            }
        }
    }

    /// Resolve a single added reference through the backup driver.
    pub(super) async fn resolve_image(&self, img: &ImageRef) -> Result<HashMap<String, ImageMeta>> {
        let (config, backup) = {
            let content = self.lock().await;
            (content.config.clone(), Arc::clone(&content.backup))
        };

        let mut itf = None;
        for filter in &config.filters {
            let repo = ImageRef::new(img.domain.clone(), img.repo.clone(), "");
            if !filter_repos(vec![repo], filter, config.scoped_domains(), 0)?.is_empty() {
                itf = Some(ImageRef::new(img.domain.clone(), img.repo.clone(), filter.tag.clone()));
                break;
            }
        }
        let Some(itf) = itf else {
            return Err(ScanError::NotFound(format!("no repository filter matches {img}")));
        };
        let tags = filter_tags(std::slice::from_ref(&img.tag), &itf.tag, 0)?;
        if tags.is_empty() {
            return Err(ScanError::NotFound(format!("no tag filter matches {img}")));
        }

        backup.login(&config).await?;
        let metas = get_image_meta(&ScanContext::new(), backup.as_ref(), &itf, &tags).await;
        backup.logout(false).await;
        let metas = metas?;
        if metas.is_empty() {
            return Err(ScanError::NotFound(format!("no image info for {img}")));
        }
        Ok(metas)
    }

    /// Fold resolved images into the running pass, or start one.
    pub(super) async fn schedule_added(&self, metas: HashMap<String, ImageMeta>) {
        let mut content = self.lock().await;
        let state = match self.deps().store.registry_state(self.name()).await {
            Ok(state) => state,
            Err(err) => {
                tracing::warn!(target: "scan::registry", registry = self.name(), error = %err, "failed to read registry state");
                return;
            }
        };
        match (state, content.scan.clone()) {
            (Some(state), Some(scan)) if state.status == RegistryStatus::Scanning => {
                self.schedule_on_demand(&mut content, &scan, metas).await;
            }
            _ => {
                tracing::debug!(target: "scan::registry", registry = self.name(), "image added, start scan");
                self.put_state(&RegistryState::scanning()).await;
            }
        }
    }

    /// Drop one reference; content left without references is deleted.
    pub(super) async fn image_scan_delete(&self, img: &ImageRef) {
        let mut content = self.lock().await;
        let Some(id) = content.image2id.get(img).cloned() else {
            return;
        };
        let Some(mut sum) = content.summary.get(&id).cloned() else {
            return;
        };
        if sum.images.len() <= 1 {
            tracing::debug!(target: "scan::registry", registry = self.name(), %img, id, "delete image");
            self.delete_image_keys(&id).await;
        } else {
            sum.images.retain(|e| e != img);
            self.put_summary(&sum).await;
            content.index_summary(&id, sum);
        }
    }
}
