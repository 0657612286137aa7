use std::collections::BTreeSet;
use std::collections::HashMap;

use chrono::Utc;
use scanplane_model::{
    ImageRef, ImageSummary, RegistryConfig, RegistryState, RegistryStatus, ScanErrorCode,
    ScanFlags, ScanReport, ScanResult, ScanStatus,
};

use crate::scheduler::{TaskAction, TaskPriority};

use super::discovery::{DiscoveredImages, ImageMeta, TagFilter};
use super::driver::RegistryDriver;
use super::{Registry, RegistryContent, RegistryImageTask, ScanContext, image_task_key};

/// An already scanned image needs no new scan when every enabled facet has
/// completed and, with rescan-after-update on, the CVE database is unchanged.
pub(super) fn skip_scan(sum: &ImageSummary, config: &RegistryConfig, db_version: &str) -> bool {
    if sum.status != ScanStatus::Finished {
        return false;
    }
    if config.rescan_after_db_update && sum.version != db_version {
        return false;
    }
    if !sum.scan_flags.contains(ScanFlags::CVE) {
        return false;
    }
    if config.scan_layers && !sum.scan_flags.contains(ScanFlags::LAYERS) {
        return false;
    }
    if !config.disable_files && !sum.scan_flags.contains(ScanFlags::FILES) {
        return false;
    }
    true
}

/// What a dispatched image task scans.
#[derive(Clone, Debug)]
pub(super) struct ScanTarget {
    pub image_id: String,
    pub repo: String,
    pub tag: String,
}

impl Registry {
    pub(super) async fn put_summary(&self, sum: &ImageSummary) {
        if let Err(err) = self
            .deps()
            .store
            .put_image_summary(self.name(), sum)
            .await
        {
            tracing::warn!(target: "scan::registry", registry = self.name(), id = %sum.image_id, error = %err, "failed to persist image summary");
        }
    }

    /// Local tables follow once the deletion is observed.
    pub(super) async fn delete_image_keys(&self, id: &str) {
        if let Err(err) = self.deps().store.delete_image(self.name(), id).await {
            tracing::warn!(target: "scan::registry", registry = self.name(), id, error = %err, "failed to delete image");
        }
    }

    pub(super) async fn put_state(&self, state: &RegistryState) {
        if let Err(err) = self
            .deps()
            .store
            .put_registry_state(self.name(), state)
            .await
        {
            tracing::warn!(target: "scan::registry", registry = self.name(), error = %err, "failed to persist registry state");
        }
    }

    pub(super) async fn put_idle(&self, content: &RegistryContent) {
        let state = RegistryState {
            status: RegistryStatus::Idle,
            started_at: content.state.started_at,
            ..RegistryState::default()
        };
        self.put_state(&state).await;
    }

    /// Returns `false` when the scheduler already holds a task for the
    /// image; the image is then left out of this pass's task queue.
    pub(super) async fn enqueue(&self, content: &mut RegistryContent, scan: &ScanContext, id: &str) -> bool {
        let accepted = self
            .deps()
            .scheduler
            .add_task(RegistryImageTask::new(self.name(), id, scan), false)
            .await;
        if accepted {
            content.task_queue.insert(id.to_string());
        } else {
            tracing::debug!(target: "scan::registry", registry = self.name(), id, "image task still pending in scheduler");
        }
        accepted
    }

    /// Offer an image back to the running pass after a task left over from
    /// a cancelled pass released its key.
    pub(super) async fn reclaim_image(&self, id: &str) -> bool {
        let mut content = self.lock().await;
        let Some(scan) = content.scan.clone() else {
            return false;
        };
        if scan.is_cancelled() || content.task_queue.contains(id) {
            return false;
        }
        if !content
            .summary
            .get(id)
            .is_some_and(|sum| sum.status == ScanStatus::Scheduled)
        {
            return false;
        }
        tracing::debug!(target: "scan::registry", registry = self.name(), id, "reschedule image released by a cancelled pass");
        self.enqueue(&mut content, &scan, id).await
    }

    /// Resolve each expanded tag and diff it against the summary table,
    /// scheduling new or outdated content.
    pub(super) async fn schedule_scan_images(
        &self,
        scan: &ScanContext,
        driver: &dyn RegistryDriver,
        expanded: &[(TagFilter, Vec<String>)],
    ) -> DiscoveredImages {
        let registry = self.name();
        let db_version = self.deps().db().await.version;
        let mut found = DiscoveredImages::default();

        for (itf, tags) in expanded {
            for tag in tags {
                let info = match driver.get_image_meta(&itf.domain, &itf.repo, tag).await {
                    Ok(info) => info,
                    Err(code) => {
                        tracing::debug!(target: "scan::discovery", registry, repo = %itf.repo, tag, error = %code, "failed to get image info");
                        continue;
                    }
                };
                found.total += 1;

                let image = ImageRef::new(itf.domain.clone(), itf.repo.clone(), tag.clone());
                let new_in_pass = !found.images.contains_key(&info.id);
                found
                    .images
                    .entry(info.id.clone())
                    .or_default()
                    .insert(image.clone());

                let mut content = self.lock().await;
                if scan.is_cancelled() {
                    tracing::debug!(target: "scan::registry", registry, "pass cancelled during discovery");
                    return found;
                }
                let existing = content.summary.get(&info.id).cloned();
                let schedule = match existing {
                    Some(mut sum) => {
                        let changed = !sum.images.contains(&image);
                        if changed {
                            sum.images.push(image.clone());
                        }
                        let skip = if !new_in_pass {
                            true
                        } else if skip_scan(&sum, &content.config, &db_version) {
                            tracing::debug!(target: "scan::registry", registry, %image, version = %sum.version, "skip scanned image");
                            true
                        } else if sum.status == ScanStatus::Scheduled
                            && content.task_queue.contains(&info.id)
                        {
                            tracing::debug!(target: "scan::registry", registry, %image, "image already scheduled");
                            true
                        } else {
                            false
                        };
                        if !skip {
                            sum.status = ScanStatus::Scheduled;
                        }
                        if changed || !skip {
                            self.put_summary(&sum).await;
                        }
                        content.index_summary(&info.id, sum);
                        !skip
                    }
                    None => {
                        let sum = ImageSummary {
                            image_id: info.id.clone(),
                            registry: content.config.registry.clone(),
                            reg_name: registry.to_string(),
                            digest: info.digest.clone(),
                            images: vec![image.clone()],
                            status: ScanStatus::Scheduled,
                            size: info.size,
                            author: info.author.clone(),
                            ..ImageSummary::default()
                        };
                        self.put_summary(&sum).await;
                        content.index_summary(&info.id, sum);
                        true
                    }
                };

                if schedule {
                    tracing::debug!(target: "scan::registry", registry, %image, id = %info.id, "schedule image scan");
                    self.enqueue(&mut content, scan, &info.id).await;
                }
            }
        }
        found
    }

    /// Fold images resolved outside a full pass into the running pass.
    pub(super) async fn schedule_on_demand(
        &self,
        content: &mut RegistryContent,
        scan: &ScanContext,
        metas: HashMap<String, ImageMeta>,
    ) {
        let registry = self.name();
        let db_version = self.deps().db().await.version;
        for meta in metas.into_values() {
            self.remove_image_with_different_id(content, &meta).await;

            let sum = match content.summary.get(&meta.id).cloned() {
                Some(mut sum) => {
                    let mut changed = false;
                    for image in &meta.images {
                        if !sum.images.contains(image) {
                            sum.images.push(image.clone());
                            changed = true;
                        }
                    }
                    if skip_scan(&sum, &content.config, &db_version)
                        || (sum.status == ScanStatus::Scheduled && content.task_queue.contains(&meta.id))
                    {
                        tracing::debug!(target: "scan::registry", registry, id = %meta.id, status = %sum.status, "on-demand image needs no scan");
                        if changed {
                            self.put_summary(&sum).await;
                        }
                        content.index_summary(&meta.id, sum);
                        continue;
                    }
                    sum.status = ScanStatus::Scheduled;
                    sum
                }
                None => ImageSummary {
                    image_id: meta.id.clone(),
                    registry: content.config.registry.clone(),
                    reg_name: registry.to_string(),
                    digest: meta.digest.clone(),
                    images: meta.images.iter().cloned().collect(),
                    status: ScanStatus::Scheduled,
                    ..ImageSummary::default()
                },
            };
            self.put_summary(&sum).await;
            content.index_summary(&meta.id, sum);

            tracing::debug!(target: "scan::registry", registry, id = %meta.id, "schedule on-demand image scan");
            self.enqueue(content, scan, &meta.id).await;
        }
    }

    /// A reference that now resolves to different content is detached from
    /// its old summary; a summary left without references is deleted.
    async fn remove_image_with_different_id(&self, content: &mut RegistryContent, meta: &ImageMeta) {
        for image in &meta.images {
            let Some(old_id) = content.image2id.get(image).cloned() else {
                continue;
            };
            if old_id == meta.id {
                continue;
            }
            if let Some(mut sum) = content.summary.get(&old_id).cloned() {
                tracing::debug!(target: "scan::registry", registry = self.name(), id = %old_id, %image, "remove obsolete image");
                if sum.images.len() == 1 {
                    self.delete_image_keys(&old_id).await;
                } else {
                    sum.images.retain(|e| e != image);
                    self.put_summary(&sum).await;
                    content.index_summary(&old_id, sum);
                }
            }
            content.image2id.remove(image);
        }
    }

    /// Purge content no longer referenced and trim stale references from
    /// the rest.
    pub(super) async fn cleanup_images(&self, content: &mut RegistryContent, found: &DiscoveredImages) {
        let gone: Vec<String> = content
            .summary
            .keys()
            .filter(|id| !found.images.contains_key(*id))
            .cloned()
            .collect();
        for id in &gone {
            self.delete_image_keys(id).await;
        }

        for (id, refs) in &found.images {
            let Some(sum) = content.summary.get(id) else {
                continue;
            };
            let current: BTreeSet<ImageRef> = sum.images.iter().cloned().collect();
            if current != *refs {
                let mut sum = sum.clone();
                sum.images = refs.iter().cloned().collect();
                self.put_summary(&sum).await;
                content.index_summary(id, sum);
            }
        }
        if !gone.is_empty() {
            tracing::info!(target: "scan::registry", registry = self.name(), count = gone.len(), "removed out-of-date images");
        }
    }

    /// Keep at most `persist_image_max` finished summaries, newest first.
    pub(super) async fn cleanup_old_images(&self, content: &RegistryContent) {
        let max = self.deps().config.persist_image_max;
        let mut finished: Vec<&ImageSummary> = content
            .summary
            .values()
            .filter(|sum| sum.status == ScanStatus::Finished)
            .collect();
        if finished.len() <= max {
            return;
        }
        finished.sort_by(|a, b| b.scanned_at.cmp(&a.scanned_at));
        let dels: Vec<String> = finished[max..].iter().map(|s| s.image_id.clone()).collect();
        for id in &dels {
            self.delete_image_keys(id).await;
        }
        tracing::info!(target: "scan::registry", registry = self.name(), count = dels.len(), "remove old images");
    }

    /// Mark the task's image Scanning. `None` means the scan should not run.
    pub(super) async fn mark_image_scanning(&self, task: &RegistryImageTask) -> Option<ScanTarget> {
        if !self.deps().is_scanner() {
            return None;
        }
        let mut content = self.lock().await;
        if task.scan.is_cancelled() {
            // At most one task exists per key, so a queued id is this task's.
            content.task_queue.remove(&task.image_id);
            return None;
        }
        let target = match content.summary.get_mut(&task.image_id) {
            Some(sum) if !sum.images.is_empty() => {
                sum.status = ScanStatus::Scanning;
                let first = &sum.images[0];
                Some((
                    sum.clone(),
                    ScanTarget {
                        image_id: sum.image_id.clone(),
                        repo: first.repo.clone(),
                        tag: first.tag.clone(),
                    },
                ))
            }
            _ => None,
        };
        match target {
            Some((sum, target)) => {
                self.put_summary(&sum).await;
                Some(target)
            }
            None => {
                content.task_queue.remove(&task.image_id);
                if content.task_queue.is_empty() && !task.scan.is_scheduling() {
                    self.put_idle(&content).await;
                }
                None
            }
        }
    }

    /// Record an image scan outcome. Returns the number of images still
    /// queued, or `None` when the pass was cancelled meanwhile.
    pub(super) async fn check_and_put_image_result(
        &self,
        scan: &ScanContext,
        id: &str,
        result: ScanResult,
        action: TaskAction,
    ) -> Option<usize> {
        let mut content = self.lock().await;
        if scan.is_cancelled() {
            return None;
        }
        if action != TaskAction::Requeue {
            content.task_queue.remove(id);
        }

        if let Some(mut sum) = content.summary.get(id).cloned() {
            let scanned_at = Utc::now();
            sum.scanned_at = Some(scanned_at);
            sum.base_os = result.namespace.clone();
            sum.version = result.version.clone();
            sum.result = result.error;
            sum.status = match result.error {
                ScanErrorCode::None | ScanErrorCode::NotSupport => ScanStatus::Finished,
                _ if action == TaskAction::Requeue => ScanStatus::Scheduled,
                _ => ScanStatus::Failed,
            };
            sum.author = result.author.clone();
            sum.size = result.size;

            if sum.status == ScanStatus::Finished {
                sum.scan_flags.insert(ScanFlags::CVE);
                if !result.layers.is_empty() {
                    sum.scan_flags.insert(ScanFlags::LAYERS);
                }
                if result.secrets.is_some() {
                    sum.scan_flags.insert(ScanFlags::FILES);
                }
                let report = ScanReport {
                    scanned_at,
                    result,
                };
                if let Err(err) = self
                    .deps()
                    .store
                    .put_image_summary_and_report(self.name(), &sum, &report)
                    .await
                {
                    tracing::error!(target: "scan::registry", registry = self.name(), id, error = %err, "failed to store image report");
                }
                content.index_summary(id, sum);

                let limit = self.deps().config.persist_image_max + self.deps().config.persist_image_extra;
                if content.summary.len() > limit {
                    self.cleanup_old_images(&content).await;
                }
            } else {
                self.put_summary(&sum).await;
                content.index_summary(id, sum);
            }
        }

        let count = content.task_queue.len();
        if count == 0 && !scan.is_scheduling() && action != TaskAction::Requeue {
            tracing::info!(target: "scan::registry", registry = self.name(), "registry scan done");
            self.put_idle(&content).await;
        }
        Some(count)
    }

    /// Returns whether the pass should continue. A non-empty `err_msg` ends
    /// it with the error recorded on the registry.
    pub(super) async fn check_and_put_reg_state(&self, scan: &ScanContext, err_msg: &str) -> bool {
        let content = self.lock().await;
        if scan.is_cancelled() {
            return false;
        }
        if !err_msg.is_empty() {
            let state = RegistryState {
                status: RegistryStatus::Idle,
                err_msg: err_msg.to_string(),
                err_detail: content.err_detail.clone(),
                started_at: content.state.started_at,
            };
            self.put_state(&state).await;
            return false;
        }
        true
    }

    /// Drop every queued task of this registry from the scheduler.
    pub(super) async fn drop_queued_tasks(&self, content: &mut RegistryContent) {
        for id in content.task_queue.drain() {
            self.deps()
                .scheduler
                .delete_task(&image_task_key(self.name(), &id), TaskPriority::Low)
                .await;
        }
    }
}
