use std::fmt;

use async_trait::async_trait;
use scanplane_model::{ScanErrorCode, ScanResult};

use crate::config::RegistryScanConfig;
use crate::scheduler::{TaskAction, TaskHandler};

use super::schedule::ScanTarget;
use super::{Registry, RegistryImageTask, RegistryService};

/// Runs registry image scans for the registry scheduler.
#[derive(Clone)]
pub struct RegistryImageHandler {
    service: RegistryService,
    config: RegistryScanConfig,
}

impl fmt::Debug for RegistryImageHandler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RegistryImageHandler")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl RegistryImageHandler {
    pub fn new(service: RegistryService, config: RegistryScanConfig) -> Self {
        Self { service, config }
    }

    async fn run(
        self,
        registry: Registry,
        mut task: RegistryImageTask,
        processor: String,
        target: ScanTarget,
    ) {
        let driver = registry.scan_driver().await;
        tracing::debug!(target: "scan::task", registry = %task.registry, id = %target.image_id, repo = %target.repo, tag = %target.tag, %processor, "image scan started");

        let scan = driver.scan_image(
            &processor,
            &target.image_id,
            &target.repo,
            &target.tag,
            self.config.request_timeout(),
        );
        let result = tokio::select! {
            _ = task.scan.token.cancelled() => {
                tracing::debug!(target: "scan::task", registry = %task.registry, id = %target.image_id, "image scan cancelled");
                ScanResult::from_error(ScanErrorCode::Timeout)
            }
            result = tokio::time::timeout(self.config.safety_timeout(), scan) => match result {
                Ok(result) => result,
                Err(_) => {
                    tracing::warn!(target: "scan::task", registry = %task.registry, id = %target.image_id, "image scan hit the safety timeout");
                    ScanResult::from_error(ScanErrorCode::Timeout)
                }
            },
        };

        let action = if task.scan.is_cancelled() {
            TaskAction::Done
        } else if result.error.is_transient() && task.retries < self.config.max_retry {
            task.retries += 1;
            tracing::info!(target: "scan::task", registry = %task.registry, id = %target.image_id, error = %result.error, retries = task.retries, "retry image scan");
            TaskAction::Requeue
        } else {
            TaskAction::Done
        };
        if !result.error.is_none() {
            tracing::warn!(target: "scan::task", registry = %task.registry, id = %target.image_id, error = %result.error, "image scan failed");
        }

        let remaining = registry
            .check_and_put_image_result(&task.scan, &target.image_id, result, action)
            .await;
        tracing::debug!(target: "scan::task", registry = %task.registry, id = %target.image_id, ?remaining, "image scan done");
        self.service.scheduler().task_done(task, action).await;
        if remaining.is_none() {
            registry.reclaim_image(&target.image_id).await;
        }
    }
}

#[async_trait]
impl TaskHandler<RegistryImageTask> for RegistryImageHandler {
    async fn handle(&self, task: RegistryImageTask, processor: &str) -> TaskAction {
        let Some(registry) = self.service.lookup(&task.registry).await else {
            tracing::debug!(target: "scan::task", registry = %task.registry, id = %task.image_id, "registry gone");
            return TaskAction::Done;
        };
        let Some(target) = registry.mark_image_scanning(&task).await else {
            if !task.scan.is_cancelled() {
                return TaskAction::Done;
            }
            // Release the key first so the running pass can take the image.
            let id = task.image_id.clone();
            self.service.scheduler().task_done(task, TaskAction::Done).await;
            registry.reclaim_image(&id).await;
            return TaskAction::Wait;
        };
        tokio::spawn(self.clone().run(registry, task, processor.to_string(), target));
        TaskAction::Wait
    }
}
