use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use scanplane_model::{ScanErrorCode, ScanObjectType, ScanResult};

use crate::config::ObjectScanConfig;
use crate::scanner::ScannerRpc;
use crate::scheduler::{TaskAction, TaskHandler};

use super::{ObjectScanTask, ScanObjectStore};

/// Runs object scans for the object scheduler. The RPC runs on its own task
/// so the dispatcher can keep feeding other processors.
#[derive(Clone)]
pub struct ObjectScanHandler {
    objects: ScanObjectStore,
    rpc: Arc<dyn ScannerRpc>,
    config: ObjectScanConfig,
}

impl fmt::Debug for ObjectScanHandler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ObjectScanHandler")
            .field("rpc", &self.rpc)
            .field("config", &self.config)
            .finish()
    }
}

impl ObjectScanHandler {
    pub fn new(objects: ScanObjectStore, rpc: Arc<dyn ScannerRpc>, config: ObjectScanConfig) -> Self {
        Self {
            objects,
            rpc,
            config,
        }
    }

    async fn call(
        &self,
        processor: &str,
        kind: ScanObjectType,
        agent_id: &str,
        id: &str,
    ) -> Option<ScanResult> {
        let timeout = self.config.request_timeout();
        let call = async {
            match kind {
                ScanObjectType::Container => {
                    self.rpc.scan_workload(processor, agent_id, id, timeout).await
                }
                ScanObjectType::Host => self.rpc.scan_host(processor, agent_id, id, timeout).await,
                ScanObjectType::Platform | ScanObjectType::Image => {
                    self.rpc.scan_platform(processor, timeout).await
                }
            }
        };

        match tokio::time::timeout(self.config.safety_timeout(), call).await {
            Ok(Ok(result)) if result.error == ScanErrorCode::Network => {
                tracing::warn!(target: "scan::task", id, processor, "scanner reported a network error");
                None
            }
            Ok(Ok(result)) => Some(result),
            Ok(Err(err)) => {
                tracing::warn!(target: "scan::task", id, processor, error = %err, "scan RPC failed");
                None
            }
            Err(_) => {
                tracing::warn!(target: "scan::task", id, processor, "scan RPC hit the safety timeout");
                None
            }
        }
    }

    async fn run(self, task: ObjectScanTask, processor: String, kind: ScanObjectType, agent_id: String) {
        tracing::debug!(target: "scan::task", id = %task.id, %kind, %processor, "scan started");
        let result = self.call(&processor, kind, &agent_id, &task.id).await;
        let action = self
            .objects
            .complete_scan(&task.id, result, self.config.max_retry)
            .await;
        self.objects.scheduler().task_done(task, action).await;
    }
}

#[async_trait]
impl TaskHandler<ObjectScanTask> for ObjectScanHandler {
    async fn handle(&self, task: ObjectScanTask, processor: &str) -> TaskAction {
        if !self.objects.is_scanner() {
            tracing::debug!(target: "scan::task", id = %task.id, "not the scanner, leave object scheduled");
            return TaskAction::Done;
        }
        let Some((kind, agent_id)) = self.objects.mark_scanning(&task.id).await else {
            tracing::error!(target: "scan::task", id = %task.id, "scan object not found");
            return TaskAction::Done;
        };
        tokio::spawn(self.clone().run(task, processor.to_string(), kind, agent_id));
        TaskAction::Wait
    }
}
