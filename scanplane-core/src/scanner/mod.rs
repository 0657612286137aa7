//! Scanner processes: the RPC contract, the address cache and the directory
//! that turns scanner records into scheduler processors.

mod directory;
mod http;

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use scanplane_model::{ScanResult, ScannerRecord};
use serde::{Deserialize, Serialize};

use crate::error::Result;

pub use directory::ScannerDirectory;
pub use http::HttpScannerRpc;

/// Everything a scanner needs to pull and scan one registry image.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ImageScanRequest {
    pub registry: String,
    pub username: String,
    pub password: String,
    pub repository: String,
    pub tag: String,
    pub scan_layers: bool,
    pub scan_secrets: bool,
}

/// Calls into a scanner process. `scanner` names the processor the
/// scheduler assigned.
#[async_trait]
pub trait ScannerRpc: Send + Sync + fmt::Debug {
    async fn scan_workload(
        &self,
        scanner: &str,
        agent_id: &str,
        id: &str,
        timeout: Duration,
    ) -> Result<ScanResult>;

    async fn scan_host(
        &self,
        scanner: &str,
        agent_id: &str,
        id: &str,
        timeout: Duration,
    ) -> Result<ScanResult>;

    async fn scan_platform(&self, scanner: &str, timeout: Duration) -> Result<ScanResult>;

    async fn scan_image(
        &self,
        scanner: &str,
        request: &ImageScanRequest,
        timeout: Duration,
    ) -> Result<ScanResult>;
}

/// Known scanner records by id, shared between the directory and RPC
/// clients that need addresses.
#[derive(Clone, Default)]
pub struct ScannerCache {
    records: Arc<DashMap<String, ScannerRecord>>,
}

impl fmt::Debug for ScannerCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScannerCache")
            .field("count", &self.records.len())
            .finish()
    }
}

impl ScannerCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn upsert(&self, record: ScannerRecord) {
        self.records.insert(record.id.clone(), record);
    }

    pub fn remove(&self, id: &str) -> Option<ScannerRecord> {
        self.records.remove(id).map(|(_, record)| record)
    }

    pub fn get(&self, id: &str) -> Option<ScannerRecord> {
        self.records.get(id).map(|entry| entry.value().clone())
    }

    pub fn address(&self, id: &str) -> Option<String> {
        self.records.get(id).map(|entry| entry.address.clone())
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn all(&self) -> Vec<ScannerRecord> {
        let mut records: Vec<_> = self
            .records
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        records.sort_by(|a, b| a.id.cmp(&b.id));
        records
    }
}
