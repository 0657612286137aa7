use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use scanplane_model::ScanResult;
use serde::Serialize;

use crate::error::{Result, ScanError};

use super::{ImageScanRequest, ScannerCache, ScannerRpc};

/// [`ScannerRpc`] speaking JSON over HTTP to the address each scanner
/// publishes in its record.
#[derive(Clone)]
pub struct HttpScannerRpc {
    client: reqwest::Client,
    scanners: ScannerCache,
}

impl fmt::Debug for HttpScannerRpc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpScannerRpc")
            .field("scanners", &self.scanners)
            .finish()
    }
}

#[derive(Serialize)]
struct RunningScan<'a> {
    agent_id: &'a str,
    id: &'a str,
    timeout_secs: u64,
}

#[derive(Serialize)]
struct PlatformScan {
    timeout_secs: u64,
}

#[derive(Serialize)]
struct ImageScan<'a> {
    #[serde(flatten)]
    request: &'a ImageScanRequest,
    timeout_secs: u64,
}

impl HttpScannerRpc {
    pub fn new(scanners: ScannerCache) -> Self {
        Self {
            client: reqwest::Client::new(),
            scanners,
        }
    }

    fn endpoint(&self, scanner: &str, path: &str) -> Result<String> {
        let address = self
            .scanners
            .address(scanner)
            .ok_or_else(|| ScanError::NotFound(format!("scanner {scanner}")))?;
        if address.starts_with("http://") || address.starts_with("https://") {
            Ok(format!("{}/v1/scan/{path}", address.trim_end_matches('/')))
        } else {
            Ok(format!("http://{address}/v1/scan/{path}"))
        }
    }

    async fn post<B: Serialize + Sync>(
        &self,
        scanner: &str,
        path: &str,
        body: &B,
        timeout: Duration,
    ) -> Result<ScanResult> {
        let url = self.endpoint(scanner, path)?;
        tracing::debug!(target: "scan::scanner", scanner, url = %url, "scan request");
        let response = self
            .client
            .post(&url)
            .timeout(timeout)
            .json(body)
            .send()
            .await?
            .error_for_status()?;
        Ok(response.json::<ScanResult>().await?)
    }
}

#[async_trait]
impl ScannerRpc for HttpScannerRpc {
    async fn scan_workload(
        &self,
        scanner: &str,
        agent_id: &str,
        id: &str,
        timeout: Duration,
    ) -> Result<ScanResult> {
        let body = RunningScan {
            agent_id,
            id,
            timeout_secs: timeout.as_secs(),
        };
        self.post(scanner, "workload", &body, timeout).await
    }

    async fn scan_host(
        &self,
        scanner: &str,
        agent_id: &str,
        id: &str,
        timeout: Duration,
    ) -> Result<ScanResult> {
        let body = RunningScan {
            agent_id,
            id,
            timeout_secs: timeout.as_secs(),
        };
        self.post(scanner, "host", &body, timeout).await
    }

    async fn scan_platform(&self, scanner: &str, timeout: Duration) -> Result<ScanResult> {
        let body = PlatformScan {
            timeout_secs: timeout.as_secs(),
        };
        self.post(scanner, "platform", &body, timeout).await
    }

    async fn scan_image(
        &self,
        scanner: &str,
        request: &ImageScanRequest,
        timeout: Duration,
    ) -> Result<ScanResult> {
        let body = ImageScan {
            request,
            timeout_secs: timeout.as_secs(),
        };
        self.post(scanner, "image", &body, timeout).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use scanplane_model::ScannerRecord;

    #[test]
    fn endpoints_come_from_scanner_records() {
        let cache = ScannerCache::new();
        cache.upsert(ScannerRecord {
            id: "s1".into(),
            address: "10.0.0.5:18402".into(),
            ..ScannerRecord::default()
        });
        cache.upsert(ScannerRecord {
            id: "s2".into(),
            address: "https://scanner.local/".into(),
            ..ScannerRecord::default()
        });
        let rpc = HttpScannerRpc::new(cache);

        assert_eq!(
            rpc.endpoint("s1", "host").unwrap(),
            "http://10.0.0.5:18402/v1/scan/host"
        );
        assert_eq!(
            rpc.endpoint("s2", "image").unwrap(),
            "https://scanner.local/v1/scan/image"
        );
        assert!(matches!(
            rpc.endpoint("missing", "host"),
            Err(ScanError::NotFound(_))
        ));
    }
}
