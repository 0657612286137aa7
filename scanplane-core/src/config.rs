use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Global knobs that tune control-plane behaviour.
///
/// All fields carry defaults so a deployment only needs to supply the values
/// it wants to change.
#[derive(Clone, Debug, Serialize, Deserialize, Default, PartialEq)]
#[serde(default)]
pub struct ControlPlaneConfig {
    /// Grace period when joining background tasks on shutdown.
    pub shutdown_grace_secs: u64,
    /// Timeouts and retry ceiling for workload/host/platform scans.
    pub object_scan: ObjectScanConfig,
    /// Timeouts, retry ceiling, retention and polling bounds for registry
    /// image scans.
    pub registry_scan: RegistryScanConfig,
    /// Channel sizing for change notification fan-out.
    pub watch: WatchConfig,
}

impl ControlPlaneConfig {
    pub fn shutdown_grace(&self) -> Duration {
        if self.shutdown_grace_secs == 0 {
            Duration::from_secs(30)
        } else {
            Duration::from_secs(self.shutdown_grace_secs)
        }
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ObjectScanConfig {
    /// Timeout handed to the scanner with each request (seconds).
    pub request_timeout_secs: u64,
    /// Local deadline around the RPC; must exceed the request timeout.
    pub safety_timeout_secs: u64,
    /// Retries for requests that got no usable answer.
    pub max_retry: u32,
}

impl Default for ObjectScanConfig {
    fn default() -> Self {
        Self {
            request_timeout_secs: 60,
            safety_timeout_secs: 70,
            max_retry: 5,
        }
    }
}

impl ObjectScanConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn safety_timeout(&self) -> Duration {
        Duration::from_secs(self.safety_timeout_secs.max(self.request_timeout_secs))
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct RegistryScanConfig {
    /// Timeout handed to the scanner for one image (seconds).
    pub request_timeout_secs: u64,
    /// Local deadline around an image scan.
    pub safety_timeout_secs: u64,
    /// Retries for transient image scan failures.
    pub max_retry: u32,
    /// Finished summaries kept per registry before the oldest are purged.
    pub persist_image_max: usize,
    /// Slack above `persist_image_max` before a purge is triggered.
    pub persist_image_extra: usize,
    pub poll_interval_min_secs: u64,
    pub poll_interval_max_secs: u64,
}

impl Default for RegistryScanConfig {
    fn default() -> Self {
        Self {
            request_timeout_secs: 20 * 60,
            safety_timeout_secs: 30 * 60,
            max_retry: 3,
            persist_image_max: 1000,
            persist_image_extra: 32,
            poll_interval_min_secs: 300,
            poll_interval_max_secs: 7 * 24 * 3600,
        }
    }
}

impl RegistryScanConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn safety_timeout(&self) -> Duration {
        Duration::from_secs(self.safety_timeout_secs.max(self.request_timeout_secs))
    }

    /// Clamp a configured poll period into the supported range.
    pub fn poll_interval(&self, period_secs: u64) -> Duration {
        let min = self.poll_interval_min_secs.max(1);
        let max = self.poll_interval_max_secs.max(min);
        Duration::from_secs(period_secs.clamp(min, max))
    }
}

/// Change notification fan-out sizing.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct WatchConfig {
    /// Capacity of the store's broadcast channel.
    pub broadcast_capacity: usize,
    /// Capacity of each per-prefix consumer channel.
    pub route_capacity: usize,
}

impl Default for WatchConfig {
    fn default() -> Self {
        Self {
            broadcast_capacity: 4096,
            route_capacity: 1024,
        }
    }
}
