//! # Scanplane Core
//!
//! Scan scheduling engine for a vulnerability-scanning control plane.
//!
//! ## Overview
//!
//! - **Scan objects**: per-workload, per-host and platform scan state with
//!   automatic sweeps, manual requests and retry handling
//! - **Task scheduling**: two-priority queues dispatched to scanner
//!   processors with at most one task in flight per key
//! - **Registries**: repository and tag discovery, content-ID
//!   deduplication, rescan skipping, retention and periodic polling
//! - **Vulnerability profiles**: suppression rules applied to cached results
//! - **Shared store**: a watched key-value store that every controller
//!   rebuilds its local caches from
//!
//! ## Architecture
//!
//! - [`store`]: key-value contract, key schema, codecs and change dispatch
//! - [`scheduler`]: the generic task scheduler
//! - [`objects`]: the scan object table and its task handler
//! - [`registry`]: registry aggregates, discovery and image tasks
//! - [`profile`]: vulnerability profile filtering
//! - [`scanner`]: scanner RPC contract and the scanner directory
//! - [`runtime`]: wires everything into one controller
#![allow(missing_docs)]

pub mod config;
pub mod error;
pub mod leadership;
pub mod objects;
pub mod profile;
pub mod registry;
pub mod runtime;
pub mod scanner;
pub mod scheduler;
pub mod store;

pub use config::{ControlPlaneConfig, ObjectScanConfig, RegistryScanConfig, WatchConfig};
pub use error::{Result, ScanError};
pub use leadership::{LeadershipFlag, ScannerRole};
pub use objects::{ObjectScanHandler, ObjectScanTask, ObjectStatus, ScanObjectStore};
pub use profile::{ProfileStore, VulnerabilityProfileFilter};
pub use registry::{
    CatalogDriverFactory, DriverFactory, RegistryCatalog, RegistryDriver, RegistryService,
};
pub use runtime::{ScanControlPlane, ScanControlPlaneBuilder};
pub use scanner::{HttpScannerRpc, ScannerCache, ScannerDirectory, ScannerRpc};
pub use scheduler::{TaskAction, TaskHandler, TaskPriority, TaskScheduler};
pub use store::{ClusterStore, InMemoryStore, KvStore};
