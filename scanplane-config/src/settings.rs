use std::path::PathBuf;

use scanplane_core::ControlPlaneConfig;
use serde::{Deserialize, Serialize};

/// Everything a controller process needs beyond the shared store.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ControlPlaneSettings {
    /// Identity of this controller; built-in scanners only serve the
    /// controller whose id they carry.
    pub controller_id: String,
    /// Act as the active scanner without external leadership.
    pub standalone: bool,
    /// JSON seed (registry catalog, registries, profiles, scanners) loaded
    /// into the in-memory store at startup.
    pub seed_path: Option<PathBuf>,
    /// `tracing` filter directive; `RUST_LOG` syntax.
    pub log_filter: Option<String>,
    pub control_plane: ControlPlaneConfig,
}

impl ControlPlaneSettings {
    /// Settings that load but will misbehave.
    pub fn warnings(&self) -> Vec<String> {
        let mut warnings = Vec::new();
        let object = &self.control_plane.object_scan;
        if object.safety_timeout_secs < object.request_timeout_secs {
            warnings.push(format!(
                "object_scan.safety_timeout_secs ({}) is below request_timeout_secs ({}); the request timeout is used instead",
                object.safety_timeout_secs, object.request_timeout_secs
            ));
        }
        let registry = &self.control_plane.registry_scan;
        if registry.safety_timeout_secs < registry.request_timeout_secs {
            warnings.push(format!(
                "registry_scan.safety_timeout_secs ({}) is below request_timeout_secs ({}); the request timeout is used instead",
                registry.safety_timeout_secs, registry.request_timeout_secs
            ));
        }
        if registry.poll_interval_min_secs > registry.poll_interval_max_secs {
            warnings.push(format!(
                "registry_scan.poll_interval_min_secs ({}) exceeds poll_interval_max_secs ({})",
                registry.poll_interval_min_secs, registry.poll_interval_max_secs
            ));
        }
        if registry.persist_image_max == 0 {
            warnings.push(
                "registry_scan.persist_image_max is 0; finished image summaries are purged on every scan"
                    .to_string(),
            );
        }
        if let Some(seed) = &self.seed_path
            && !seed.exists()
        {
            warnings.push(format!("seed file {} does not exist", seed.display()));
        }
        warnings
    }
}
