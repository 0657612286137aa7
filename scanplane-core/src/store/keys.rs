use scanplane_model::{ModelError, ScanObjectType};

pub const SCAN_CONFIG_KEY: &str = "config/scan";
pub const REGISTRY_CONFIG_PREFIX: &str = "config/registry/";
pub const PROFILE_PREFIX: &str = "config/profile/vulnerability/";
pub const SCANNER_PREFIX: &str = "scanner/";
pub const SCAN_STATE_PREFIX: &str = "scan/state/";
pub const SCAN_DATA_PREFIX: &str = "scan/data/";

const REGISTRY_TOKEN: &str = "registry";

pub fn registry_config_key(name: &str) -> String {
    format!("{REGISTRY_CONFIG_PREFIX}{name}")
}

pub fn profile_key(name: &str) -> String {
    format!("{PROFILE_PREFIX}{name}")
}

pub fn scanner_key(id: &str) -> String {
    format!("{SCANNER_PREFIX}{id}")
}

pub fn object_state_key(kind: ScanObjectType, id: &str) -> String {
    format!("{SCAN_STATE_PREFIX}{}/{id}", kind.key_token())
}

pub fn object_report_key(kind: ScanObjectType, id: &str) -> String {
    format!("{SCAN_DATA_PREFIX}{}/{id}", kind.key_token())
}

pub fn registry_state_key(name: &str) -> String {
    format!("{SCAN_STATE_PREFIX}{REGISTRY_TOKEN}/{name}")
}

pub fn image_state_prefix(registry: &str) -> String {
    format!(
        "{SCAN_STATE_PREFIX}{}/{registry}/",
        ScanObjectType::Image.key_token()
    )
}

pub fn image_report_prefix(registry: &str) -> String {
    format!(
        "{SCAN_DATA_PREFIX}{}/{registry}/",
        ScanObjectType::Image.key_token()
    )
}

pub fn image_state_key(registry: &str, id: &str) -> String {
    format!("{}{id}", image_state_prefix(registry))
}

pub fn image_report_key(registry: &str, id: &str) -> String {
    format!("{}{id}", image_report_prefix(registry))
}

/// Parsed form of every key the control plane reads or watches.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum StoreKey {
    ScanConfig,
    RegistryConfig { name: String },
    Profile { name: String },
    Scanner { id: String },
    ObjectState { kind: ScanObjectType, id: String },
    ObjectReport { kind: ScanObjectType, id: String },
    RegistryState { name: String },
    ImageState { registry: String, id: String },
    ImageReport { registry: String, id: String },
}

impl StoreKey {
    pub fn parse(key: &str) -> Result<Self, ModelError> {
        let invalid = || ModelError::InvalidKey(key.to_string());

        if key == SCAN_CONFIG_KEY {
            return Ok(StoreKey::ScanConfig);
        }
        if let Some(name) = key.strip_prefix(REGISTRY_CONFIG_PREFIX) {
            return non_empty(name)
                .map(|name| StoreKey::RegistryConfig { name })
                .ok_or_else(invalid);
        }
        if let Some(name) = key.strip_prefix(PROFILE_PREFIX) {
            return non_empty(name)
                .map(|name| StoreKey::Profile { name })
                .ok_or_else(invalid);
        }
        if let Some(id) = key.strip_prefix(SCANNER_PREFIX) {
            return non_empty(id)
                .map(|id| StoreKey::Scanner { id })
                .ok_or_else(invalid);
        }

        let (is_state, rest) = if let Some(rest) = key.strip_prefix(SCAN_STATE_PREFIX) {
            (true, rest)
        } else if let Some(rest) = key.strip_prefix(SCAN_DATA_PREFIX) {
            (false, rest)
        } else {
            return Err(invalid());
        };

        let (token, tail) = rest.split_once('/').ok_or_else(invalid)?;
        if token == REGISTRY_TOKEN {
            if !is_state {
                return Err(invalid());
            }
            return non_empty(tail)
                .map(|name| StoreKey::RegistryState { name })
                .ok_or_else(invalid);
        }

        let kind = ScanObjectType::from_key_token(token).ok_or_else(invalid)?;
        if kind == ScanObjectType::Image {
            let (registry, id) = tail.split_once('/').ok_or_else(invalid)?;
            let (registry, id) = (
                non_empty(registry).ok_or_else(invalid)?,
                non_empty(id).ok_or_else(invalid)?,
            );
            return Ok(if is_state {
                StoreKey::ImageState { registry, id }
            } else {
                StoreKey::ImageReport { registry, id }
            });
        }

        let id = non_empty(tail).ok_or_else(invalid)?;
        Ok(if is_state {
            StoreKey::ObjectState { kind, id }
        } else {
            StoreKey::ObjectReport { kind, id }
        })
    }
}

fn non_empty(segment: &str) -> Option<String> {
    if segment.is_empty() || segment.contains('/') {
        None
    } else {
        Some(segment.to_string())
    }
}
