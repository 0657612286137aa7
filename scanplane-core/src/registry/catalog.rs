//! Registry driver over a static catalog of repositories, tags and image
//! metadata. Used by the standalone binary and tests.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use scanplane_model::{ImageInfo, ImageRef, RegistryConfig, ScanErrorCode, ScanResult};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::error::{Result, ScanError};
use crate::scanner::{ImageScanRequest, ScannerRpc};

use super::driver::{DriverFactory, RegistryDriver};

/// Catalog contents: repository name to tag to image metadata.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistryCatalog {
    pub repositories: BTreeMap<String, BTreeMap<String, ImageInfo>>,
    /// When set, logins with other credentials are rejected.
    pub username: Option<String>,
    pub password: Option<String>,
    /// Serve the bulk listing call instead of per-repository calls.
    pub bulk_listing: bool,
}

impl RegistryCatalog {
    pub fn from_json(raw: &str) -> Result<Self> {
        Ok(serde_json::from_str(raw)?)
    }

    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let raw = std::fs::read_to_string(path.as_ref())?;
        Self::from_json(&raw)
    }

    pub fn insert(&mut self, repo: &str, tag: &str, info: ImageInfo) {
        self.repositories
            .entry(repo.to_string())
            .or_default()
            .insert(tag.to_string(), info);
    }

    pub fn remove(&mut self, repo: &str, tag: &str) {
        if let Some(tags) = self.repositories.get_mut(repo) {
            tags.remove(tag);
            if tags.is_empty() {
                self.repositories.remove(repo);
            }
        }
    }
}

#[derive(Debug, Default)]
struct DriverSettings {
    registry: String,
    username: String,
    password: String,
    scan_layers: bool,
    scan_secrets: bool,
}

impl DriverSettings {
    fn from_config(config: &RegistryConfig) -> Self {
        Self {
            registry: config.registry.clone(),
            username: config.username.clone(),
            password: config.password.clone(),
            scan_layers: config.scan_layers,
            scan_secrets: !config.disable_files,
        }
    }
}

/// Shared, swappable catalog so tests and the binary can change registry
/// contents between scan passes.
pub type SharedCatalog = Arc<RwLock<RegistryCatalog>>;

pub struct CatalogDriver {
    catalog: SharedCatalog,
    rpc: Arc<dyn ScannerRpc>,
    settings: RwLock<DriverSettings>,
}

impl fmt::Debug for CatalogDriver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CatalogDriver")
            .field("rpc", &self.rpc)
            .finish_non_exhaustive()
    }
}

impl CatalogDriver {
    pub fn new(catalog: SharedCatalog, rpc: Arc<dyn ScannerRpc>, config: &RegistryConfig) -> Self {
        Self {
            catalog,
            rpc,
            settings: RwLock::new(DriverSettings::from_config(config)),
        }
    }
}

#[async_trait]
impl RegistryDriver for CatalogDriver {
    async fn login(&self, config: &RegistryConfig) -> Result<()> {
        let catalog = self.catalog.read().await;
        let user_ok = catalog
            .username
            .as_ref()
            .is_none_or(|expected| *expected == config.username);
        let password_ok = catalog
            .password
            .as_ref()
            .is_none_or(|expected| *expected == config.password);
        if !(user_ok && password_ok) {
            return Err(ScanError::Driver(format!(
                "UNAUTHORIZED: login to {} rejected",
                config.registry
            )));
        }
        *self.settings.write().await = DriverSettings::from_config(config);
        Ok(())
    }

    async fn logout(&self, force: bool) {
        tracing::trace!(target: "scan::registry", force, "catalog driver logout");
    }

    async fn set_config(&self, config: &RegistryConfig) {
        *self.settings.write().await = DriverSettings::from_config(config);
    }

    async fn get_repo_list(&self, org: &str, name: &str, _limit: usize) -> Result<Vec<ImageRef>> {
        if !name.contains('*') {
            let repo = if org.is_empty() {
                name.to_string()
            } else {
                format!("{org}/{name}")
            };
            return Ok(vec![ImageRef::new("", repo, "")]);
        }
        let catalog = self.catalog.read().await;
        Ok(catalog
            .repositories
            .keys()
            .map(|repo| ImageRef::new("", repo.clone(), ""))
            .collect())
    }

    async fn get_tag_list(&self, _domain: &str, repo: &str, tag: &str) -> Result<Vec<String>> {
        if !tag.contains('*') {
            return Ok(vec![tag.to_string()]);
        }
        let catalog = self.catalog.read().await;
        catalog
            .repositories
            .get(repo)
            .map(|tags| tags.keys().cloned().collect())
            .ok_or_else(|| ScanError::NotFound(format!("repository {repo}")))
    }

    async fn get_all_images(&self) -> Result<Option<HashMap<ImageRef, Vec<String>>>> {
        let catalog = self.catalog.read().await;
        if !catalog.bulk_listing {
            return Ok(None);
        }
        Ok(Some(
            catalog
                .repositories
                .iter()
                .map(|(repo, tags)| {
                    (
                        ImageRef::new("", repo.clone(), ""),
                        tags.keys().cloned().collect(),
                    )
                })
                .collect(),
        ))
    }

    async fn get_image_meta(
        &self,
        _domain: &str,
        repo: &str,
        tag: &str,
    ) -> std::result::Result<ImageInfo, ScanErrorCode> {
        let catalog = self.catalog.read().await;
        catalog
            .repositories
            .get(repo)
            .and_then(|tags| tags.get(tag))
            .cloned()
            .ok_or(ScanErrorCode::RegistryApi)
    }

    async fn scan_image(
        &self,
        scanner: &str,
        image_id: &str,
        repo: &str,
        tag: &str,
        timeout: Duration,
    ) -> ScanResult {
        let request = {
            let settings = self.settings.read().await;
            ImageScanRequest {
                registry: settings.registry.clone(),
                username: settings.username.clone(),
                password: settings.password.clone(),
                repository: repo.to_string(),
                tag: tag.to_string(),
                scan_layers: settings.scan_layers,
                scan_secrets: settings.scan_secrets,
            }
        };
        match self.rpc.scan_image(scanner, &request, timeout).await {
            Ok(result) => result,
            Err(err) => {
                tracing::error!(target: "scan::registry", image_id, scanner, error = %err, "image scan RPC not made");
                ScanResult::from_error(ScanErrorCode::Network)
            }
        }
    }
}

/// Hands out [`CatalogDriver`]s sharing one catalog.
#[derive(Clone)]
pub struct CatalogDriverFactory {
    catalog: SharedCatalog,
    rpc: Arc<dyn ScannerRpc>,
}

impl fmt::Debug for CatalogDriverFactory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CatalogDriverFactory")
            .field("rpc", &self.rpc)
            .finish_non_exhaustive()
    }
}

impl CatalogDriverFactory {
    pub fn new(catalog: RegistryCatalog, rpc: Arc<dyn ScannerRpc>) -> Self {
        Self {
            catalog: Arc::new(RwLock::new(catalog)),
            rpc,
        }
    }

    pub fn catalog(&self) -> SharedCatalog {
        Arc::clone(&self.catalog)
    }
}

impl DriverFactory for CatalogDriverFactory {
    fn create(&self, config: &RegistryConfig, _public: bool) -> Arc<dyn RegistryDriver> {
        Arc::new(CatalogDriver::new(
            Arc::clone(&self.catalog),
            Arc::clone(&self.rpc),
            config,
        ))
    }
}
