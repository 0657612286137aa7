use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use scanplane_model::{ImageInfo, ImageRef, RegistryConfig, ScanErrorCode, ScanResult};

use crate::error::Result;

/// Backend-specific access to one registry. Repositories are returned as
/// [`ImageRef`]s with an empty tag.
#[async_trait]
pub trait RegistryDriver: Send + Sync + fmt::Debug {
    /// Failures abort the scan pass with a connect error; the error text is
    /// kept as the registry's error detail.
    async fn login(&self, config: &RegistryConfig) -> Result<()>;

    async fn logout(&self, force: bool);

    async fn set_config(&self, config: &RegistryConfig);

    async fn get_repo_list(&self, org: &str, name: &str, limit: usize) -> Result<Vec<ImageRef>>;

    async fn get_tag_list(&self, domain: &str, repo: &str, tag: &str) -> Result<Vec<String>>;

    /// Bulk listing of repositories and their tags. `None` when the backend
    /// has no such call.
    async fn get_all_images(&self) -> Result<Option<HashMap<ImageRef, Vec<String>>>>;

    async fn get_image_meta(
        &self,
        domain: &str,
        repo: &str,
        tag: &str,
    ) -> std::result::Result<ImageInfo, ScanErrorCode>;

    /// Ask `scanner` to scan one image. RPC failures come back as a result
    /// with a network error.
    async fn scan_image(
        &self,
        scanner: &str,
        image_id: &str,
        repo: &str,
        tag: &str,
        timeout: Duration,
    ) -> ScanResult;
}

/// Builds drivers for registry configurations. Each registry holds two: one
/// for scan passes and a backup for on-demand image adds.
pub trait DriverFactory: Send + Sync + fmt::Debug {
    fn create(&self, config: &RegistryConfig, public: bool) -> Arc<dyn RegistryDriver>;
}
