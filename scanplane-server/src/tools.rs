//! Offline operator commands: discovery dry runs, profile filtering and
//! settings inspection.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, anyhow};
use clap::Args;
use scanplane_config::{ControlPlaneSettings, SettingsLoad};
use scanplane_core::{
    CatalogDriverFactory, HttpScannerRpc, InMemoryStore, RegistryCatalog, ScanControlPlane,
    ScannerCache, ScannerRpc, VulnerabilityProfileFilter,
};
use scanplane_model::{
    IdName, RegistryConfig, RegistryFilter, RegistryType, ScanReport, ScanResult, Vulnerability,
    VulnerabilityProfile,
};
use serde::Deserialize;

#[derive(Debug, Args)]
pub struct DiscoverArgs {
    /// Registry catalog (JSON) the discovery runs against
    #[arg(long)]
    catalog: PathBuf,

    /// Registry configuration (JSON); replaces the flags below
    #[arg(long, conflicts_with_all = ["name", "url", "filter"])]
    registry: Option<PathBuf>,

    #[arg(long, default_value = "dry-run")]
    name: String,

    #[arg(long, default_value = "https://registry.local/")]
    url: String,

    /// `[org/]repo[:tag]` filter, repeatable; defaults to everything
    #[arg(long)]
    filter: Vec<String>,

    #[arg(long)]
    username: Option<String>,

    #[arg(long)]
    password: Option<String>,
}

impl DiscoverArgs {
    fn registry_config(&self) -> anyhow::Result<RegistryConfig> {
        if let Some(path) = &self.registry {
            return read_json(path);
        }
        let filters = if self.filter.is_empty() {
            vec![RegistryFilter::match_all()]
        } else {
            self.filter
                .iter()
                .map(|raw| RegistryFilter::parse(raw).map_err(|err| anyhow!("{err}")))
                .collect::<anyhow::Result<Vec<_>>>()?
        };
        Ok(RegistryConfig {
            name: self.name.clone(),
            registry_type: RegistryType::Docker,
            registry: self.url.clone(),
            username: self.username.clone().unwrap_or_default(),
            password: self.password.clone().unwrap_or_default(),
            filters,
            ..RegistryConfig::default()
        })
    }
}

pub async fn discover(settings: ControlPlaneSettings, args: DiscoverArgs) -> anyhow::Result<()> {
    let catalog = RegistryCatalog::from_path(&args.catalog)
        .with_context(|| format!("failed to read catalog {}", args.catalog.display()))?;
    let config = args.registry_config()?;

    let scanners = ScannerCache::new();
    let rpc: Arc<dyn ScannerRpc> = Arc::new(HttpScannerRpc::new(scanners.clone()));
    let plane = ScanControlPlane::builder(settings.control_plane)
        .with_controller_id(settings.controller_id)
        .with_store(Arc::new(InMemoryStore::default()))
        .with_drivers(Arc::new(CatalogDriverFactory::new(catalog, Arc::clone(&rpc))))
        .with_rpc(rpc)
        .with_scanner_cache(scanners)
        .build()?;

    let found = plane
        .registries()
        .dry_run(config)
        .await
        .context("discovery failed")?;
    tracing::info!(
        repositories = found.images.len(),
        images = found.total,
        "discovery finished"
    );
    println!("{}", serde_json::to_string_pretty(&found)?);
    Ok(())
}

#[derive(Debug, Args)]
pub struct FilterArgs {
    /// Vulnerability profile (JSON)
    #[arg(long)]
    profile: PathBuf,

    /// Vulnerability list, scan result or scan report (JSON)
    #[arg(long)]
    vulnerabilities: PathBuf,

    /// Namespace the workload runs in, repeatable
    #[arg(long)]
    domain: Vec<String>,

    /// Image the workload runs, `repo:tag`
    #[arg(long, default_value = "")]
    image: String,

    /// Keep suppressed entries and tag them with this value
    #[arg(long)]
    show_tag: Option<String>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum VulnerabilityInput {
    List(Vec<Vulnerability>),
    Report(ScanReport),
    Result(ScanResult),
}

impl VulnerabilityInput {
    fn into_vulnerabilities(self) -> Vec<Vulnerability> {
        match self {
            VulnerabilityInput::List(vuls) => vuls,
            VulnerabilityInput::Report(report) => report.result.vulnerabilities,
            VulnerabilityInput::Result(result) => result.vulnerabilities,
        }
    }
}

pub fn filter(args: FilterArgs) -> anyhow::Result<()> {
    let profile: VulnerabilityProfile = read_json(&args.profile)?;
    let input: VulnerabilityInput = read_json(&args.vulnerabilities)?;
    let vuls = input.into_vulnerabilities();
    let before = vuls.len();

    let compiled = VulnerabilityProfileFilter::compile(&profile)
        .with_context(|| format!("invalid profile {}", profile.name))?;
    let idns = vec![IdName::new(args.domain, args.image)];
    let kept = compiled.filter_vulnerabilities(vuls, &idns, args.show_tag.as_deref());

    tracing::info!(
        profile = %profile.name,
        before,
        after = kept.len(),
        "profile applied"
    );
    println!("{}", serde_json::to_string_pretty(&kept)?);
    Ok(())
}

pub fn check_config(load: &SettingsLoad) -> anyhow::Result<()> {
    println!("source: {}", load.source);
    if let Some(env_file) = &load.env_file {
        println!("env file: {}", env_file.display());
    }
    if !load.overrides.is_empty() {
        println!("environment overrides: {}", load.overrides.join(", "));
    }
    let warnings = load.settings.warnings();
    for warning in &warnings {
        println!("warning: {warning}");
    }
    println!();
    let rendered =
        toml::to_string_pretty(&load.settings).context("failed to render effective settings")?;
    println!("{rendered}");
    if warnings.is_empty() {
        Ok(())
    } else {
        Err(anyhow!("{} configuration warning(s)", warnings.len()))
    }
}

fn read_json<T: serde::de::DeserializeOwned>(path: &PathBuf) -> anyhow::Result<T> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    serde_json::from_str(&raw).with_context(|| format!("invalid JSON in {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flags_build_a_match_all_registry() {
        let args = DiscoverArgs {
            catalog: PathBuf::from("catalog.json"),
            registry: None,
            name: "local".into(),
            url: "https://registry.local/".into(),
            filter: Vec::new(),
            username: None,
            password: None,
        };
        let config = args.registry_config().unwrap();
        assert_eq!(config.name, "local");
        assert_eq!(config.filters, vec![RegistryFilter::match_all()]);
    }

    #[test]
    fn invalid_filter_is_rejected() {
        let args = DiscoverArgs {
            catalog: PathBuf::from("catalog.json"),
            registry: None,
            name: "local".into(),
            url: "https://registry.local/".into(),
            filter: vec!["my*org/app:v1".into()],
            username: None,
            password: None,
        };
        assert!(args.registry_config().is_err());
    }

    #[test]
    fn scan_results_and_plain_lists_are_accepted() {
        let list: VulnerabilityInput =
            serde_json::from_str(r#"[{"name": "CVE-2026-1"}, {"name": "CVE-2026-2"}]"#).unwrap();
        assert_eq!(list.into_vulnerabilities().len(), 2);

        let result: VulnerabilityInput =
            serde_json::from_str(r#"{"namespace": "ubuntu", "vulnerabilities": [{"name": "CVE-2026-3"}]}"#)
                .unwrap();
        let vuls = result.into_vulnerabilities();
        assert_eq!(vuls.len(), 1);
        assert_eq!(vuls[0].name, "CVE-2026-3");
    }

    #[test]
    fn suppressed_entries_are_dropped() {
        let dir = tempfile::tempdir().unwrap();
        let profile = dir.path().join("profile.json");
        std::fs::write(
            &profile,
            r#"{"name": "default", "entries": [{"name": "CVE-2026-1"}], "updated_at": "2026-09-01T00:00:00Z"}"#,
        )
        .unwrap();
        let vuls = dir.path().join("vuls.json");
        std::fs::write(&vuls, r#"[{"name": "CVE-2026-1"}, {"name": "CVE-2026-2"}]"#).unwrap();

        let profile: VulnerabilityProfile = read_json(&profile).unwrap();
        let input: VulnerabilityInput = read_json(&vuls).unwrap();
        let compiled = VulnerabilityProfileFilter::compile(&profile).unwrap();
        let kept = compiled.filter_vulnerabilities(
            input.into_vulnerabilities(),
            &[IdName::new(Vec::new(), "")],
            None,
        );
        assert_eq!(kept.len(), 1);
        assert_eq!(kept[0].name, "CVE-2026-2");
    }
}
