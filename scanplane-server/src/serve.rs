use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Args;
use scanplane_config::ControlPlaneSettings;
use scanplane_core::{
    CatalogDriverFactory, HttpScannerRpc, InMemoryStore, KvStore, LeadershipFlag,
    ScanControlPlane, ScannerCache, ScannerRpc,
};

use crate::seed::Seed;

#[derive(Debug, Args)]
pub struct ServeArgs {
    /// Seed file with registries, profiles, scanners, objects and the
    /// registry catalog
    #[arg(long)]
    seed: Option<PathBuf>,

    /// Take the scanner role immediately instead of waiting for election
    #[arg(long)]
    standalone: bool,

    #[arg(long)]
    controller_id: Option<String>,

    /// Stop after this long, e.g. `90s` or `5m`
    #[arg(long, value_parser = humantime::parse_duration)]
    run_for: Option<Duration>,

    /// Interval between status lines
    #[arg(long, value_parser = humantime::parse_duration, default_value = "30s")]
    report_every: Duration,

    /// Request a scan of every configured registry after startup
    #[arg(long)]
    scan_registries: bool,
}

pub async fn run(mut settings: ControlPlaneSettings, args: ServeArgs) -> anyhow::Result<()> {
    if let Some(id) = args.controller_id {
        settings.controller_id = id;
    }
    if args.standalone {
        settings.standalone = true;
    }
    if let Some(seed) = args.seed {
        settings.seed_path = Some(seed);
    }
    for warning in settings.warnings() {
        tracing::warn!("{warning}");
    }

    let seed = match &settings.seed_path {
        Some(path) => Seed::from_path(path)?,
        None => Seed::default(),
    };

    let config = settings.control_plane.clone();
    let store: Arc<dyn KvStore> = Arc::new(InMemoryStore::new(config.watch.broadcast_capacity));
    let cluster = scanplane_core::ClusterStore::new(Arc::clone(&store));
    seed.write(&cluster).await?;

    let scanners = ScannerCache::new();
    let rpc: Arc<dyn ScannerRpc> = Arc::new(HttpScannerRpc::new(scanners.clone()));
    let drivers = Arc::new(CatalogDriverFactory::new(seed.catalog.clone(), Arc::clone(&rpc)));

    let plane = ScanControlPlane::builder(config)
        .with_controller_id(settings.controller_id.clone())
        .with_store(store)
        .with_drivers(drivers)
        .with_rpc(rpc)
        .with_scanner_cache(scanners)
        .with_leadership(LeadershipFlag::new(settings.standalone))
        .build()
        .context("failed to build control plane")?;
    plane.start().await.context("failed to start control plane")?;
    tracing::info!(
        controller = %settings.controller_id,
        standalone = settings.standalone,
        "scanplane running"
    );

    seed.add_objects(plane.objects()).await?;
    if args.scan_registries {
        for registry in plane.registries().all().await {
            if let Err(err) = plane.registries().request_start(registry.name()).await {
                tracing::warn!(registry = registry.name(), error = %err, "failed to start registry scan");
            }
        }
    }

    let run_for = args.run_for;
    let stop = async move {
        match run_for {
            Some(limit) => {
                tokio::select! {
                    _ = tokio::time::sleep(limit) => tracing::info!("run time elapsed"),
                    _ = tokio::signal::ctrl_c() => tracing::info!("interrupt received"),
                }
            }
            None => {
                if let Err(err) = tokio::signal::ctrl_c().await {
                    tracing::error!(error = %err, "failed to listen for interrupt");
                }
            }
        }
    };
    tokio::pin!(stop);

    let mut ticker = tokio::time::interval(args.report_every.max(Duration::from_secs(1)));
    ticker.tick().await;
    loop {
        tokio::select! {
            _ = &mut stop => break,
            _ = ticker.tick() => report_status(&plane).await,
        }
    }

    report_status(&plane).await;
    plane.shutdown().await.context("shutdown failed")?;
    Ok(())
}

async fn report_status(plane: &ScanControlPlane) {
    let summary = plane.objects().status_summary().await;
    tracing::info!(
        scheduled = summary.scheduled,
        scanning = summary.scanning,
        scanned = summary.scanned,
        cve_db = %summary.cve_db_version,
        "scan objects"
    );
    for view in plane.registries().summaries().await {
        match serde_json::to_string(&view) {
            Ok(line) => tracing::info!(registry = %line, "registry"),
            Err(err) => tracing::warn!(error = %err, "failed to encode registry summary"),
        }
    }
}
