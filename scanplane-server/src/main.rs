mod seed;
mod serve;
mod tools;

use std::path::PathBuf;

use anyhow::Context;
use clap::{Parser, Subcommand};
use scanplane_config::{SettingsLoad, SettingsLoader};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

const DEFAULT_LOG_FILTER: &str = "info,scan::queue=info,scan::registry=info";

/// CLI entry point
#[derive(Parser, Debug)]
#[command(name = "scanplane")]
#[command(about = "Vulnerability scan control plane")]
struct Cli {
    /// Settings file (TOML or JSON); overrides the search for scanplane.toml
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// tracing filter directive, e.g. `debug,scan::queue=trace`
    #[arg(long, global = true, env = "SCANPLANE_LOG")]
    log_filter: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run a controller on an in-memory store
    Serve(serve::ServeArgs),
    /// Run registry discovery against a catalog without scheduling scans
    Discover(tools::DiscoverArgs),
    /// Apply a vulnerability profile to a vulnerability list
    Filter(tools::FilterArgs),
    /// Load settings, report where they came from and exit
    CheckConfig,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let load = load_settings(&cli)?;

    let filter = cli
        .log_filter
        .clone()
        .or_else(|| load.settings.log_filter.clone());
    init_tracing(filter.as_deref());
    if let Some(env_file) = &load.env_file {
        tracing::info!(path = %env_file.display(), "loaded .env file");
    }

    match cli.command {
        Command::Serve(args) => serve::run(load.settings, args).await,
        Command::Discover(args) => tools::discover(load.settings, args).await,
        Command::Filter(args) => tools::filter(args),
        Command::CheckConfig => tools::check_config(&load),
    }
}

fn load_settings(cli: &Cli) -> anyhow::Result<SettingsLoad> {
    let mut loader = SettingsLoader::new();
    if let Some(path) = &cli.config {
        loader = loader.with_config_path(path);
    }
    loader.load().context("failed to load settings")
}

fn init_tracing(filter: Option<&str>) {
    let env_filter = match filter {
        Some(directive) => tracing_subscriber::EnvFilter::new(directive),
        None => tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| DEFAULT_LOG_FILTER.into()),
    };
    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}
