mod daemon;

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::Path;
use tracing::{error, info};

use meridian_core::{logging, Config};
use meridian_discovery::{ResolveOptions, TagFilter, VersionFilter};

use daemon::Daemon;

const DEFAULT_CONFIG_PATH: &str = "meridian.yaml";

#[derive(Parser, Debug)]
#[command(name = "meridian")]
#[command(about = "Service discovery and resolution daemon", long_about = None)]
struct Args {
    /// Configuration file (YAML or TOML)
    #[arg(long, short, env = "MERIDIAN_CONFIG_PATH")]
    config: Option<String>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the discovery engine until interrupted (default)
    Run,
    /// Resolve a service once against the persisted instances and print the result
    Resolve {
        service: String,
        #[arg(long)]
        strategy: Option<String>,
        /// Require this tag (repeatable)
        #[arg(long = "tag")]
        tags: Vec<String>,
        #[arg(long)]
        version: Option<String>,
    },
}

fn load_config(path: Option<&str>) -> Result<Config> {
    let path = path.map(str::to_string).or_else(|| {
        Path::new(DEFAULT_CONFIG_PATH)
            .exists()
            .then(|| DEFAULT_CONFIG_PATH.to_string())
    });

    let config = match path {
        Some(path) => {
            eprintln!("Loading config from {path}");
            Config::from_file(&path)?
        }
        None => Config::from_env()?,
    };

    if let Err(errors) = config.validate() {
        for e in &errors {
            eprintln!("Config validation error: {e}");
        }
        return Err(anyhow::anyhow!(
            "Configuration validation failed with {} error(s)",
            errors.len()
        ));
    }

    Ok(config)
}

/// Wait for a shutdown signal (SIGTERM or SIGINT/Ctrl+C)
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => { info!("Received Ctrl+C"); }
        () = terminate => { info!("Received SIGTERM"); }
    }
}

async fn run(config: Config) -> Result<()> {
    let mut daemon = Daemon::new(config)?;
    daemon.start().await?;

    shutdown_signal().await;
    daemon.shutdown().await;
    Ok(())
}

async fn resolve(
    config: Config,
    service: &str,
    strategy: Option<String>,
    tags: Vec<String>,
    version: Option<String>,
) -> Result<()> {
    let daemon = Daemon::new(config)?;
    daemon.load().await?;

    let mut options = ResolveOptions::new().without_cache();
    if let Some(strategy) = strategy {
        options = options.with_strategy(strategy);
    }
    if !tags.is_empty() {
        options = options.with_filter(TagFilter::new(tags));
    }
    if let Some(version) = version {
        options = options.with_filter(VersionFilter::new(version));
    }

    let result = daemon.resolver().resolve(service, &options).await;
    daemon.shutdown().await;

    let instance = result?;
    println!("{} {} {}", instance.id, instance.endpoint, instance.status);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let config = load_config(args.config.as_deref())?;
    logging::init_logging(&config.logging)?;
    info!("Meridian starting...");

    match args.command.unwrap_or(Command::Run) {
        Command::Run => run(config).await,
        Command::Resolve {
            service,
            strategy,
            tags,
            version,
        } => resolve(config, &service, strategy, tags, version).await,
    }
}
