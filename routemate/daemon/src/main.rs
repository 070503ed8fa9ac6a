//! Routemate - Read/Write Router Diagnostics
//!
//! Loads a routemate configuration, builds the router over TCP endpoints and
//! shows how it would route.
//!
//! # Usage
//!
//! ```bash
//! # Probe every replica once
//! routemate check
//!
//! # Show where ten reads would go
//! routemate resolve --intent READ --count 10
//!
//! # Keep probing and log health changes; SIGHUP reloads the config
//! routemate --config /etc/routemate/routemate.toml watch
//!
//! # Verbose logging
//! RUST_LOG=debug routemate check
//! ```
//!
//! # Signals
//!
//! - `SIGTERM` / `SIGINT`: stop `watch`
//! - `SIGHUP`: reload configuration and reconcile replicas (`watch` only)

mod reload;
mod tcp;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio::signal::unix::{signal, SignalKind};
use tracing::{info, warn};

use routemate_core::{
    build_router, default_config_path, load_config_from_path, HealthProber, RoutemateConfig,
    Router, RoutingContext, RoutingIntent, Target, TopologyManager,
};

use tcp::{TcpBackend, TcpBackendFactory};

/// Routemate - read/write-splitting router diagnostics
#[derive(Parser, Debug)]
#[command(name = "routemate")]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Configuration file path
    #[arg(short = 'c', long, env = "ROUTEMATE_CONFIG", value_name = "FILE")]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short = 'l', long, env = "ROUTEMATE_LOG_LEVEL", default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Probe every replica once and report; fails if any replica is down
    Check,

    /// Print where a series of requests would be routed
    Resolve {
        /// READ, WRITE or an explicit backend key
        #[arg(short, long, default_value = "READ")]
        intent: String,

        /// Number of resolutions
        #[arg(short = 'n', long, default_value_t = 10)]
        count: usize,

        /// Probe replicas once before resolving
        #[arg(long)]
        probe: bool,
    },

    /// Run the health prober until interrupted
    Watch {
        /// Seconds between status lines
        #[arg(long, default_value_t = 30)]
        status_interval: u64,
    },
}

/// Initialize logging with the specified level
fn init_logging(level: &str) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        tracing_subscriber::EnvFilter::new(format!(
            "routemate={level},routemate_daemon={level},routemate_core={level}"
        ))
    });

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .init();
}

fn load(path: Option<PathBuf>) -> Result<RoutemateConfig> {
    let path = path.or_else(default_config_path);
    load_config_from_path(path.clone()).with_context(|| match path {
        Some(p) => format!("Failed to load configuration from {}", p.display()),
        None => "Failed to load configuration".to_string(),
    })
}

fn describe(router: &Router<TcpBackend>, target: &Target) -> String {
    match target {
        Target::Primary => format!("{} (primary)", router.primary_key()),
        Target::Replica(key) => key.clone(),
        Target::Explicit(key) => format!("{key} (explicit)"),
    }
}

async fn check(config: &RoutemateConfig) -> Result<()> {
    let router = Arc::new(build_router(config, &TcpBackendFactory).await?);
    let report = HealthProber::new(Arc::clone(&router), config.health_check_config())
        .check_once()
        .await;

    for (key, outcome) in &report.outcomes {
        match outcome {
            Ok(()) => println!("{key:<20} healthy"),
            Err(e) => println!("{key:<20} UNHEALTHY  {e}"),
        }
    }
    if report.outcomes.is_empty() {
        println!("no replicas configured, reads go to {}", router.primary_key());
    }

    let failed = report.failed().len();
    if failed > 0 {
        anyhow::bail!("{failed} of {} replicas failed their probe", report.outcomes.len());
    }
    Ok(())
}

async fn resolve(config: &RoutemateConfig, intent: &str, count: usize, probe: bool) -> Result<()> {
    let intent: RoutingIntent = intent.parse().context("Invalid routing intent")?;
    let router = Arc::new(build_router(config, &TcpBackendFactory).await?);
    if probe {
        HealthProber::new(Arc::clone(&router), config.health_check_config())
            .check_once()
            .await;
    }

    let mut ctx = RoutingContext::new();
    let scope = ctx.enter(intent)?;
    for i in 1..=count {
        let target = router.determine_target(&scope);
        println!("{i:>4}  {}", describe(&router, &target));
    }

    let metrics = router.metrics().snapshot();
    println!(
        "primary={} replica={} explicit={} fallbacks={}",
        metrics.primary_resolutions,
        metrics.replica_resolutions,
        metrics.explicit_resolutions,
        metrics.fallbacks
    );
    Ok(())
}

async fn watch(config: RoutemateConfig, config_path: Option<PathBuf>, status_every: u64) -> Result<()> {
    let router = Arc::new(build_router(&config, &TcpBackendFactory).await?);
    let manager = TopologyManager::new(Arc::clone(&router), TcpBackendFactory, config.topology_config());
    let mut health = config.health_check_config();
    let mut prober = HealthProber::new(Arc::clone(&router), health.clone()).spawn();

    let mut sigterm = signal(SignalKind::terminate()).context("Failed to install SIGTERM handler")?;
    let mut sigint = signal(SignalKind::interrupt()).context("Failed to install SIGINT handler")?;
    let mut sighup = signal(SignalKind::hangup()).context("Failed to install SIGHUP handler")?;
    let mut status = tokio::time::interval(Duration::from_secs(status_every.max(1)));

    info!(replicas = router.replica_keys().len(), "Watching replica health");
    loop {
        tokio::select! {
            _ = sigterm.recv() => {
                info!("Received SIGTERM, shutting down");
                break;
            }
            _ = sigint.recv() => {
                info!("Received SIGINT, shutting down");
                break;
            }
            _ = sighup.recv() => {
                info!("Received SIGHUP, reloading configuration");
                match load(config_path.clone()) {
                    Ok(fresh) => {
                        let summary = reload::reconcile(&manager, &fresh, &health).await;
                        if let Some(ref updated) = summary.health_check {
                            info!(
                                interval_ms = updated.interval.as_millis() as u64,
                                timeout_ms = updated.timeout.as_millis() as u64,
                                "Health check settings changed, restarting prober"
                            );
                            prober.stop().await;
                            prober = HealthProber::new(Arc::clone(&router), updated.clone()).spawn();
                            health = updated.clone();
                        }
                        info!(?summary, "Reload complete");
                    }
                    Err(e) => warn!(error = %e, "Reload failed, keeping current topology"),
                }
            }
            _ = status.tick() => {
                let unhealthy = router.health().unhealthy_keys();
                info!(
                    replicas = router.replica_keys().len(),
                    healthy = router.healthy_replicas().len(),
                    unhealthy = ?unhealthy,
                    strategy = %router.strategy(),
                    "Replica status"
                );
            }
        }
    }

    prober.stop().await;
    for key in router.replica_keys() {
        if let Err(e) = manager.remove_replica(&key).await {
            warn!(replica = %key, error = %e, "Failed to close replica");
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(&args.log_level);

    let config = load(args.config.clone())?;
    if let Some(ref path) = config.config_file_path {
        info!(path = %path.display(), source = %config.source(), "Configuration loaded");
    }

    match args.command {
        Command::Check => check(&config).await,
        Command::Resolve {
            intent,
            count,
            probe,
        } => resolve(&config, &intent, count, probe).await,
        Command::Watch { status_interval } => watch(config, args.config, status_interval).await,
    }
}
