//! nodegridd — the NodeGrid daemon.
//!
//! Opens the node repository of one zone and keeps it healthy by running
//! the provisioning maintainers on fixed intervals:
//! - load balancer expiry
//! - reservation expiry
//! - host resume, root disk replacement, retirement, flavor upgrade and
//!   deprovisioning
//!
//! # Usage
//!
//! ```text
//! nodegridd run --config /etc/nodegrid/nodegrid.toml --data-dir /var/lib/nodegrid
//! nodegridd check-config --config nodegrid.toml
//! ```

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use nodegrid_core::ZoneConfig;
use nodegrid_provision::{
    HostDeprovisioner, HostDiskReplacer, HostFlavorUpgrader, HostProvisioner, HostResumeProvisioner,
    HostRetirer,
    LoadBalancerExpirer, LoadBalancerService, Maintainer, MockHostProvisioner,
    MockLoadBalancerService, ReservationExpirer, run_maintainer,
};
use nodegrid_state::{InMemoryLocks, Locks, StateStore};
use tokio::sync::watch;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

const DEFAULT_LOG_FILTER: &str = "info,nodegrid=debug";

#[derive(Parser)]
#[command(name = "nodegridd", about = "NodeGrid daemon")]
struct Cli {
    /// Log as JSON lines instead of human-readable text.
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the maintainers until interrupted.
    Run {
        /// Zone configuration file. Defaults apply when absent.
        #[arg(long)]
        config: Option<PathBuf>,

        /// Data directory for the node repository.
        #[arg(long, default_value = "/var/lib/nodegrid")]
        data_dir: PathBuf,

        /// Multiplier applied to every maintainer interval.
        #[arg(long, default_value = "1.0")]
        interval_factor: f64,
    },
    /// Parse and validate a zone configuration file.
    CheckConfig {
        #[arg(long)]
        config: PathBuf,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_json);

    match cli.command {
        Command::Run {
            config,
            data_dir,
            interval_factor,
        } => run(config.as_deref(), &data_dir, interval_factor).await,
        Command::CheckConfig { config } => check_config(&config),
    }
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

/// Parsing a file also validates its flavor graph.
fn load_config(path: Option<&Path>) -> anyhow::Result<ZoneConfig> {
    match path {
        Some(path) => ZoneConfig::from_file(path),
        None => {
            warn!("no zone configuration given, using defaults");
            Ok(ZoneConfig::default())
        }
    }
}

fn check_config(path: &Path) -> anyhow::Result<()> {
    let config = load_config(Some(path))?;
    let flavors = config.flavor_graph()?;
    info!(
        zone = %config.zone(),
        flavors = flavors.all().count(),
        dynamic_provisioning = config.zone.cloud.dynamic_provisioning,
        "configuration is valid"
    );
    Ok(())
}

/// `secs` scaled by `factor`, at least one second.
fn maintainer_interval(secs: u64, factor: f64) -> anyhow::Result<Duration> {
    if !factor.is_finite() || factor <= 0.0 {
        anyhow::bail!("interval factor must be a positive number, got {factor}");
    }
    Ok(Duration::try_from_secs_f64((secs as f64 * factor).max(1.0))?)
}

async fn run(config_path: Option<&Path>, data_dir: &Path, interval_factor: f64) -> anyhow::Result<()> {
    maintainer_interval(1, interval_factor)?;
    let config = load_config(config_path)?;
    let zone = config.zone();
    info!(%zone, "NodeGrid daemon starting");

    std::fs::create_dir_all(data_dir)?;
    let db_path = data_dir.join("nodegrid.redb");
    let store = StateStore::open(&db_path)?
        .with_cache_ttl(Duration::from_secs(config.provisioning.cache_ttl_secs));
    info!(path = ?db_path, "node repository opened");

    // ── Backends ───────────────────────────────────────────────

    let locks: Arc<dyn Locks> = Arc::new(InMemoryLocks::new());
    let load_balancers: Arc<dyn LoadBalancerService> = Arc::new(MockLoadBalancerService::new());
    let hosts: Option<Arc<dyn HostProvisioner>> = if zone.cloud.dynamic_provisioning {
        Some(Arc::new(MockHostProvisioner::new()))
    } else {
        None
    };

    // ── Maintainers ────────────────────────────────────────────

    let provisioning = &config.provisioning;
    let mut maintainers: Vec<(Arc<dyn Maintainer>, u64)> = vec![
        (
            Arc::new(LoadBalancerExpirer::new(
                store.clone(),
                locks.clone(),
                load_balancers,
                provisioning,
            )),
            5 * 60,
        ),
        (
            Arc::new(ReservationExpirer::new(store.clone(), locks.clone(), provisioning)),
            60,
        ),
    ];
    if let Some(hosts) = hosts {
        maintainers.push((
            Arc::new(HostResumeProvisioner::new(
                store.clone(),
                locks.clone(),
                hosts.clone(),
                provisioning,
            )),
            60,
        ));
        maintainers.push((
            Arc::new(HostDeprovisioner::new(
                store.clone(),
                locks.clone(),
                hosts.clone(),
                provisioning,
            )),
            5 * 60,
        ));
        maintainers.push((
            Arc::new(HostDiskReplacer::new(
                store.clone(),
                locks.clone(),
                hosts.clone(),
                provisioning,
            )),
            5 * 60,
        ));
        maintainers.push((
            Arc::new(HostRetirer::new(
                store.clone(),
                locks.clone(),
                hosts.clone(),
                provisioning,
                zone.cloud.account.clone(),
            )),
            30 * 60,
        ));
        maintainers.push((
            Arc::new(HostFlavorUpgrader::new(store.clone(), locks.clone(), hosts, provisioning)),
            30 * 60,
        ));
    }

    // ── Shutdown signal ────────────────────────────────────────

    let scheduled = maintainers
        .into_iter()
        .map(|(maintainer, secs)| Ok((maintainer, maintainer_interval(secs, interval_factor)?)))
        .collect::<anyhow::Result<Vec<_>>>()?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let handles: Vec<_> = scheduled
        .into_iter()
        .map(|(maintainer, interval)| tokio::spawn(run_maintainer(maintainer, interval, shutdown_rx.clone())))
        .collect();
    info!(maintainers = handles.len(), "maintainers started");

    tokio::signal::ctrl_c().await?;
    info!("shutdown signal received");
    let _ = shutdown_tx.send(true);

    for handle in handles {
        let _ = handle.await;
    }
    info!("NodeGrid daemon stopped");
    Ok(())
}
