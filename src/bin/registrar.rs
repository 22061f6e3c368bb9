//! Registrar binary

use clap::{Parser, Subcommand};
use registrar::instance::parse_port_mapping;
use registrar::registry::{dns_records, host_entries, publish_hosts_file};
use registrar::{Instance, InstanceId, Registrar, RegistrarConfig};
use std::net::IpAddr;
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "registrar")]
#[command(about = "Instance registry and slot locks on an etcd-style store")]
struct Cli {
    /// Configuration file (TOML)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Store endpoint, overrides the configured endpoints (repeatable)
    #[arg(long, global = true)]
    endpoint: Vec<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Follow the registry until interrupted
    Watch {
        /// Keep this hosts file in sync with the registry
        #[arg(long)]
        hosts_file: Option<PathBuf>,
    },

    /// Claim an instance slot
    Lock {
        #[arg(long)]
        group: String,

        #[arg(long)]
        service: String,

        #[arg(long)]
        instance: u32,
    },

    /// Announce a live instance
    Announce {
        #[arg(long)]
        group: String,

        #[arg(long)]
        service: String,

        #[arg(long)]
        instance: u32,

        /// Instance address (repeatable)
        #[arg(long)]
        addr: Vec<IpAddr>,

        /// Port mapping as host:container (repeatable)
        #[arg(long)]
        port: Vec<String>,

        /// Refresh the announcement until interrupted
        #[arg(long)]
        keep_alive: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Load config from file and environment, then apply CLI overrides
    let mut config = RegistrarConfig::load(cli.config.as_deref())?;
    if !cli.endpoint.is_empty() {
        config.store.endpoints = cli.endpoint;
    }

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| config.log_level.clone().into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let registrar = Registrar::connect(config)?;

    match cli.command {
        Commands::Watch { hosts_file } => watch(&registrar, hosts_file).await?,
        Commands::Lock {
            group,
            service,
            instance,
        } => {
            registrar
                .claims()
                .lock_instance(&group, &service, instance)
                .await?;
            println!("locked {}", InstanceId::new(group, service, instance));
        }
        Commands::Announce {
            group,
            service,
            instance,
            addr,
            port,
            keep_alive,
        } => {
            let mut announced = Instance::new(InstanceId::new(group, service, instance)).with_addrs(addr);
            for mapping in &port {
                let (host, container) = parse_port_mapping(mapping)?;
                announced = announced.with_port(host, container);
            }
            announce(&registrar, &announced, keep_alive).await?;
        }
    }

    Ok(())
}

async fn watch(registrar: &Registrar, hosts_file: Option<PathBuf>) -> anyhow::Result<()> {
    let suffix = registrar.config().domain_suffix.clone();
    let running = registrar.start();
    let mut registry = running.registry();

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Interrupted");
                break;
            }
            snapshot = registry.changed() => {
                let Some(snapshot) = snapshot else {
                    tracing::warn!("Registry closed");
                    break;
                };
                let records = dns_records(&snapshot, &suffix);
                tracing::info!(
                    "Snapshot {}: {} instances, {} names",
                    snapshot.generation(),
                    snapshot.len(),
                    records.len()
                );
                if let Some(path) = &hosts_file {
                    let lines = host_entries(&snapshot, &suffix);
                    if let Err(e) = publish_hosts_file(path.clone(), lines).await {
                        tracing::error!("Failed to write {}: {}", path.display(), e);
                    }
                }
            }
        }
    }

    running.shutdown().await?;
    Ok(())
}

async fn announce(registrar: &Registrar, instance: &Instance, keep_alive: bool) -> anyhow::Result<()> {
    let claims = registrar.claims();
    claims.update_instance(instance).await?;
    println!("announced {}", instance);
    if !keep_alive {
        return Ok(());
    }

    // Refresh at half the TTL so one missed write does not drop the entry
    let period = registrar.config().leases.update_ttl() / 2;
    let mut ticker = tokio::time::interval(period);
    ticker.tick().await;
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            _ = ticker.tick() => {
                if let Err(e) = claims.update_instance(instance).await {
                    tracing::warn!("Refreshing {} failed: {}", instance.qualified_name(), e);
                }
            }
        }
    }
    Ok(())
}
