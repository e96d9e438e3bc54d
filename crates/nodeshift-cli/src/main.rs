//! Nodeshift CLI - rotate the node your traffic exits through

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use nodeshift_cli::config::{FileConfig, Overrides};
use nodeshift_cli::runtime::{build_context, build_providers};
use nodeshift_control::RecycleScheduler;
use nodeshift_proto::{Connection, Platform, ProviderKind, TunnelType};
use nodeshift_provider::ProviderAdapter;
use nodeshift_store::PersistenceStore;
use nodeshift_tunnel::ScriptMatrix;

/// Nodeshift - disposable cloud exit nodes, recycled on a timer
#[derive(Parser, Debug)]
#[command(name = "nodeshift")]
#[command(about = "Provision, tunnel through and recycle short-lived cloud nodes", long_about = None)]
#[command(version = env!("GIT_TAG"))]
#[command(long_version = concat!(env!("GIT_TAG"), "\nCommit: ", env!("GIT_HASH"), "\nBuilt: ", env!("BUILD_TIME")))]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Config file (default: ~/.nodeshift/config.yml)
    #[arg(short, long, env = "NODESHIFT_CONFIG", global = true)]
    config: Option<PathBuf>,

    /// Restrict to these providers (comma separated)
    #[arg(long = "provider", value_delimiter = ',', global = true)]
    providers: Vec<ProviderKind>,

    /// Tunnel type (wireguard, sshuttle, http_proxy, socks5_proxy)
    #[arg(short, long, global = true)]
    tunnel: Option<TunnelType>,

    /// Base URL of the host key exchange service
    #[arg(long, env = "NODESHIFT_KV_URL", global = true)]
    kv_url: Option<String>,

    /// Directory for the store, keys and known hosts
    #[arg(long, env = "NODESHIFT_STATE_DIR", global = true)]
    state_dir: Option<PathBuf>,

    /// Block all traffic outside the tunnel
    #[arg(long, global = true)]
    killswitch: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info", global = true)]
    log_level: String,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Keep a node active and recycle it on schedule until Ctrl+C
    Run,
    /// Replace the active node once and exit, leaving the new node active
    Cycle,
    /// List eligible regions per provider
    Regions,
    /// List countries each provider can place nodes in
    Countries,
    /// Show the active node and recorded connections
    Status {
        /// Print the raw store document as JSON
        #[arg(long)]
        json: bool,
    },
    /// Retire the active node and delete every instance carrying the name prefix
    Cleanup,
    /// Check the configuration and the tunnel script matrix
    Validate {
        /// Check every tunnel type and platform, not only the configured ones
        #[arg(long)]
        all: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    init_logging(&cli.log_level)?;

    let mut file = FileConfig::resolve(cli.config.as_deref())?;
    file.apply(Overrides {
        providers: cli.providers,
        tunnel_type: cli.tunnel,
        kv_base_url: cli.kv_url,
        state_dir: cli.state_dir,
        killswitch: cli.killswitch.then_some(true),
    });

    match cli.command {
        Commands::Run => handle_run(&file).await,
        Commands::Cycle => handle_cycle(&file).await,
        Commands::Regions => handle_regions(&file).await,
        Commands::Countries => handle_countries(&file).await,
        Commands::Status { json } => handle_status(&file, json),
        Commands::Cleanup => handle_cleanup(&file).await,
        Commands::Validate { all } => handle_validate(&file, all),
    }
}

/// Cancel `token` on Ctrl+C
fn cancel_on_ctrl_c(token: CancellationToken) {
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        info!("Shutting down...");
        token.cancel();
    });
}

async fn handle_run(file: &FileConfig) -> Result<()> {
    let ctx = build_context(file).await?;
    let cancel = CancellationToken::new();
    cancel_on_ctrl_c(cancel.clone());

    let mut scheduler = RecycleScheduler::new(ctx);
    scheduler
        .run(cancel)
        .await
        .context("Recycle loop stopped with an error")?;

    info!("✅ Nodeshift stopped");
    Ok(())
}

async fn handle_cycle(file: &FileConfig) -> Result<()> {
    let ctx = build_context(file).await?;
    let cancel = CancellationToken::new();
    cancel_on_ctrl_c(cancel.clone());

    let mut scheduler = RecycleScheduler::new(ctx);
    if let Err(e) = scheduler.adopt_persisted().await {
        warn!("Could not adopt previously active node: {}", e);
    }
    scheduler
        .run_cycle(&cancel)
        .await
        .context("Cycle failed")?;

    if let Some(node) = scheduler.active() {
        println!("✅ Active node: {}", node.name);
        println!("   Provider: {}", node.provider);
        println!("   Region:   {}", node.region.as_deref().unwrap_or("-"));
        if let Some(ip) = node.public_ip {
            println!("   IP:       {}", ip);
        }
        println!("   Tunnel:   {}", node.tunnel_type);
    }
    Ok(())
}

fn providers_for(file: &FileConfig) -> Result<Vec<Arc<dyn ProviderAdapter>>> {
    build_providers(&file.orchestrator.providers, &file.credentials, &[])
}

async fn handle_regions(file: &FileConfig) -> Result<()> {
    let config = &file.orchestrator;
    let disabled = config.disabled_country_set();

    for provider in providers_for(file)? {
        let size = config
            .instance_size
            .clone()
            .unwrap_or_else(|| provider.capability().default_size.clone());
        let regions = provider
            .list_regions(&size, &disabled)
            .await
            .with_context(|| format!("Failed to list {} regions", provider.kind()))?;

        println!("{} ({} regions for size {})", provider.kind(), regions.len(), size);
        for region in regions {
            println!("  {:<16} {}", region.id, region.country);
        }
    }
    Ok(())
}

async fn handle_countries(file: &FileConfig) -> Result<()> {
    let disabled = file.orchestrator.disabled_country_set();

    for provider in providers_for(file)? {
        let countries = provider
            .list_countries()
            .await
            .with_context(|| format!("Failed to list {} countries", provider.kind()))?;

        let rendered: Vec<String> = countries
            .iter()
            .map(|c| {
                if disabled.contains(c) {
                    format!("{} (disabled)", c)
                } else {
                    c.clone()
                }
            })
            .collect();
        println!("{}: {}", provider.kind(), rendered.join(", "));
    }
    Ok(())
}

fn handle_status(file: &FileConfig, json: bool) -> Result<()> {
    let path = file.orchestrator.store_path();
    let store = PersistenceStore::open(&path)
        .with_context(|| format!("Failed to open store: {:?}", path))?;

    if json {
        let document = serde_json::to_string_pretty(&store.snapshot())
            .context("Failed to serialize store")?;
        println!("{}", document);
        return Ok(());
    }

    let active = store.active_connection();
    match &active {
        Some(active) => {
            println!("✅ Active node: {}", active.name);
            print_connection(active);
        }
        None => println!("No active node"),
    }

    let active_id = active.map(|a| a.id);
    let others: Vec<Connection> = store
        .live_connections()
        .into_iter()
        .filter(|c| active_id.as_ref() != Some(&c.id))
        .collect();
    if !others.is_empty() {
        println!();
        println!("Other recorded nodes ({})", others.len());
        for connection in &others {
            println!("  {} [{}]", connection.name, connection.state);
            print_connection(connection);
        }
    }
    Ok(())
}

fn print_connection(connection: &Connection) {
    println!("    Provider: {}", connection.provider);
    println!("    Region:   {}", connection.region.as_deref().unwrap_or("-"));
    if let Some(ip) = connection.public_ip {
        println!("    IP:       {}", ip);
    }
    println!("    Tunnel:   {}", connection.tunnel_type);
    println!(
        "    Created:  {}",
        connection.created_at.format("%Y-%m-%d %H:%M:%S UTC")
    );
}

async fn handle_cleanup(file: &FileConfig) -> Result<()> {
    let ctx = build_context(file).await?;
    let mut scheduler = RecycleScheduler::new(ctx);
    if let Err(e) = scheduler.adopt_persisted().await {
        warn!("Could not adopt previously active node: {}", e);
    }
    if let Some(node) = scheduler.active() {
        println!("Retiring active node {}", node.name);
    }

    let summary = scheduler.cleanup().await.context("Cleanup failed")?;

    println!(
        "🗑️  Deleted {} other instance(s), {} already gone",
        summary.deleted.len(),
        summary.not_found.len()
    );
    if !summary.is_clean() {
        for (id, error) in &summary.failed {
            println!("  ❌ {}: {}", id, error);
        }
        bail!("{} instance(s) could not be deleted", summary.failed.len());
    }
    Ok(())
}

fn handle_validate(file: &FileConfig, all: bool) -> Result<()> {
    let config = &file.orchestrator;
    config.validate().context("Invalid configuration")?;
    providers_for(file)?;

    let (tunnels, platforms) = if all {
        (TunnelType::ALL.to_vec(), Platform::ALL.to_vec())
    } else {
        (vec![config.tunnel_type], vec![config.platform])
    };
    ScriptMatrix::standard()
        .validate(&tunnels, &platforms)
        .context("Tunnel script matrix is incomplete")?;

    println!("✅ Configuration is valid");
    println!("   Providers: {:?}", config.providers);
    println!("   Tunnel:    {} on {}", config.tunnel_type, config.platform);
    println!("   Killswitch: {}", config.killswitch.enabled);
    Ok(())
}

fn init_logging(log_level: &str) -> Result<()> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .or_else(|_| tracing_subscriber::EnvFilter::try_new(log_level))
        .context("Failed to initialize logging filter")?;

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();

    Ok(())
}
