//! WolfGroup - Cluster Group Membership
//!
//! Runs a group membership node and manages its configuration file.

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use wolfgroup::cluster::{MemoryCluster, Node};
use wolfgroup::config::{LoggingConfig, WolfGroupConfig};
use wolfgroup::error::Result;
use wolfgroup::group::{Collaborators, GroupManager};
use wolfgroup::local::SqliteConfigStore;
use wolfgroup::transport::{Event, EventHandler, LocalTransportFactory};

/// WolfGroup - Cluster Group Membership
#[derive(Parser)]
#[command(name = "wolfgroup")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "wolfgroup.toml")]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error); overrides the configuration file
    #[arg(short, long)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the WolfGroup node
    Start,

    /// Initialize a new configuration file
    Init {
        /// Output path for configuration file
        #[arg(short, long, default_value = "wolfgroup.toml")]
        output: PathBuf,

        /// Node ID
        #[arg(long, default_value = "node-1")]
        node_id: String,
    },

    /// Validate configuration file
    Validate,

    /// Show node information
    Info,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // The configuration may not exist yet (init) or be invalid (validate)
    let logging = WolfGroupConfig::from_file(&cli.config)
        .map(|c| c.logging)
        .unwrap_or_default();
    let level = cli.log_level.clone().unwrap_or_else(|| logging.level.clone());
    init_logging(&level, &logging);

    match cli.command {
        Commands::Start => run_start(cli.config).await,
        Commands::Init { output, node_id } => run_init(output, node_id),
        Commands::Validate => run_validate(cli.config),
        Commands::Info => run_info(cli.config),
    }
}

/// Initialize logging
fn init_logging(level: &str, logging: &LoggingConfig) {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| level.into());

    let compact = logging.format == "compact";
    tracing_subscriber::registry()
        .with(env_filter)
        .with(compact.then(|| tracing_subscriber::fmt::layer().compact()))
        .with((!compact).then(tracing_subscriber::fmt::layer))
        .init();
}

/// Logs events delivered on group channels
struct LoggingHandler;

#[async_trait]
impl EventHandler for LoggingHandler {
    async fn handle(&self, event: Event) {
        tracing::info!(
            "Event {} on group {} from {}: {}",
            event.id,
            event.channel,
            event.source,
            event.payload
        );
    }
}

/// Start the WolfGroup node
async fn run_start(config_path: PathBuf) -> Result<()> {
    tracing::info!("Starting WolfGroup node...");

    let config = match WolfGroupConfig::from_file(&config_path) {
        Ok(c) => c,
        Err(e) => {
            tracing::error!("Failed to load configuration from {:?}: {}", config_path, e);
            tracing::error!("Please check that the config file exists and is valid TOML");
            return Err(e);
        }
    };
    tracing::info!("Loaded configuration for node: {}", config.node.id);

    if let Err(e) = std::fs::create_dir_all(config.data_dir()) {
        tracing::error!("Failed to create data directory {:?}: {}", config.data_dir(), e);
        return Err(e.into());
    }

    let local_config = Arc::new(SqliteConfigStore::open(&config.config_db_path())?);
    tracing::info!("Local configuration at {:?}", config.config_db_path());

    let cluster = MemoryCluster::new();
    let view = cluster
        .join(Node::new(config.node.id.clone(), config.node.address.clone()))
        .await;

    let transport = Arc::new(
        LocalTransportFactory::new(config.transport.channel_capacity)
            .with_handler(Arc::new(LoggingHandler)),
    );

    let manager = GroupManager::new(
        config.group_settings(),
        Collaborators {
            cluster: Arc::new(view.clone()),
            group_config: view.group_config_store(),
            node_groups: view.node_groups_store(),
            local_config,
            transport,
        },
    );
    manager.init().await?;

    for name in &config.groups.auto_join {
        match manager.register_group(name).await {
            Ok(group) => tracing::info!("Joined group {} ({} member(s))", group.name, group.members.len()),
            Err(e) => tracing::warn!("Failed to join group {}: {}", name, e),
        }
    }

    for group in manager.list_groups().await?.values() {
        let members: Vec<String> = group.members.iter().map(|n| n.to_string()).collect();
        tracing::info!("Group {}: {:?}", group.name, members);
    }

    tracing::info!("WolfGroup node {} running", config.node.id);
    tokio::signal::ctrl_c().await?;
    tracing::info!("Received shutdown signal");

    manager.shutdown().await?;
    tracing::info!("WolfGroup shutdown complete");
    Ok(())
}

/// Initialize a new configuration file
fn run_init(output: PathBuf, node_id: String) -> Result<()> {
    let config_content = format!(r#"# WolfGroup Configuration
# Generated configuration file

[node]
id = "{node_id}"
address = "127.0.0.1:5701"
data_dir = "/var/lib/wolfgroup/{node_id}"

[groups]
pid = "wolfgroup.groups"
node_pid = "wolfgroup.node"
groups_key = "groups"
default_group = "default"
reserved_prefixes = ["felix.", "service."]
auto_join = []
# auto_join = ["ops", "web"]

[transport]
exclusive = true
channel_capacity = 1024

[logging]
level = "info"
format = "pretty"
"#);

    std::fs::write(&output, config_content)?;
    println!("Configuration file created: {}", output.display());
    println!("\nEdit the file to configure the node address and groups.");
    println!("Then start with: wolfgroup start --config {}", output.display());

    Ok(())
}

/// Validate configuration
fn run_validate(config_path: PathBuf) -> Result<()> {
    match WolfGroupConfig::from_file(&config_path) {
        Ok(config) => {
            println!("✓ Configuration is valid");
            println!("  Node ID: {}", config.node.id);
            println!("  Address: {}", config.node.address);
            println!("  Default Group: {}", config.groups.default_group);
            println!("  Auto Join: {}", config.groups.auto_join.join(", "));
            Ok(())
        }
        Err(e) => {
            eprintln!("✗ Configuration error: {}", e);
            Err(e)
        }
    }
}

/// Show node information
fn run_info(config_path: PathBuf) -> Result<()> {
    let config = WolfGroupConfig::from_file(&config_path)?;

    println!("WolfGroup Node Information");
    println!("==========================");
    println!();
    println!("Node ID:          {}", config.node.id);
    println!("Address:          {}", config.node.address);
    println!("Data Directory:   {}", config.data_dir().display());
    println!("Config Database:  {}", config.config_db_path().display());
    println!();
    println!("Group Configuration:");
    println!("  PID:            {}", config.groups.pid);
    println!("  Node PID:       {}", config.groups.node_pid);
    println!("  Groups Key:     {}", config.groups.groups_key);
    println!("  Default Group:  {}", config.groups.default_group);
    println!("  Local Only:     {}", config.groups.reserved_prefixes.join(", "));
    println!();
    println!("Transport:");
    println!("  Exclusive:      {}", config.transport.exclusive);
    println!("  Capacity:       {}", config.transport.channel_capacity);

    Ok(())
}
