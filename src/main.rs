use anyhow::Context;
use clap::{Parser, Subcommand};
use cluster_pool::config::{Config, ConfigError};
use cluster_pool::core::NodeRole;
use cluster_pool::{
    ConnectionPool, NodeConnection, PoolError, PoolEvent, PoolEventKind, RespConnectionFactory,
};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Parser)]
#[command(name = "cluster-pool")]
#[command(about = "Connection pool and topology manager for Redis Cluster nodes")]
#[command(version = env!("CARGO_PKG_VERSION"))]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Connect to the configured nodes and hold the pool open until Ctrl-C
    Run {
        /// Path to configuration file
        #[arg(short, long, default_value = "config/dev.toml")]
        config: PathBuf,
    },
    /// Generate an example configuration file
    Config {
        /// Output file path
        #[arg(short, long)]
        output: PathBuf,
    },
    /// Validate configuration file
    Validate {
        /// Path to configuration file to validate
        #[arg(short, long)]
        config: PathBuf,
    },
    /// Show version information
    Version,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Run { config } => run_pool(config).await?,
        Commands::Config { output } => generate_config(output)?,
        Commands::Validate { config } => validate_config(config)?,
        Commands::Version => show_version(),
    }

    Ok(())
}

async fn run_pool(config_path: PathBuf) -> anyhow::Result<()> {
    let config = match Config::load_from_file(&config_path).map_err(PoolError::from) {
        Ok(config) => config,
        Err(e) => {
            // logging is configured by the file that failed to load
            eprintln!("[{}] {}", e.severity(), e);
            return Err(e).with_context(|| format!("Failed to load config from {:?}", config_path));
        }
    };

    init_logging(&config);

    info!(
        version = env!("CARGO_PKG_VERSION"),
        config = ?config_path,
        nodes = config.pool.nodes.len(),
        "Starting cluster-pool"
    );

    let pool = ConnectionPool::new(Arc::new(RespConnectionFactory), config.connection.clone());
    pool.subscribe(PoolEventKind::NodeAdded, |event: &PoolEvent| {
        if let Some(conn) = event.connection() {
            info!(node = %conn.key(), read_only = conn.is_read_only(), "Node added");
        }
    });
    pool.subscribe(PoolEventKind::NodeRemoved, |event: &PoolEvent| {
        if let Some(conn) = event.connection() {
            info!(node = %conn.key(), "Node removed");
        }
    });
    pool.subscribe(PoolEventKind::NodeError, |event: &PoolEvent| {
        if let PoolEvent::NodeError { key, error } = event {
            warn!(node = %key, error = %error, "Node error");
        }
    });

    let reset = pool
        .reset(config.pool.nodes.clone())
        .inspect_err(|e| error!(severity = %e.severity(), "Initial reconciliation failed: {}", e))?;
    match tokio::time::timeout(config.pool.ready_timeout(), pool.ready()).await {
        Ok(()) => info!(epoch = reset.epoch(), nodes = pool.len(), "Pool ready"),
        Err(_) => warn!(
            timeout_ms = config.pool.ready_timeout_ms,
            "Pool did not become ready in time"
        ),
    }

    for conn in pool.nodes(NodeRole::All) {
        match conn.ping().await {
            Ok(()) => info!(node = %conn.key(), status = %conn.status(), "PING ok"),
            Err(e) => warn!(node = %conn.key(), error = %e, "PING failed"),
        }
    }

    info!(
        masters = ?pool.keys(NodeRole::Master),
        replicas = ?pool.keys(NodeRole::Slave),
        "Registry"
    );

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;
    info!("Shutting down, disconnecting {} nodes", pool.len());

    let drained = Arc::new(Notify::new());
    let notify = Arc::clone(&drained);
    pool.subscribe(PoolEventKind::Drain, move |_| notify.notify_one());
    pool.disconnect_all()
        .inspect_err(|e| error!(severity = %e.severity(), "Disconnect failed: {}", e))?;

    if !pool.is_empty() && tokio::time::timeout(DRAIN_TIMEOUT, drained.notified()).await.is_err() {
        warn!(remaining = pool.len(), "Timed out waiting for connections to close");
    }

    info!("Pool drained");
    Ok(())
}

fn generate_config(output: PathBuf) -> anyhow::Result<()> {
    println!("Generating configuration file: {:?}", output);

    Config::create_example_config(&output).context("Failed to generate config")?;

    println!("Configuration file generated successfully!");
    println!("Edit the file to match your environment and run:");
    println!("  cluster-pool run --config {:?}", output);

    Ok(())
}

fn validate_config(config_path: PathBuf) -> anyhow::Result<()> {
    println!("Validating configuration file: {:?}", config_path);

    match Config::load_from_file(&config_path) {
        Ok(config) => {
            println!("✓ Configuration file is valid");
            println!("  Ready timeout: {}ms", config.pool.ready_timeout_ms);
            println!("  Cluster nodes: {} entries", config.pool.nodes.len());
            for (i, node) in config.pool.nodes.iter().enumerate() {
                // validate() already resolved every entry
                if let Ok(options) = node.resolve() {
                    let role = if options.read_only { "replica" } else { "master" };
                    println!("    {}: {} ({})", i + 1, options.key(), role);
                }
            }
            Ok(())
        }
        Err(e) => {
            eprintln!("✗ Configuration file validation failed:");
            match &e {
                ConfigError::IoError(msg) => eprintln!("  File error: {}", msg),
                ConfigError::ParseError(msg) => eprintln!("  Parse error: {}", msg),
                ConfigError::ValidationError(msg) => eprintln!("  Validation error: {}", msg),
                ConfigError::SerializeError(msg) => eprintln!("  Serialization error: {}", msg),
            }
            Err(e.into())
        }
    }
}

fn show_version() {
    println!("cluster-pool v{}", env!("CARGO_PKG_VERSION"));
    println!("Connection pool and topology manager for Redis Cluster nodes");
    println!();
    println!("Target: {}", std::env::consts::ARCH);
}

fn init_logging(config: &Config) {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.logging.level))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    let builder = tracing_subscriber::fmt().with_env_filter(filter).with_target(false);
    if config.logging.format == "json" {
        builder.json().init();
    } else {
        builder.compact().init();
    }
}
