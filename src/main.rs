//! Rewards Redemption Daemon
//!
//! Serves the redemption, verification and ledger HTTP API over an embedded
//! sled database.
//!
//! ## Usage
//!
//! ```bash
//! # Start with defaults
//! rewards-redemption
//!
//! # Start with custom config
//! rewards-redemption --config /path/to/config.toml
//!
//! # Start with custom HTTP port and storage directory
//! rewards-redemption --http-port 8096 --storage-dir /data/rewards
//!
//! # Expire overdue pending redemptions once and exit
//! rewards-redemption --sweep
//!
//! # Throwaway instance, JSON logs
//! rewards-redemption --in-memory --log-json
//! ```

use anyhow::Context;
use clap::Parser;
use rewards_redemption::services::spawn_logging_listener;
use rewards_redemption::{Config, HttpServer, Services, SledStore, Stores, SystemClock};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Parser, Debug)]
#[command(name = "rewards-redemption")]
#[command(about = "Points ledger and reward redemption service")]
struct Args {
    /// Path to config file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Storage directory
    #[arg(long, env = "REWARDS_STORAGE_DIR")]
    storage_dir: Option<PathBuf>,

    /// HTTP API port
    #[arg(long, env = "REWARDS_HTTP_PORT")]
    http_port: Option<u16>,

    /// Keep everything in memory (nothing survives a restart)
    #[arg(long)]
    in_memory: bool,

    /// Run one expiry sweep and exit
    #[arg(long)]
    sweep: bool,

    /// Emit logs as JSON lines
    #[arg(long)]
    log_json: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Initialize tracing
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("rewards_redemption=info"));
    let registry = tracing_subscriber::registry().with(filter);
    if args.log_json {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }

    // Load config
    let mut config = if let Some(config_path) = &args.config {
        Config::load(config_path)
            .with_context(|| format!("loading config from {}", config_path.display()))?
    } else {
        Config::default()
    };

    // Apply CLI overrides
    if let Some(dir) = args.storage_dir {
        config.storage_dir = dir;
    }
    if let Some(port) = args.http_port {
        config.http_port = port;
    }
    config.validate()?;

    info!(
        storage_dir = %config.storage_dir.display(),
        http_port = config.http_port,
        in_memory = args.in_memory,
        "Starting rewards-redemption"
    );

    let (stores, sled) = if args.in_memory {
        warn!("In-memory mode: redemptions and ledger entries are lost on exit");
        (Stores::in_memory(), None)
    } else {
        // Ensure storage directory exists
        tokio::fs::create_dir_all(&config.storage_dir).await?;

        // Save default config if it doesn't exist
        let config_path = config.config_path();
        if !config_path.exists() {
            config.save(&config_path)?;
            info!(path = %config_path.display(), "Created default config");
        }

        let store = Arc::new(
            SledStore::open(config.db_path(), &config.tables)
                .with_context(|| format!("opening {}", config.db_path().display()))?,
        );
        (Stores::from_backend(store.clone()), Some(store))
    };

    let services = Arc::new(Services::new(
        stores,
        Arc::new(SystemClock),
        config.policy.clone(),
    ));
    let listener = spawn_logging_listener(services.events.clone());

    if args.sweep {
        let expired = services.redemptions.expire_stale().await?;
        info!(expired, "Sweep finished");
    } else {
        let http_addr: SocketAddr = format!("{}:{}", config.http_host, config.http_port).parse()?;
        let http_server = Arc::new(HttpServer::new(services.clone(), http_addr));

        info!("HTTP API available at http://{}", http_addr);
        info!("Press Ctrl+C to stop.");

        // Handle shutdown signal
        let shutdown = async {
            tokio::signal::ctrl_c().await.ok();
            info!("Shutting down...");
        };

        tokio::select! {
            result = http_server.run() => {
                if let Err(e) = result {
                    error!(error = %e, "HTTP server error");
                }
            }
            _ = shutdown => {}
        }
    }

    listener.abort();

    if let Some(store) = sled {
        store.flush().await?;
        info!("Storage flushed");
    }

    Ok(())
}
