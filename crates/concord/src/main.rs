//! # Concord - gateway cluster coordination node
//!
//! Boots the coordination layer for one gateway process and serves a
//! read-only status surface.
//!
//! ## Architecture
//! ```text
//! Gateway nodes ⇄ Redis (registry, master row, replay ids, properties)
//!       ⇅
//! multicast group (replicated replay map)
//! ```

use anyhow::{Context, Result};
use clap::Parser;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

use concord::config::{AppConfig, Overrides};
use concord::{ClusterContext, routes};

/// Concord - gateway cluster coordination
#[derive(Parser, Debug)]
#[command(name = "concord")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Configuration file path
    #[arg(short, long, default_value = "config/concord.toml")]
    config: String,

    /// Redis URL (overrides config)
    #[arg(long, env = "REDIS_URL")]
    redis_url: Option<String>,

    /// Status listen address (overrides config)
    #[arg(short, long, env = "LISTEN_ADDR")]
    listen: Option<String>,

    /// Node id (overrides hardware fingerprinting)
    #[arg(long, env = "CONCORD_NODE_ID")]
    node_id: Option<String>,

    /// Pin this node id as master
    #[arg(long, env = "CONCORD_MASTER_NODE")]
    master_node: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info", env = "LOG_LEVEL")]
    log_level: String,

    /// Enable JSON logging output
    #[arg(long, default_value = "false")]
    json_logs: bool,
}

impl Args {
    fn overrides(&self) -> Overrides {
        Overrides {
            redis_url: self.redis_url.clone(),
            listen_addr: self.listen.clone(),
            node_id: self.node_id.clone(),
            master_override: self.master_node.clone(),
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // A missing .env is normal
    let _ = dotenvy::dotenv();

    // Parse CLI arguments
    let args = Args::parse();

    // Initialize logging
    init_logging(&args.log_level, args.json_logs)?;

    info!("Starting Concord v{}", env!("CARGO_PKG_VERSION"));

    // Load configuration
    let config = AppConfig::load(&args.config, &args.overrides())?;
    info!("Configuration loaded from {}", args.config);
    let listen_addr = config.listen_addr.clone();

    // Boot the coordination layer
    let ctx = Arc::new(
        ClusterContext::new(config)
            .await
            .context("Failed to start cluster coordination")?,
    );
    ctx.start();

    // Build router
    let app = routes::create_router(ctx.clone());

    // Start server
    let listener = tokio::net::TcpListener::bind(&listen_addr)
        .await
        .with_context(|| format!("Failed to bind {listen_addr}"))?;
    info!("Concord status listening on {}", listen_addr);

    // Handle graceful shutdown
    let shutdown_signal = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for Ctrl+C");
        }
        info!("Shutdown signal received");
    };

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal)
        .await
        .context("Server error")?;

    ctx.shutdown().await;
    info!("Concord shutdown complete");
    Ok(())
}

/// Initialize structured logging with tracing
fn init_logging(level: &str, json: bool) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    if json {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(true).with_thread_ids(true))
            .init();
    }

    Ok(())
}
