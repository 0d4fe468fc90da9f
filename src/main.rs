#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

//! # wsrelay
//!
//! Reverse HTTP proxy tunneled over pooled WebSocket connections.
//!
//! Agents behind NAT dial out to a gateway and keep a pool of idle tunnel
//! connections open. The gateway tunnels every inbound HTTP request through
//! one of them; the agent executes it against the real origin and sends the
//! response back on the same connection.
//!
//! ## Subcommands
//!
//! - `wsrelay gateway`: accept agent registrations and client requests
//! - `wsrelay agent`: dial the configured gateways and serve their requests
//!
//! ## Architecture
//!
//! ```text
//! main.rs              entry point, clap subcommands, graceful shutdown
//! config.rs            TOML + env-var configuration
//! error.rs             TunnelError taxonomy
//! record.rs            JSON request/response records, greeting
//! tunnel/
//!   transport.rs       axum / tungstenite WebSockets as one frame transport
//!   connection.rs      connection state machine, reader loop, exchange
//!   pool.rs            bounded connection pool
//! gateway/
//!   mod.rs             router: registration, /stats, /test, proxy fallback
//!   registry.rs        agent name -> pool, round-robin order, sweep
//!   dispatch.rs        time-boxed admission loop
//! agent/
//!   mod.rs             multi-target supervisor
//!   target.rs          dialing, greeting, maintenance, keepalive
//!   executor.rs        executes tunneled requests against origins
//! ```

use std::sync::Arc;

use clap::{Parser, Subcommand};
use tokio::net::TcpListener;
use tracing::{error, info};

use wsrelay::agent::{Agent, WsConnector};
use wsrelay::config::Config;
use wsrelay::gateway::{self, GatewayState};

/// Reverse HTTP proxy tunneled over pooled WebSocket connections.
#[derive(Parser)]
#[command(name = "wsrelay", version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Accept agent registrations and tunnel client requests to them.
    Gateway {
        /// Path to TOML config file.
        #[arg(long)]
        config: Option<String>,
    },
    /// Dial the configured gateways and execute the requests they tunnel.
    Agent {
        /// Path to TOML config file.
        #[arg(long)]
        config: Option<String>,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let (config_path, run_gateway) = match &cli.command {
        Commands::Gateway { config } => (config.as_deref(), true),
        Commands::Agent { config } => (config.as_deref(), false),
    };

    let config = match Config::load(config_path) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("wsrelay: {e}");
            std::process::exit(1);
        }
    };

    // Initialize tracing
    let log_filter = std::env::var("RUST_LOG").unwrap_or_else(|_| config.logging.level.clone());
    tracing_subscriber::fmt().with_env_filter(log_filter).init();

    info!("wsrelay v{} starting", env!("CARGO_PKG_VERSION"));

    let result = if run_gateway {
        run_gateway_mode(config).await
    } else {
        run_agent_mode(config).await;
        Ok(())
    };
    if let Err(e) = result {
        error!("{e}");
        std::process::exit(1);
    }
    info!("Goodbye");
}

async fn run_gateway_mode(config: Config) -> std::io::Result<()> {
    let gateway_config = config.gateway;
    info!("Listening on {}", gateway_config.listen);
    info!(
        "Agents register on {} (destination mode {:?})",
        gateway_config.register_path, gateway_config.destination
    );

    let listener = TcpListener::bind(&gateway_config.listen).await?;
    let sweep_every = std::time::Duration::from_secs(gateway_config.sweep_interval_secs);
    let state = GatewayState::new(gateway_config);
    let registry = Arc::clone(&state.registry);
    let app = gateway::gateway_router(state);

    // Periodic sweep: drop closed connections and empty pools
    let sweep_task = gateway::spawn_sweep(Arc::clone(&registry), sweep_every);

    info!("Gateway ready");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    // Cleanup
    info!("Shutting down...");
    sweep_task.abort();
    registry.close_all().await;
    Ok(())
}

async fn run_agent_mode(config: Config) {
    let agent_config = config.agent;
    info!("Agent name: {}", agent_config.name);
    for target in &agent_config.targets {
        info!("Gateway target: {target}");
    }

    let agent = Agent::new(agent_config, Arc::new(WsConnector));
    agent.start();

    shutdown_signal().await;

    info!("Shutting down...");
    agent.shutdown().await;
}

/// Resolves on SIGINT, or SIGTERM on unix.
async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();
    #[cfg(unix)]
    {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => info!("Received SIGINT"),
                    _ = sigterm.recv() => info!("Received SIGTERM"),
                }
            }
            Err(e) => {
                error!("Failed to register SIGTERM handler: {e}");
                ctrl_c.await.ok();
                info!("Received SIGINT");
            }
        }
    }
    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
        info!("Received SIGINT");
    }
}
