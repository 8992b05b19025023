use std::time::Duration;

use clap::Parser;
use fede_core::FedeConfig;
use tokio::sync::broadcast;
use tracing_subscriber::{fmt, EnvFilter};

use fede_server::{router, server, sweeper, AppState};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    #[arg(short, long, default_value = "fede.toml")]
    config: String,

    /// Check storage and exit.
    #[arg(long)]
    health: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env file if present (local development)
    dotenvy::dotenv().ok();

    let args = Args::parse();

    let config = match FedeConfig::load(&args.config) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Failed to load config from {}: {}", args.config, e);
            std::process::exit(1);
        }
    };

    let default_level = config
        .service
        .log_level
        .parse::<tracing::Level>()
        .unwrap_or(tracing::Level::INFO);
    fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive(default_level.into()))
        .init();

    let state = match AppState::from_config(config).await {
        Ok(s) => s,
        Err(e) => {
            eprintln!("Failed to initialise Fede: {}", e);
            std::process::exit(1);
        }
    };

    if args.health {
        match router::health_report(&state).await {
            Ok(report) => {
                println!("✅ Fede health check passed");
                println!("{}", serde_json::to_string_pretty(&report)?);
                return Ok(());
            }
            Err(e) => {
                println!("❌ Health check failed: {}", e);
                std::process::exit(1);
            }
        }
    }

    let (tx, _rx) = broadcast::channel(1);
    let shutdown_tx = tx.clone();

    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to listen for Ctrl+C: {}", e);
        }
        tracing::info!("Shutdown signal received");
        let _ = shutdown_tx.send(());
    });

    let idle = Duration::from_secs(state.config().session.idle_timeout_seconds.max(60));
    tokio::spawn(sweeper::run_session_sweeper(state.engine.clone(), idle / 2, tx.subscribe()));

    let mut tasks = Vec::new();

    if let Some(socket_path) = state.config().service.socket_path.clone() {
        let ipc_state = state.clone();
        let ipc_shutdown = tx.subscribe();
        tasks.push(tokio::spawn(async move {
            if let Err(e) = server::run_unix_server(&socket_path, ipc_state, ipc_shutdown).await {
                tracing::error!("IPC server error: {}", e);
            }
        }));
    }

    if state.config().http.enabled {
        let http_state = state.clone();
        let http_shutdown = tx.subscribe();
        tasks.push(tokio::spawn(async move {
            if let Err(e) = fede_server::http::start_http_server(http_state, http_shutdown).await {
                tracing::error!("HTTP server error: {}", e);
            }
        }));
    }

    if tasks.is_empty() {
        anyhow::bail!("Neither http.enabled nor service.socket_path is set; nothing to serve");
    }

    for task in tasks {
        task.await?;
    }

    Ok(())
}
