// ABOUTME: Entry point for the eventrelay binary.
// ABOUTME: Parses CLI arguments, initializes tracing, and runs the relay server or prints store stats.

use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use eventrelay_server::{AppState, Environment, LogSink, RelayConfig, create_router};
use eventrelay_store::StorageManager;
use tokio::sync::watch;

#[derive(Parser)]
#[command(name = "eventrelay")]
#[command(about = "Durable event delta store and status relay", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the HTTP server with the forwarding and stale-event loops (default)
    Serve,

    /// Print entity counts and queue statistics for every environment
    Stats,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| {
                    tracing_subscriber::EnvFilter::new("eventrelay=debug,tower_http=debug")
                }),
        )
        .init();

    let cli = Cli::parse();
    let config = RelayConfig::from_env()?;

    match cli.command.unwrap_or(Commands::Serve) {
        Commands::Serve => serve(config).await,
        Commands::Stats => stats(config).await,
    }
}

async fn serve(config: RelayConfig) -> anyhow::Result<()> {
    tracing::info!("eventrelay starting up, home {}", config.home.display());

    let manager = StorageManager::new(config.home.clone())?;
    let environments = config.load_environments()?;
    let state = Arc::new(AppState::open(&manager, &environments)?);
    tracing::info!(
        "opened {} environments: {}",
        state.environments.len(),
        state
            .environments
            .keys()
            .cloned()
            .collect::<Vec<_>>()
            .join(", ")
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let tasks = state.spawn_background(Arc::new(LogSink), &shutdown_rx);

    let app = create_router(Arc::clone(&state));
    let listener = tokio::net::TcpListener::bind(config.bind)
        .await
        .with_context(|| format!("failed to bind {}", config.bind))?;
    tracing::info!("listening on {}", config.bind);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    // Loops finish their current round before observing the signal.
    let _ = shutdown_tx.send(true);
    for task in tasks {
        if let Err(e) = task.await {
            tracing::error!("background task panicked: {}", e);
        }
    }

    state.close().await;
    tracing::info!("eventrelay stopped");
    Ok(())
}

async fn stats(config: RelayConfig) -> anyhow::Result<()> {
    let manager = StorageManager::new(config.home.clone())?;
    let environments = config.load_environments()?;

    for (name, env_config) in &environments.environments {
        let env = Environment::open(&manager, name, env_config, &environments.base_dir)?;
        let report = serde_json::json!({
            "environment": name,
            "entities": env.events.entity_ids()?.len(),
            "queue": env.queue.stats()?,
            "info": env.queue.info()?,
        });
        println!("{}", serde_json::to_string_pretty(&report)?);
        env.close().await;
    }

    for name in manager.list_environments()? {
        if !environments.environments.contains_key(&name) {
            tracing::warn!("{} has data on disk but is not configured", name);
        }
    }
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("failed to listen for ctrl-c: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!("failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
    tracing::info!("shutdown requested");
}
