use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use liblidar::{TaskService, TemplateSet, Transport};
use lidar_web::auth::StaticToken;
use lidar_web::config::{Cli, WebConfig};
use lidar_web::{AppState, build_cors, router, spawn_sweeper};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "lidar_web=info,liblidar=info".into()),
        )
        .init();

    let cli = Cli::parse();
    let mut config = WebConfig::load(cli.config.as_deref())?;
    config.apply(&cli);

    if config.remote.transport == Transport::Ssh && config.remote.password.is_empty() {
        tracing::warn!("no SSH password configured; set LIDAR_PASS or [remote].password");
    }
    if config.api_token.is_none() {
        tracing::warn!("no api_token configured; the API is open to any caller");
    }

    let cors = build_cors(&config.allow_origins)?;
    let templates = TemplateSet::builtin().with_overrides(config.templates.clone());
    let service = TaskService::from_config(config.remote.clone(), templates)
        .with_poll_interval(config.poll_interval());
    let state = AppState::new(service, Arc::new(StaticToken::new(config.api_token.clone())));

    spawn_sweeper(Arc::clone(&state), config.task_ttl(), config.sweep_interval());
    let app = router(state, cors);

    let listener = tokio::net::TcpListener::bind(config.listen)
        .await
        .with_context(|| format!("failed to bind web listener on {}", config.listen))?;

    tracing::info!(
        transport = ?config.remote.transport,
        host = %config.remote.host,
        "lidar-web listening on http://{}",
        config.listen
    );
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::error!("failed to listen for ctrl-c: {err}");
        std::future::pending::<()>().await;
    }
    tracing::info!("shutting down");
}
