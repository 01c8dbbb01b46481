pub mod api;
pub mod auth;
pub mod config;
pub mod ws;

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::http::{HeaderValue, Method};
use axum::routing::{get, post};
use axum::{Router, middleware};
use liblidar::TaskService;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tower_http::cors::{AllowOrigin, Any, CorsLayer};

use crate::auth::IdentityCheck;

/// Shared application state.
pub struct AppState {
    pub service: TaskService,
    pub identity: Arc<dyn IdentityCheck>,
}

impl AppState {
    pub fn new(service: TaskService, identity: Arc<dyn IdentityCheck>) -> Arc<Self> {
        Arc::new(Self { service, identity })
    }
}

pub fn router(state: Arc<AppState>, cors: CorsLayer) -> Router {
    let api = Router::new()
        .route("/tasks", get(api::list_tasks))
        .route("/tasks/{name}", post(api::submit_task).get(api::task_status))
        .route("/test", post(api::lidar_test))
        .route("/engine_test", post(api::engine_test))
        .route("/start", post(api::start_scan))
        .route("/stop", post(api::stop))
        .route("/download", get(api::download))
        .route("/ping", post(api::ping))
        .route("/connect", post(api::ping))
        .route("/ws/{task_id}", get(ws::ws_task))
        .route_layer(middleware::from_fn_with_state(
            Arc::clone(&state),
            auth::require_identity,
        ));

    Router::new()
        .nest("/api/lidar", api)
        .layer(cors)
        .with_state(state)
}

pub fn build_cors(origins: &[String]) -> Result<CorsLayer> {
    if origins.iter().any(|o| o == "*") {
        return Ok(CorsLayer::new()
            .allow_origin(Any)
            .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
            .allow_headers(Any));
    }

    let mut headers = Vec::with_capacity(origins.len());
    for origin in origins {
        headers.push(
            HeaderValue::from_str(origin)
                .with_context(|| format!("invalid allowed origin: {origin}"))?,
        );
    }

    Ok(CorsLayer::new()
        .allow_origin(AllowOrigin::list(headers))
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers(Any))
}

/// Periodically drop completed tasks older than `ttl`.
pub fn spawn_sweeper(state: Arc<AppState>, ttl: Duration, every: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut tick = tokio::time::interval(every);
        tick.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            tick.tick().await;
            state.service.evict_completed(ttl);
        }
    })
}
