//! Operational endpoint: liveness and per-component stats.

use std::sync::Arc;

use autoweave_core::perf::metrics::MetricsRegistry;
use autoweave_core::plugins::manager::PluginManagerHandle;
use autoweave_core::workers::pool::WorkerPoolHandle;
use axum::extract::State;
use axum::response::Json;
use axum::routing::get;
use axum::Router;
use serde_json::{Value, json};

#[derive(Clone)]
pub struct AppState {
    pub manager: PluginManagerHandle,
    pub pool: WorkerPoolHandle,
    pub metrics: Arc<MetricsRegistry>,
    pub started_at: chrono::DateTime<chrono::Utc>,
}

impl std::fmt::Debug for AppState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppState")
            .field("started_at", &self.started_at)
            .finish()
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/stats", get(stats))
        .layer(tower_http::trace::TraceLayer::new_for_http())
        .with_state(state)
}

async fn healthz(State(state): State<AppState>) -> Json<Value> {
    let pool = state.pool.stats().await;
    let plugins = state.manager.list().await;
    let active = plugins
        .iter()
        .filter(|p| p.state == autoweave_model::PluginState::Active)
        .count();
    let uptime_s =
        (chrono::Utc::now() - state.started_at).num_seconds().max(0);

    Json(json!({
        "status": "ok",
        "uptime_s": uptime_s,
        "workers": pool.workers,
        "worker_capacity": pool.capacity,
        "plugins": plugins.len(),
        "active_plugins": active,
    }))
}

async fn stats(State(state): State<AppState>) -> Json<Value> {
    let plugins = state.manager.list().await;
    let pool = state.pool.stats().await;

    Json(json!({
        "counters": state.metrics.snapshot(),
        "pool": pool,
        "plugins": plugins,
    }))
}
