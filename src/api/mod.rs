//! HTTP API: device sync endpoints, bundle administration and the origin
//! that serves signed manifest and chunk bytes.

mod bundles;
mod devices;
mod error;
mod origin;
mod sync;

pub use error::{ApiError, ApiResult};

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{extract::State, routing::get, Json, Router};
use serde_json::{json, Value};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::platform::Platform;
use crate::sync::SyncWorker;
use crate::types::StorageStats;

/// Shared state of all route handlers
#[derive(Clone)]
pub struct AppState {
    pub platform: Platform,
    /// Background worker notified of newly created sync jobs
    pub worker: Option<Arc<SyncWorker>>,
}

impl AppState {
    pub fn new(platform: Platform) -> Self {
        Self {
            platform,
            worker: None,
        }
    }

    pub fn with_worker(mut self, worker: Arc<SyncWorker>) -> Self {
        self.worker = Some(worker);
        self
    }
}

/// Build the full router
pub fn router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(health))
        .route("/v1/stats", get(stats))
        .merge(sync::routes())
        .merge(devices::routes())
        .merge(bundles::routes())
        .merge(origin::routes())
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

/// Serve until the process receives ctrl-c
pub async fn serve(state: AppState, addr: SocketAddr) -> std::io::Result<()> {
    let app = router(state);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!("Bundlecast API listening on {}", addr);
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("Shutdown signal received");
        })
        .await
}

async fn health(State(state): State<AppState>) -> Json<Value> {
    Json(json!({
        "status": "ok",
        "version": crate::VERSION,
        "worker": state.worker.is_some(),
    }))
}

async fn stats(State(state): State<AppState>) -> ApiResult<Json<StorageStats>> {
    Ok(Json(state.platform.stats()?))
}


#[cfg(test)]
mod tests {
    use super::test_support::*;
    use axum::http::StatusCode;

    #[tokio::test]
    async fn test_health_and_stats() {
        let app = app();
        let response = send(&app.router, get("/health")).await;
        assert_status(&response, StatusCode::OK);
        assert_eq!(json_body(response).await["status"], "ok");

        let response = send(&app.router, get("/v1/stats")).await;
        assert_status(&response, StatusCode::OK);
        assert_eq!(json_body(response).await["bundlesReady"], 0);
    }
}
