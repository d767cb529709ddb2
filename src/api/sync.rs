//! Device sync endpoints

use axum::{
    extract::{Path, State},
    routing::{get, post},
    Json, Router,
};
use serde::Serialize;

use super::{ApiResult, AppState};
use crate::types::*;

pub(super) fn routes() -> Router<AppState> {
    Router::new()
        .route("/v1/sync/check", post(sync_check))
        .route("/v1/cache/invalidate", post(invalidate_caches))
        .route("/v1/devices/:device_id/jobs", get(list_jobs))
        .route("/v1/jobs/:job_id", get(get_job))
        .route("/v1/jobs/:job_id/retry", post(retry_job))
}

async fn sync_check(
    State(state): State<AppState>,
    Json(request): Json<SyncCheckRequest>,
) -> ApiResult<Json<SyncCheckResponse>> {
    let response = state.platform.sync_check(&request)?;

    if let Some(worker) = &state.worker {
        for job_id in response.sync_jobs.iter().filter_map(|j| j.job_id.as_ref()) {
            if let Err(e) = worker.enqueue(job_id.clone()).await {
                tracing::warn!(job_id = %job_id, "Failed to notify sync worker: {}", e);
            }
        }
    }

    Ok(Json(response))
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct InvalidationResponse {
    results: Vec<DeviceInvalidationResult>,
}

async fn invalidate_caches(
    State(state): State<AppState>,
    Json(request): Json<CacheInvalidationRequest>,
) -> ApiResult<Json<InvalidationResponse>> {
    let results = state.platform.invalidate_caches(&request)?;
    Ok(Json(InvalidationResponse { results }))
}

async fn list_jobs(
    State(state): State<AppState>,
    Path(device_id): Path<String>,
) -> ApiResult<Json<Vec<SyncJob>>> {
    state.platform.device(&device_id)?;
    Ok(Json(state.platform.jobs(&device_id)?))
}

async fn get_job(
    State(state): State<AppState>,
    Path(job_id): Path<String>,
) -> ApiResult<Json<SyncJob>> {
    Ok(Json(state.platform.job(&job_id)?))
}

async fn retry_job(
    State(state): State<AppState>,
    Path(job_id): Path<String>,
) -> ApiResult<Json<SyncJob>> {
    let job = state.platform.retry_job(&job_id)?;
    if let Some(worker) = &state.worker {
        if let Err(e) = worker.enqueue(job.id.clone()).await {
            tracing::warn!(job_id = %job.id, "Failed to notify sync worker: {}", e);
        }
    }
    Ok(Json(job))
}

#[cfg(test)]
mod tests {
    use super::super::test_support::*;
    use crate::bundle::BuildOptions;
    use axum::http::StatusCode;
    use serde_json::json;

    async fn seed(app: &TestApp) {
        app.snapshots.put(snapshot("manual", &["alpha", "beta", "gamma"]));
        app.platform
            .build_and_publish("manual", BuildOptions::default())
            .await
            .unwrap();
        app.platform.enroll_device("tablet-1").unwrap();
        app.platform.entitle("tablet-1", "manual", None).unwrap();
    }

    #[tokio::test]
    async fn test_sync_check_without_cache_is_full() {
        let app = app();
        seed(&app).await;

        let response = send(
            &app.router,
            post_json("/v1/sync/check", json!({ "deviceId": "tablet-1" })),
        )
        .await;
        assert_status(&response, StatusCode::OK);
        let body = json_body(response).await;
        assert_eq!(body["needsSync"], true);
        assert_eq!(body["syncJobs"][0]["kind"], "FULL");
        assert!(body["syncJobs"][0]["jobId"].is_string());
        assert_eq!(body["policies"]["signedUrlTtlSecs"], 3600);

        let job_id = body["syncJobs"][0]["jobId"].as_str().unwrap().to_string();
        let response = send(&app.router, get(&format!("/v1/jobs/{}", job_id))).await;
        assert_status(&response, StatusCode::OK);
        assert_eq!(json_body(response).await["status"], "PENDING");

        let response = send(&app.router, get("/v1/devices/tablet-1/jobs")).await;
        let jobs = json_body(response).await;
        assert_eq!(jobs.as_array().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_sync_check_unknown_device_is_404() {
        let app = app();
        let response = send(
            &app.router,
            post_json("/v1/sync/check", json!({ "deviceId": "ghost" })),
        )
        .await;
        assert_status(&response, StatusCode::NOT_FOUND);
        assert_eq!(json_body(response).await["error"]["code"], "not_found");
    }

    #[tokio::test]
    async fn test_cache_invalidation_reports_per_device() {
        let app = app();
        seed(&app).await;

        let response = send(
            &app.router,
            post_json(
                "/v1/cache/invalidate",
                json!({ "deviceIds": ["tablet-1"], "scope": { "type": "all" } }),
            ),
        )
        .await;
        assert_status(&response, StatusCode::OK);
        let body = json_body(response).await;
        assert_eq!(body["results"][0]["deviceId"], "tablet-1");
        assert_eq!(body["results"][0]["deletedCaches"], 0);
    }

    #[tokio::test]
    async fn test_retry_of_pending_job_conflicts() {
        let app = app();
        seed(&app).await;
        let body = json_body(
            send(
                &app.router,
                post_json("/v1/sync/check", json!({ "deviceId": "tablet-1" })),
            )
            .await,
        )
        .await;
        let job_id = body["syncJobs"][0]["jobId"].as_str().unwrap().to_string();

        let response = send(
            &app.router,
            post_json(&format!("/v1/jobs/{}/retry", job_id), json!({})),
        )
        .await;
        assert_status(&response, StatusCode::CONFLICT);
    }
}
