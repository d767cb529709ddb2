//! Device enrollment and entitlements

use axum::{
    extract::{Path, State},
    http::StatusCode,
    routing::{get, post, put},
    Json, Router,
};
use serde::{Deserialize, Serialize};

use super::{ApiError, ApiResult, AppState};
use crate::error::BundlecastError;
use crate::types::*;

pub(super) fn routes() -> Router<AppState> {
    Router::new()
        .route("/v1/devices", post(enroll))
        .route("/v1/devices/:device_id", get(get_device).delete(unenroll))
        .route("/v1/devices/:device_id/entitlements", get(list_entitlements))
        .route(
            "/v1/devices/:device_id/entitlements/:document_id",
            put(entitle).delete(revoke),
        )
        .route("/v1/devices/:device_id/cache", get(list_cache_manifests))
        .route(
            "/v1/devices/:device_id/cache/:document_id",
            get(cache_manifest),
        )
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct EnrollRequest {
    device_id: String,
}

async fn enroll(
    State(state): State<AppState>,
    Json(request): Json<EnrollRequest>,
) -> ApiResult<(StatusCode, Json<Device>)> {
    let device = state.platform.enroll_device(&request.device_id)?;
    Ok((StatusCode::CREATED, Json(device)))
}

async fn get_device(
    State(state): State<AppState>,
    Path(device_id): Path<String>,
) -> ApiResult<Json<Device>> {
    Ok(Json(state.platform.device(&device_id)?))
}

async fn unenroll(
    State(state): State<AppState>,
    Path(device_id): Path<String>,
) -> ApiResult<Json<DeviceInvalidationResult>> {
    Ok(Json(state.platform.unenroll_device(&device_id)?))
}

async fn list_entitlements(
    State(state): State<AppState>,
    Path(device_id): Path<String>,
) -> ApiResult<Json<Vec<Entitlement>>> {
    Ok(Json(state.platform.entitlements(&device_id)?))
}

#[derive(Deserialize, Default)]
#[serde(rename_all = "camelCase")]
struct EntitleRequest {
    pinned_version: Option<String>,
}

async fn entitle(
    State(state): State<AppState>,
    Path((device_id, document_id)): Path<(String, String)>,
    body: Option<Json<EntitleRequest>>,
) -> ApiResult<Json<Entitlement>> {
    let request = body.map(|Json(r)| r).unwrap_or_default();
    Ok(Json(state.platform.entitle(
        &device_id,
        &document_id,
        request.pinned_version.as_deref(),
    )?))
}

#[derive(Serialize)]
struct RevokeResponse {
    revoked: bool,
}

async fn revoke(
    State(state): State<AppState>,
    Path((device_id, document_id)): Path<(String, String)>,
) -> ApiResult<Json<RevokeResponse>> {
    let revoked = state.platform.revoke(&device_id, &document_id)?;
    Ok(Json(RevokeResponse { revoked }))
}

async fn list_cache_manifests(
    State(state): State<AppState>,
    Path(device_id): Path<String>,
) -> ApiResult<Json<Vec<CacheManifest>>> {
    Ok(Json(state.platform.cache_manifests(&device_id)?))
}

async fn cache_manifest(
    State(state): State<AppState>,
    Path((device_id, document_id)): Path<(String, String)>,
) -> ApiResult<Json<CacheManifest>> {
    state
        .platform
        .cache_manifest(&device_id, &document_id)?
        .map(Json)
        .ok_or_else(|| {
            ApiError(BundlecastError::not_found(
                "cache manifest",
                format!("{}/{}", device_id, document_id),
            ))
        })
}

#[cfg(test)]
mod tests {
    use super::super::test_support::*;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use serde_json::json;

    #[tokio::test]
    async fn test_enroll_entitle_unenroll() {
        let app = app();

        let response = send(
            &app.router,
            post_json("/v1/devices", json!({ "deviceId": "tablet-9" })),
        )
        .await;
        assert_status(&response, StatusCode::CREATED);

        let request = Request::put("/v1/devices/tablet-9/entitlements/manual")
            .header("content-type", "application/json")
            .body(Body::from(json!({ "pinnedVersion": "1.0.0" }).to_string()))
            .unwrap();
        let response = send(&app.router, request).await;
        assert_status(&response, StatusCode::OK);
        assert_eq!(json_body(response).await["pinnedVersion"], "1.0.0");

        let response = send(&app.router, get("/v1/devices/tablet-9/entitlements")).await;
        assert_eq!(json_body(response).await.as_array().unwrap().len(), 1);

        let response = send(&app.router, get("/v1/devices/tablet-9/cache/manual")).await;
        assert_status(&response, StatusCode::NOT_FOUND);
        let response = send(&app.router, get("/v1/devices/tablet-9/cache")).await;
        assert_status(&response, StatusCode::OK);
        assert!(json_body(response).await.as_array().unwrap().is_empty());

        let request = Request::delete("/v1/devices/tablet-9")
            .body(Body::empty())
            .unwrap();
        assert_status(&send(&app.router, request).await, StatusCode::OK);
        assert_status(
            &send(&app.router, get("/v1/devices/tablet-9")).await,
            StatusCode::NOT_FOUND,
        );
    }
}
