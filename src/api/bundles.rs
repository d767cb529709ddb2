//! Bundle administration: build, inspect, publish URLs, retire

use std::time::Duration;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};

use super::{ApiResult, AppState};
use crate::bundle::BuildOptions;
use crate::distribution::PublishedUrl;
use crate::storage::invalidations::InvalidationRecord;
use crate::types::*;

pub(super) fn routes() -> Router<AppState> {
    Router::new()
        .route(
            "/v1/documents/:document_id/bundles",
            post(build_bundle).get(list_bundles),
        )
        .route("/v1/bundles/:bundle_id", get(get_bundle).delete(retire_bundle))
        .route("/v1/bundles/:bundle_id/manifest", get(get_manifest))
        .route("/v1/bundles/:bundle_id/abandon", post(abandon_bundle))
        .route("/v1/bundles/:bundle_id/url", get(bundle_url))
        .route(
            "/v1/bundles/:bundle_id/invalidations",
            post(invalidate_bundle).get(list_invalidations),
        )
}

#[derive(Deserialize, Default)]
#[serde(rename_all = "camelCase")]
struct BuildRequest {
    version: Option<String>,
    chunk_threshold_bytes: Option<usize>,
}

async fn build_bundle(
    State(state): State<AppState>,
    Path(document_id): Path<String>,
    body: Option<Json<BuildRequest>>,
) -> ApiResult<(StatusCode, Json<Bundle>)> {
    let request = body.map(|Json(r)| r).unwrap_or_default();
    let options = BuildOptions {
        version: request.version,
        chunk_threshold_bytes: request.chunk_threshold_bytes,
    };
    let bundle = state
        .platform
        .build_and_publish(&document_id, options)
        .await?;
    Ok((StatusCode::CREATED, Json(bundle)))
}

async fn list_bundles(
    State(state): State<AppState>,
    Path(document_id): Path<String>,
) -> ApiResult<Json<Vec<Bundle>>> {
    Ok(Json(state.platform.builder().list(&document_id)?))
}

async fn get_bundle(
    State(state): State<AppState>,
    Path(bundle_id): Path<String>,
) -> ApiResult<Json<Bundle>> {
    Ok(Json(state.platform.builder().status(&bundle_id)?))
}

async fn get_manifest(
    State(state): State<AppState>,
    Path(bundle_id): Path<String>,
) -> ApiResult<Json<Manifest>> {
    Ok(Json(state.platform.manifest(&bundle_id)?))
}

#[derive(Serialize)]
struct RetireResponse {
    retired: bool,
}

async fn retire_bundle(
    State(state): State<AppState>,
    Path(bundle_id): Path<String>,
) -> ApiResult<Json<RetireResponse>> {
    let retired = state.platform.retire(&bundle_id).await?;
    Ok(Json(RetireResponse { retired }))
}

#[derive(Serialize)]
struct AbandonResponse {
    abandoned: bool,
}

async fn abandon_bundle(
    State(state): State<AppState>,
    Path(bundle_id): Path<String>,
) -> ApiResult<Json<AbandonResponse>> {
    let abandoned = state.platform.builder().abandon(&bundle_id)?;
    Ok(Json(AbandonResponse { abandoned }))
}

#[derive(Deserialize)]
struct UrlQuery {
    chunk: Option<u32>,
    #[serde(default)]
    signed: bool,
    /// Signed URL lifetime in seconds
    ttl: Option<u64>,
}

async fn bundle_url(
    State(state): State<AppState>,
    Path(bundle_id): Path<String>,
    Query(query): Query<UrlQuery>,
) -> ApiResult<Json<PublishedUrl>> {
    let distributor = state.platform.distributor();
    let url = if query.signed || query.ttl.is_some() {
        distributor.signed_url_for(&bundle_id, query.chunk, query.ttl.map(Duration::from_secs))?
    } else {
        distributor.url_for(&bundle_id, query.chunk)?
    };
    Ok(Json(url))
}

#[derive(Deserialize, Default)]
#[serde(rename_all = "camelCase")]
struct InvalidateRequest {
    #[serde(default)]
    manifest_only: bool,
}

async fn invalidate_bundle(
    State(state): State<AppState>,
    Path(bundle_id): Path<String>,
    body: Option<Json<InvalidateRequest>>,
) -> ApiResult<(StatusCode, Json<InvalidationRecord>)> {
    let request = body.map(|Json(r)| r).unwrap_or_default();
    let distributor = state.platform.distributor();
    let record = if request.manifest_only {
        distributor.invalidate_manifest(&bundle_id).await?
    } else {
        distributor.invalidate(&bundle_id).await?
    };
    Ok((StatusCode::ACCEPTED, Json(record)))
}

async fn list_invalidations(
    State(state): State<AppState>,
    Path(bundle_id): Path<String>,
) -> ApiResult<Json<Vec<InvalidationRecord>>> {
    Ok(Json(state.platform.distributor().invalidations(&bundle_id)?))
}
