//! Origin for the delivery boundary
//!
//! Serves manifest and chunk bytes of READY bundles at the paths the
//! distribution layer publishes. Every request must carry a valid
//! `expires`/`signature` pair. Responses carry the cache policy of their
//! kind and the content checksum as a strong ETag.

use axum::{
    extract::{Path, Query, State},
    http::{header, HeaderMap, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use serde::Deserialize;

use super::{ApiResult, AppState};
use crate::distribution::{chunk_path, manifest_path, Distributor};
use crate::error::BundlecastError;
use crate::object_store::{CONTENT_TYPE_CHUNK, CONTENT_TYPE_MANIFEST};

pub(super) fn routes() -> Router<AppState> {
    Router::new()
        .route("/bundles/:bundle_id/manifest.json", get(serve_manifest))
        .route("/bundles/:bundle_id/chunks/:index", get(serve_chunk))
}

#[derive(Deserialize)]
struct SignedQuery {
    expires: Option<i64>,
    signature: Option<String>,
}

fn verify(distributor: &Distributor, path: &str, query: &SignedQuery) -> ApiResult<()> {
    match (query.expires, query.signature.as_deref()) {
        (Some(expires), Some(signature)) => {
            distributor.verify_signature(path, expires, signature)?;
            Ok(())
        }
        _ => Err(BundlecastError::InvalidSignature.into()),
    }
}

fn respond(
    request_headers: &HeaderMap,
    bytes: Vec<u8>,
    content_type: &'static str,
    cache_control: String,
    checksum: &str,
) -> Response {
    let etag = format!("\"{}\"", checksum);
    let not_modified = request_headers
        .get(header::IF_NONE_MATCH)
        .and_then(|v| v.to_str().ok())
        .map_or(false, |v| v.split(',').any(|tag| tag.trim() == etag));

    let mut headers = HeaderMap::new();
    if let Ok(value) = HeaderValue::from_str(&cache_control) {
        headers.insert(header::CACHE_CONTROL, value);
    }
    if let Ok(value) = HeaderValue::from_str(&etag) {
        headers.insert(header::ETAG, value);
    }

    if not_modified {
        return (StatusCode::NOT_MODIFIED, headers).into_response();
    }
    headers.insert(header::CONTENT_TYPE, HeaderValue::from_static(content_type));
    (StatusCode::OK, headers, bytes).into_response()
}

async fn serve_manifest(
    State(state): State<AppState>,
    Path(bundle_id): Path<String>,
    Query(query): Query<SignedQuery>,
    headers: HeaderMap,
) -> ApiResult<Response> {
    let distributor = state.platform.distributor();
    verify(distributor, &manifest_path(&bundle_id), &query)?;

    let manifest = state.platform.manifest(&bundle_id)?;
    let bytes = distributor.manifest_bytes(&bundle_id).await?;
    Ok(respond(
        &headers,
        bytes,
        CONTENT_TYPE_MANIFEST,
        distributor.manifest_cache_control(),
        &manifest.checksum,
    ))
}

async fn serve_chunk(
    State(state): State<AppState>,
    Path((bundle_id, index)): Path<(String, u32)>,
    Query(query): Query<SignedQuery>,
    headers: HeaderMap,
) -> ApiResult<Response> {
    let distributor = state.platform.distributor();
    verify(distributor, &chunk_path(&bundle_id, index), &query)?;

    let (bytes, checksum) = distributor.chunk_bytes(&bundle_id, index).await?;
    Ok(respond(
        &headers,
        bytes,
        CONTENT_TYPE_CHUNK,
        distributor.chunk_cache_control(),
        &checksum,
    ))
}
