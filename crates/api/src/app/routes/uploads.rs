use std::sync::Arc;

use axum::{
    Json, Router,
    body::Bytes,
    extract::{DefaultBodyLimit, Extension, Path, Query},
    response::IntoResponse,
    routing::{get, post, put},
};

use crate::app::dto::{self, ChunkQuery, KindQuery, MergeResponse, ProgressResponse};
use crate::app::errors;
use crate::app::services::AppServices;

/// Largest accepted chunk body.
const MAX_CHUNK_BYTES: usize = 16 * 1024 * 1024;

pub fn router() -> Router {
    Router::new()
        .route("/:upload_id/chunks/:index", put(put_chunk))
        .route("/:upload_id/progress", get(get_progress))
        .route("/:upload_id/status", get(get_status))
        .route("/:upload_id/merge", post(force_merge))
        .route("/:upload_id/confirm", post(confirm))
        .layer(DefaultBodyLimit::max(MAX_CHUNK_BYTES))
}

/// PUT /uploads/:upload_id/chunks/:index?total=N&kind=media
pub async fn put_chunk(
    Extension(services): Extension<Arc<AppServices>>,
    Path((upload_id, index)): Path<(String, u32)>,
    Query(query): Query<ChunkQuery>,
    body: Bytes,
) -> axum::response::Response {
    let upload_id = match dto::parse_upload_id(upload_id) {
        Ok(id) => id,
        Err(resp) => return resp,
    };

    match services
        .reassembler
        .store_chunk(&upload_id, query.kind, index, body.to_vec(), query.total)
        .await
    {
        Ok(progress) => Json(ProgressResponse::new(upload_id, query.kind, progress)).into_response(),
        Err(e) => errors::upload_error_to_response(e),
    }
}

/// GET /uploads/:upload_id/progress
///
/// An expired or unknown upload reports `{0, 0}` rather than an error.
pub async fn get_progress(
    Extension(services): Extension<Arc<AppServices>>,
    Path(upload_id): Path<String>,
    Query(query): Query<KindQuery>,
) -> axum::response::Response {
    let upload_id = match dto::parse_upload_id(upload_id) {
        Ok(id) => id,
        Err(resp) => return resp,
    };

    match services.reassembler.get_progress(&upload_id, query.kind).await {
        Ok(progress) => Json(ProgressResponse::new(upload_id, query.kind, progress)).into_response(),
        Err(e) => errors::upload_error_to_response(e),
    }
}

pub async fn get_status(
    Extension(services): Extension<Arc<AppServices>>,
    Path(upload_id): Path<String>,
    Query(query): Query<KindQuery>,
) -> axum::response::Response {
    let upload_id = match dto::parse_upload_id(upload_id) {
        Ok(id) => id,
        Err(resp) => return resp,
    };

    match services.reassembler.check_status(&upload_id, query.kind).await {
        Ok(status) => Json(status).into_response(),
        Err(e) => errors::upload_error_to_response(e),
    }
}

/// POST /uploads/:upload_id/merge
///
/// Merge now instead of waiting for the merge worker.
pub async fn force_merge(
    Extension(services): Extension<Arc<AppServices>>,
    Path(upload_id): Path<String>,
    Query(query): Query<KindQuery>,
) -> axum::response::Response {
    let upload_id = match dto::parse_upload_id(upload_id) {
        Ok(id) => id,
        Err(resp) => return resp,
    };

    match services.reassembler.merge_chunks(&upload_id, query.kind).await {
        Ok(bytes) => Json(MergeResponse {
            upload_id,
            kind: query.kind,
            bytes: bytes.len(),
        })
        .into_response(),
        Err(e) => errors::upload_error_to_response(e),
    }
}

/// POST /uploads/:upload_id/confirm
pub async fn confirm(
    Extension(services): Extension<Arc<AppServices>>,
    Path(upload_id): Path<String>,
) -> axum::response::Response {
    let upload_id = match dto::parse_upload_id(upload_id) {
        Ok(id) => id,
        Err(resp) => return resp,
    };

    match services.reassembler.confirm_and_save(&upload_id).await {
        Ok(saved) => Json(saved).into_response(),
        Err(e) => errors::upload_error_to_response(e),
    }
}
