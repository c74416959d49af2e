use axum::http::StatusCode;
use axum::response::IntoResponse;
use serde_json::json;
use tracing::error;

use ingest_infra::uploads::UploadError;

pub fn upload_error_to_response(err: UploadError) -> axum::response::Response {
    match err {
        UploadError::Expired(ref upload_id) => json_error(
            StatusCode::NOT_FOUND,
            "upload_expired",
            format!("upload {upload_id} has expired or does not exist"),
        ),
        UploadError::Incomplete {
            ref missing, total, ..
        } => (
            StatusCode::CONFLICT,
            axum::Json(json!({
                "error": "upload_incomplete",
                "message": err.to_string(),
                "missing": missing,
                "total": total,
            })),
        )
            .into_response(),
        UploadError::InvalidChunk(msg) => json_error(StatusCode::BAD_REQUEST, "invalid_chunk", msg),
        backend => internal_error("storage_error", backend),
    }
}

/// Log the full error and answer with a generic 500.
pub fn internal_error(code: &'static str, err: impl std::fmt::Display) -> axum::response::Response {
    error!(code, error = %err, "request failed");
    json_error(StatusCode::INTERNAL_SERVER_ERROR, code, err.to_string())
}

pub fn json_error(
    status: StatusCode,
    code: &'static str,
    message: impl Into<String>,
) -> axum::response::Response {
    (
        status,
        axum::Json(json!({
            "error": code,
            "message": message.into(),
        })),
    )
        .into_response()
}
