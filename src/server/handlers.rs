//! HTTP request handlers.

use std::sync::Arc;

use axum::{
    Json,
    body::Bytes,
    extract::{Multipart, State},
    http::StatusCode,
    response::{IntoResponse as _, Response},
};

use crate::{
    pipeline,
    pool::{OcrResult, WorkerStatus, random_request_id},
    prelude::*,
};

use super::{AppState, error::ApiError};

/// Leading bytes every PDF starts with.
const PDF_MAGIC: &[u8] = b"%PDF";

/// Health endpoint body.
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub workers: Vec<WorkerStatus>,
    pub queue_depth: usize,
}

/// `POST /ocr`: OCR an uploaded PDF.
///
/// Expects a multipart form with a `file` field holding the document. The
/// response carries the extracted text and the page count.
pub async fn ocr(
    State(state): State<Arc<AppState>>,
    multipart: Multipart,
) -> std::result::Result<Json<OcrResult>, ApiError> {
    let pdf = read_file_field(multipart).await?;
    if !pdf.starts_with(PDF_MAGIC) {
        return Err(ApiError::bad_request("uploaded file is not a PDF"));
    }

    // Short correlation id tying log lines of this upload together.
    let request_id = random_request_id(4);
    info!(request = %request_id, bytes = pdf.len(), "received OCR upload");

    let result = pipeline::ocr_pdf(state.backend.as_ref(), &pdf, &request_id).await?;
    info!(
        request = %request_id,
        page_count = ?result.page_count,
        text_len = result.text.len(),
        "OCR complete",
    );
    Ok(Json(result))
}

/// Pull the `file` field out of the multipart form.
async fn read_file_field(mut multipart: Multipart) -> std::result::Result<Bytes, ApiError> {
    while let Some(field) = multipart.next_field().await? {
        if field.name() == Some("file") {
            return Ok(field.bytes().await?);
        }
    }
    Err(ApiError::bad_request("multipart form has no \"file\" field"))
}

/// `GET /health`: pool liveness.
///
/// Reports 200 while at least one worker can take jobs, 503 once every
/// worker is down, so an orchestrator can restart the whole container when
/// the engines are beyond the supervisor's repair.
pub async fn health(State(state): State<Arc<AppState>>) -> Response {
    let stats = state.backend.stats();
    let up = stats.any_ready();
    let body = HealthResponse {
        status: if up { "ok" } else { "unavailable" },
        workers: stats.workers,
        queue_depth: stats.queue_depth,
    };
    let status = if up {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, Json(body)).into_response()
}
