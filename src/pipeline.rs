//! Staging uploaded PDFs for the path-based engine protocol.
//!
//! The engine reads documents from disk, so each request gets its own scoped
//! temporary directory; concurrent uploads can never collide on filenames,
//! and dropping the directory cleans up even when the request future is
//! cancelled mid-flight.

use tempfile::TempDir;

use crate::{
    error::PoolError,
    pool::{OcrBackend, OcrResult},
    prelude::*,
};

/// OCR an in-memory PDF by writing it to a scratch directory and handing the
/// path to the pool. The directory is removed on every exit path.
#[instrument(level = "debug", skip_all, fields(request = request_id, bytes = pdf.len()))]
pub async fn ocr_pdf(
    backend: &dyn OcrBackend,
    pdf: &[u8],
    request_id: &str,
) -> std::result::Result<OcrResult, PoolError> {
    let scratch = TempDir::with_prefix("ocr")?;
    let pdf_path = scratch.path().join("input.pdf");
    tokio::fs::write(&pdf_path, pdf).await?;

    let result = backend.submit(&pdf_path, request_id).await;

    if let Err(err) = scratch.close() {
        warn!(request = request_id, error = %err, "failed to remove OCR scratch directory");
    }
    result
}
