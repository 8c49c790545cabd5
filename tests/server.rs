//! HTTP surface tests.
//!
//! The upload flow runs end to end against a real pool of scripted engine
//! processes; the degraded-health case uses a stub backend so we can report
//! an all-workers-down pool without orchestrating real crashes.

use std::{net::SocketAddr, path::Path, sync::Arc, time::Duration};

use async_trait::async_trait;
use ocr_pool::{
    error::PoolError,
    pool::{OcrBackend, OcrResult, Pool, PoolConfig, PoolStats, WorkerStatus},
    server::{self, AppState},
};

/// Spin up the router on an ephemeral port and return its base URL.
async fn serve(backend: Arc<dyn OcrBackend>) -> String {
    serve_with_body_limit(backend, 25 * 1024 * 1024).await
}

/// Like [`serve`], with an explicit request body limit.
async fn serve_with_body_limit(backend: Arc<dyn OcrBackend>, max_body_bytes: usize) -> String {
    let state = Arc::new(AppState { backend });
    let app = server::build_router(state, max_body_bytes);
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr: SocketAddr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("http://{addr}")
}

/// Start a real pool backed by the given fixture script.
async fn fixture_pool(name: &str) -> Arc<Pool> {
    let script = Path::new(env!("CARGO_MANIFEST_DIR"))
        .join("tests/fixtures")
        .join(name);
    let pool = Pool::init(PoolConfig {
        worker_count: 1,
        queue_capacity: 10,
        ocr_timeout: Duration::from_secs(5),
        ready_timeout: Duration::from_secs(5),
        worker_command: vec![
            "sh".to_owned(),
            script.to_string_lossy().into_owned(),
        ],
    })
    .await
    .unwrap();
    Arc::new(pool)
}

fn pdf_part(bytes: Vec<u8>) -> reqwest::multipart::Form {
    let part = reqwest::multipart::Part::bytes(bytes)
        .file_name("document.pdf")
        .mime_str("application/pdf")
        .unwrap();
    reqwest::multipart::Form::new().part("file", part)
}

#[tokio::test]
async fn upload_round_trip_returns_text_and_page_count() {
    let pool = fixture_pool("fake_ok.sh").await;
    let base = serve(pool.clone()).await;

    let pdf = b"%PDF-1.4\nsome pages\n%%EOF\n".to_vec();
    let pdf_len = pdf.len() as u64;
    let response = reqwest::Client::new()
        .post(format!("{base}/ocr"))
        .multipart(pdf_part(pdf))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);

    let body: serde_json::Value = response.json().await.unwrap();
    assert_eq!(body["text"], "hello");
    assert_eq!(body["page_count"], serde_json::json!(pdf_len));

    pool.shutdown();
}

#[tokio::test]
async fn non_pdf_uploads_are_rejected_without_touching_the_pool() {
    let pool = fixture_pool("fake_ok.sh").await;
    let base = serve(pool.clone()).await;

    let response = reqwest::Client::new()
        .post(format!("{base}/ocr"))
        .multipart(pdf_part(b"GIF89a not a pdf".to_vec()))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 400);

    let body: serde_json::Value = response.json().await.unwrap();
    assert_eq!(body["code"], "BAD_REQUEST");

    pool.shutdown();
}

#[tokio::test]
async fn oversized_uploads_are_rejected_with_413() {
    // A tiny body limit, so the test does not have to ship megabytes.
    let base = serve_with_body_limit(Arc::new(DownBackend), 1024).await;

    let mut pdf = b"%PDF-1.4\n".to_vec();
    pdf.resize(8 * 1024, b'x');
    let response = reqwest::Client::new()
        .post(format!("{base}/ocr"))
        .multipart(pdf_part(pdf))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 413);
}

#[tokio::test]
async fn uploads_without_a_file_field_are_rejected() {
    let pool = fixture_pool("fake_ok.sh").await;
    let base = serve(pool.clone()).await;

    let form = reqwest::multipart::Form::new().text("note", "no file here");
    let response = reqwest::Client::new()
        .post(format!("{base}/ocr"))
        .multipart(form)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 400);

    pool.shutdown();
}

#[tokio::test]
async fn health_reports_ok_with_a_ready_worker() {
    let pool = fixture_pool("fake_ok.sh").await;
    let base = serve(pool.clone()).await;

    let response = reqwest::get(format!("{base}/health")).await.unwrap();
    assert_eq!(response.status(), 200);

    let body: serde_json::Value = response.json().await.unwrap();
    assert_eq!(body["status"], "ok");
    assert_eq!(body["workers"][0]["id"], 0);
    assert_eq!(body["workers"][0]["ready"], true);
    assert_eq!(body["queue_depth"], 0);

    pool.shutdown();
}

/// A backend whose pool has no live workers left.
struct DownBackend;

#[async_trait]
impl OcrBackend for DownBackend {
    async fn submit(
        &self,
        _pdf_path: &Path,
        _request_id: &str,
    ) -> Result<OcrResult, PoolError> {
        Err(PoolError::PoolNotReady)
    }

    fn stats(&self) -> PoolStats {
        PoolStats {
            workers: vec![WorkerStatus {
                id: 0,
                ready: false,
                busy: false,
            }],
            queue_depth: 0,
        }
    }
}

#[tokio::test]
async fn health_reports_unavailable_when_every_worker_is_down() {
    let base = serve(Arc::new(DownBackend)).await;

    let response = reqwest::get(format!("{base}/health")).await.unwrap();
    assert_eq!(response.status(), 503);

    let body: serde_json::Value = response.json().await.unwrap();
    assert_eq!(body["status"], "unavailable");
}

#[tokio::test]
async fn pool_failures_map_onto_http_statuses() {
    let base = serve(Arc::new(DownBackend)).await;

    let response = reqwest::Client::new()
        .post(format!("{base}/ocr"))
        .multipart(pdf_part(b"%PDF-1.4 minimal".to_vec()))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 503);

    let body: serde_json::Value = response.json().await.unwrap();
    assert_eq!(body["code"], "POOL_NOT_READY");
}
