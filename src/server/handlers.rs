//! API endpoint handlers for the job lifecycle.

use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::extract::{Multipart, Path, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::Json;
use chrono::{DateTime, Utc};
use serde_json::json;

use super::AppState;
use crate::models::{Job, JobStatus, PageResult};
use crate::pipeline::run_pipeline;

/// Health check endpoint for container orchestration.
pub async fn health() -> impl IntoResponse {
    StatusCode::OK
}

fn error_response(status: StatusCode, message: impl Into<String>) -> Response {
    (status, Json(json!({ "error": message.into() }))).into_response()
}

/// Upload a PDF and start processing.
pub async fn create_job(State(state): State<AppState>, mut multipart: Multipart) -> Response {
    let mut filename = String::new();
    let mut content: Option<axum::body::Bytes> = None;
    let mut language = "fa".to_string();
    let mut ocr_prompt: Option<String> = None;

    loop {
        let field = match multipart.next_field().await {
            Ok(Some(field)) => field,
            Ok(None) => break,
            Err(e) => {
                return error_response(StatusCode::BAD_REQUEST, format!("Invalid upload: {e}"))
            }
        };

        let name = field.name().map(str::to_string);
        match name.as_deref() {
            Some("file") => {
                filename = field.file_name().unwrap_or_default().to_string();
                content = match field.bytes().await {
                    Ok(bytes) => Some(bytes),
                    Err(e) => {
                        return error_response(
                            StatusCode::BAD_REQUEST,
                            format!("Invalid upload: {e}"),
                        )
                    }
                };
            }
            Some("language") => {
                if let Ok(value) = field.text().await {
                    language = value;
                }
            }
            Some("ocr_prompt") => {
                if let Ok(value) = field.text().await {
                    if !value.is_empty() {
                        ocr_prompt = Some(value);
                    }
                }
            }
            _ => {}
        }
    }

    if filename.is_empty() || !filename.to_lowercase().ends_with(".pdf") {
        return error_response(StatusCode::BAD_REQUEST, "File must be a PDF");
    }
    let Some(content) = content else {
        return error_response(StatusCode::BAD_REQUEST, "File must be a PDF");
    };
    // Extension checks lie; sniff the content too.
    if infer::get(&content).map(|t| t.mime_type()) != Some("application/pdf") {
        return error_response(StatusCode::BAD_REQUEST, "File must be a PDF");
    }

    let mut job = Job::new(language, filename);
    job.ocr_prompt = ocr_prompt;

    if let Err(e) = state.registry.create(&job) {
        return error_response(StatusCode::INTERNAL_SERVER_ERROR, e.to_string());
    }

    let pdf_path = job.pdf_path(&state.settings.data_dir);
    if let Err(e) = std::fs::write(&pdf_path, &content) {
        return error_response(StatusCode::INTERNAL_SERVER_ERROR, e.to_string());
    }

    let renderer = Arc::clone(&state.renderer);
    let count_path = pdf_path.clone();
    let page_count =
        match tokio::task::spawn_blocking(move || renderer.page_count(&count_path)).await {
            Ok(Ok(count)) => count,
            Ok(Err(e)) => {
                return error_response(
                    StatusCode::BAD_REQUEST,
                    format!("Could not read PDF: {e}"),
                )
            }
            Err(e) => return error_response(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
        };

    job.total_pages = page_count;
    job.init_pages();
    if let Err(e) = state.registry.save(&job) {
        return error_response(StatusCode::INTERNAL_SERVER_ERROR, e.to_string());
    }

    let response = json!({ "job_id": job.id.clone(), "total_pages": job.total_pages });

    let emitter = state
        .events
        .get_or_create(&job.id, state.settings.sse_ring_buffer_size);
    tokio::spawn(run_pipeline(
        job,
        Arc::clone(&state.settings),
        Arc::clone(&state.registry),
        emitter,
        Arc::clone(&state.renderer),
        Arc::clone(&state.recognizer),
        None,
    ));

    Json(response).into_response()
}

/// Get job status.
pub async fn get_job(State(state): State<AppState>, Path(job_id): Path<String>) -> Response {
    match state.registry.get(&job_id) {
        Some(job) => Json(job_status_record(&job)).into_response(),
        None => error_response(StatusCode::NOT_FOUND, "Job not found"),
    }
}

fn job_status_record(job: &Job) -> serde_json::Value {
    json!({
        "id": job.id.clone(),
        "status": job.status.as_str(),
        "total_pages": job.total_pages,
        "pages_succeeded": job.pages_succeeded(),
        "pages_failed": job.pages_failed(),
        "pages_completed": job.pages_completed(),
        "failed_pages": job.failed_page_numbers(),
        "pdf_filename": job.pdf_filename.clone(),
        "language": job.language.clone(),
        "created_at": unix_seconds(job.created_at),
        "started_at": job.started_at.map(unix_seconds),
        "completed_at": job.completed_at.map(unix_seconds),
        "error": job.error.clone(),
    })
}

fn unix_seconds(at: DateTime<Utc>) -> f64 {
    at.timestamp_millis() as f64 / 1000.0
}

/// SSE stream of job progress events.
pub async fn job_events(
    State(state): State<AppState>,
    Path(job_id): Path<String>,
    headers: HeaderMap,
) -> Response {
    if state.registry.get(&job_id).is_none() {
        return error_response(StatusCode::NOT_FOUND, "Job not found");
    }

    let emitter = state
        .events
        .get_or_create(&job_id, state.settings.sse_ring_buffer_size);

    let last_event_id = headers
        .get("last-event-id")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<u64>().ok());

    let subscription = emitter.subscribe(last_event_id);

    // The subscription ends (and unsubscribes on drop) when the emitter
    // closes or the client disconnects.
    let stream = futures::stream::unfold(subscription, |mut subscription| async move {
        subscription.recv().await.map(|event| {
            let sse = Event::default()
                .id(event.id.to_string())
                .event(event.event.clone())
                .data(event.data.to_string());
            (Ok::<_, Infallible>(sse), subscription)
        })
    });

    Sse::new(stream)
        .keep_alive(
            KeepAlive::new()
                .interval(Duration::from_secs(30))
                .event(Event::default().event("ping")),
        )
        .into_response()
}

/// Download the finished EPUB.
pub async fn download_result(
    State(state): State<AppState>,
    Path(job_id): Path<String>,
) -> Response {
    let Some(job) = state.registry.get(&job_id) else {
        return error_response(StatusCode::NOT_FOUND, "Job not found");
    };
    if job.status != JobStatus::Completed {
        return error_response(StatusCode::BAD_REQUEST, "Job not completed yet");
    }

    let epub_path = job.epub_path(&state.settings.data_dir);
    let bytes = match tokio::fs::read(&epub_path).await {
        Ok(bytes) => bytes,
        Err(_) => return error_response(StatusCode::NOT_FOUND, "EPUB file not found"),
    };

    let stem = std::path::Path::new(&job.pdf_filename)
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("book");
    let filename = format!("{}.epub", stem).replace('"', "");

    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "application/epub+zip")
        .header(
            header::CONTENT_DISPOSITION,
            format!("attachment; filename=\"{}\"", filename),
        )
        .body(Body::from(bytes))
        .unwrap()
        .into_response()
}

/// Re-process failed pages.
pub async fn retry_failed_pages(
    State(state): State<AppState>,
    Path(job_id): Path<String>,
) -> Response {
    let Some(mut job) = state.registry.get(&job_id) else {
        return error_response(StatusCode::NOT_FOUND, "Job not found");
    };
    if !job.status.is_terminal() {
        return error_response(StatusCode::BAD_REQUEST, "Job is still processing");
    }

    let failed = job.failed_page_numbers();
    if failed.is_empty() {
        return error_response(StatusCode::BAD_REQUEST, "No failed pages to retry");
    }

    // The cleanup sweep may have reclaimed the source PDF already.
    if !job.pdf_path(&state.settings.data_dir).is_file() {
        return error_response(StatusCode::GONE, "Source PDF has been cleaned up");
    }

    for page in &failed {
        job.pages.insert(*page, PageResult::pending(*page));
    }
    if let Err(e) = state.registry.save(&job) {
        return error_response(StatusCode::INTERNAL_SERVER_ERROR, e.to_string());
    }

    // The previous run closed the job's emitter; replace it so the retry
    // gets a live event stream.
    state.events.remove(&job_id);
    let emitter = state
        .events
        .get_or_create(&job_id, state.settings.sse_ring_buffer_size);

    let response = json!({ "job_id": job.id.clone(), "retrying_pages": failed.clone() });

    tokio::spawn(run_pipeline(
        job,
        Arc::clone(&state.settings),
        Arc::clone(&state.registry),
        emitter,
        Arc::clone(&state.renderer),
        Arc::clone(&state.recognizer),
        Some(failed),
    ));

    Json(response).into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Settings;
    use crate::events::EventRegistry;
    use crate::jobs::JobRegistry;
    use crate::pipeline::ocr::OcrError;
    use crate::pipeline::renderer::RenderError;
    use crate::pipeline::{PageRenderer, RenderOptions, TextRecognizer};
    use crate::server::create_router;
    use async_trait::async_trait;
    use axum::http::Request;
    use std::collections::VecDeque;
    use tempfile::tempdir;
    use tower::ServiceExt;

    struct FakeRenderer {
        pages: u32,
    }

    impl PageRenderer for FakeRenderer {
        fn page_count(&self, _pdf_path: &std::path::Path) -> Result<u32, RenderError> {
            if self.pages == 0 {
                return Err(RenderError::RenderFailed("damaged file".to_string()));
            }
            Ok(self.pages)
        }

        fn render_page(
            &self,
            _pdf_path: &std::path::Path,
            page: u32,
            _options: &RenderOptions,
        ) -> Result<Vec<u8>, RenderError> {
            Ok(vec![0xFF, 0xD8, page as u8])
        }
    }

    /// Scripted recognizer: consumes `script` one call at a time, then keeps
    /// returning `fallback`.
    struct ScriptedOcr {
        script: std::sync::Mutex<VecDeque<Result<String, String>>>,
        fallback: Result<String, String>,
    }

    impl ScriptedOcr {
        fn always_ok(text: &str) -> Arc<Self> {
            Arc::new(Self {
                script: std::sync::Mutex::new(VecDeque::new()),
                fallback: Ok(text.to_string()),
            })
        }

        fn always_failing(message: &str) -> Arc<Self> {
            Arc::new(Self {
                script: std::sync::Mutex::new(VecDeque::new()),
                fallback: Err(message.to_string()),
            })
        }

        fn failing_then_ok(failures: usize, text: &str) -> Arc<Self> {
            let script = (0..failures)
                .map(|_| Err("HTTP 500: Server Error".to_string()))
                .collect();
            Arc::new(Self {
                script: std::sync::Mutex::new(script),
                fallback: Ok(text.to_string()),
            })
        }
    }

    #[async_trait]
    impl TextRecognizer for ScriptedOcr {
        async fn recognize(&self, _image: &[u8], _prompt: &str) -> Result<String, OcrError> {
            let step = self
                .script
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| self.fallback.clone());
            step.map_err(|last_error| OcrError::Exhausted {
                attempts: 1,
                last_error,
            })
        }
    }

    struct TestApp {
        app: axum::Router,
        state: AppState,
        _dir: tempfile::TempDir,
    }

    fn setup(pages: u32, ocr: Arc<ScriptedOcr>) -> TestApp {
        let dir = tempdir().unwrap();
        let settings = Settings {
            ocr_workers: 2,
            render_queue_size: 4,
            sse_ring_buffer_size: 50,
            ..Settings::with_data_dir(dir.path().to_path_buf())
        };
        settings.ensure_directories().unwrap();

        let state = AppState {
            registry: Arc::new(JobRegistry::new(dir.path().to_path_buf())),
            events: Arc::new(EventRegistry::new()),
            settings: Arc::new(settings),
            renderer: Arc::new(FakeRenderer { pages }),
            recognizer: ocr,
        };

        TestApp {
            app: create_router(state.clone()),
            state,
            _dir: dir,
        }
    }

    const BOUNDARY: &str = "reflow-test-boundary";

    fn multipart_upload(filename: &str, content: &[u8], language: Option<&str>) -> Request<Body> {
        let mut body = Vec::new();
        body.extend_from_slice(
            format!(
                "--{BOUNDARY}\r\nContent-Disposition: form-data; name=\"file\"; \
                 filename=\"{filename}\"\r\nContent-Type: application/pdf\r\n\r\n"
            )
            .as_bytes(),
        );
        body.extend_from_slice(content);
        body.extend_from_slice(b"\r\n");
        if let Some(language) = language {
            body.extend_from_slice(
                format!(
                    "--{BOUNDARY}\r\nContent-Disposition: form-data; \
                     name=\"language\"\r\n\r\n{language}\r\n"
                )
                .as_bytes(),
            );
        }
        body.extend_from_slice(format!("--{BOUNDARY}--\r\n").as_bytes());

        Request::builder()
            .method("POST")
            .uri("/api/jobs")
            .header(
                header::CONTENT_TYPE,
                format!("multipart/form-data; boundary={BOUNDARY}"),
            )
            .body(Body::from(body))
            .unwrap()
    }

    async fn body_json(response: Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    async fn get(app: &axum::Router, uri: &str) -> Response {
        app.clone()
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap()
    }

    async fn post(app: &axum::Router, uri: &str) -> Response {
        app.clone()
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri(uri)
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap()
    }

    /// Poll job status until a terminal state, returning the final record.
    async fn wait_for_job(app: &axum::Router, job_id: &str) -> serde_json::Value {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
        loop {
            let response = get(app, &format!("/api/jobs/{job_id}")).await;
            assert_eq!(response.status(), StatusCode::OK);
            let record = body_json(response).await;
            let status = record["status"].as_str().unwrap();
            if status == "completed" || status == "failed" {
                return record;
            }
            assert!(
                tokio::time::Instant::now() < deadline,
                "job {job_id} did not reach a terminal status"
            );
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
    }

    #[tokio::test]
    async fn test_health() {
        let env = setup(3, ScriptedOcr::always_ok("text"));
        let response = get(&env.app, "/api/health").await;
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_unknown_job_returns_404_everywhere() {
        let env = setup(3, ScriptedOcr::always_ok("text"));
        for uri in [
            "/api/jobs/nope",
            "/api/jobs/nope/events",
            "/api/jobs/nope/result",
        ] {
            let response = get(&env.app, uri).await;
            assert_eq!(response.status(), StatusCode::NOT_FOUND, "{uri}");
        }
        let response = post(&env.app, "/api/jobs/nope/retry").await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_upload_rejects_non_pdf_extension() {
        let env = setup(3, ScriptedOcr::always_ok("text"));
        let response = env
            .app
            .clone()
            .oneshot(multipart_upload("notes.txt", b"%PDF-1.4 pretend", None))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_upload_rejects_non_pdf_content() {
        let env = setup(3, ScriptedOcr::always_ok("text"));
        let response = env
            .app
            .clone()
            .oneshot(multipart_upload("fake.pdf", b"\x89PNG\r\n\x1a\nnot a pdf", None))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_upload_rejects_unreadable_pdf() {
        // Renderer reports no readable pages.
        let env = setup(0, ScriptedOcr::always_ok("text"));
        let response = env
            .app
            .clone()
            .oneshot(multipart_upload("book.pdf", b"%PDF-1.4 truncated", None))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let record = body_json(response).await;
        assert!(record["error"]
            .as_str()
            .unwrap()
            .contains("Could not read PDF"));
    }

    #[tokio::test]
    async fn test_happy_path_upload_to_download() {
        let env = setup(3, ScriptedOcr::always_ok("Mocked OCR text for testing."));

        let response = env
            .app
            .clone()
            .oneshot(multipart_upload("book.pdf", b"%PDF-1.4 fake", Some("en")))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let created = body_json(response).await;
        let job_id = created["job_id"].as_str().unwrap().to_string();
        assert_eq!(created["total_pages"], 3);

        let record = wait_for_job(&env.app, &job_id).await;
        assert_eq!(record["status"], "completed");
        assert_eq!(record["pages_succeeded"], 3);
        assert_eq!(record["pages_failed"], 0);
        assert_eq!(record["failed_pages"].as_array().unwrap().len(), 0);
        assert_eq!(record["language"], "en");
        assert_eq!(record["pdf_filename"], "book.pdf");
        assert!(record["completed_at"].is_number());

        let response = get(&env.app, &format!("/api/jobs/{job_id}/result")).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers()[header::CONTENT_TYPE],
            "application/epub+zip"
        );
        assert!(response.headers()[header::CONTENT_DISPOSITION]
            .to_str()
            .unwrap()
            .contains("book.epub"));
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        // Zip local file header magic.
        assert_eq!(&bytes[..2], b"PK");
    }

    #[tokio::test]
    async fn test_events_replay_after_completion() {
        let env = setup(3, ScriptedOcr::always_ok("text"));
        let response = env
            .app
            .clone()
            .oneshot(multipart_upload("book.pdf", b"%PDF-1.4 fake", None))
            .await
            .unwrap();
        let job_id = body_json(response).await["job_id"]
            .as_str()
            .unwrap()
            .to_string();
        wait_for_job(&env.app, &job_id).await;

        // Full replay from the ring buffer; the emitter is closed, so the
        // stream ends and the body completes.
        let response = env
            .app
            .clone()
            .oneshot(
                Request::builder()
                    .uri(format!("/api/jobs/{job_id}/events"))
                    .header("Last-Event-ID", "0")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let text = String::from_utf8(body.to_vec()).unwrap();
        assert!(text.contains("job.started"));
        assert!(text.contains("page.completed"));
        assert!(text.contains("job.completed"));
        assert!(text.contains("event:"));
        assert!(text.contains("id:"));

        // Partial replay: only ids strictly greater than 5 remain.
        let response = env
            .app
            .clone()
            .oneshot(
                Request::builder()
                    .uri(format!("/api/jobs/{job_id}/events"))
                    .header("Last-Event-ID", "5")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let text = String::from_utf8(body.to_vec()).unwrap();
        assert!(!text.contains("job.started"));
        assert!(text.contains("job.completed"));
    }

    #[tokio::test]
    async fn test_result_before_completion_is_400() {
        let env = setup(3, ScriptedOcr::always_ok("text"));
        let mut job = Job::new("fa", "slow.pdf");
        job.status = JobStatus::Processing;
        job.total_pages = 3;
        job.init_pages();
        env.state.registry.create(&job).unwrap();

        let response = get(&env.app, &format!("/api/jobs/{}/result", job.id)).await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_retry_on_processing_job_is_400() {
        let env = setup(3, ScriptedOcr::always_ok("text"));
        let mut job = Job::new("fa", "slow.pdf");
        job.status = JobStatus::Processing;
        job.total_pages = 3;
        job.init_pages();
        env.state.registry.create(&job).unwrap();

        let response = post(&env.app, &format!("/api/jobs/{}/retry", job.id)).await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_retry_with_no_failed_pages_is_400() {
        let env = setup(3, ScriptedOcr::always_ok("text"));
        let response = env
            .app
            .clone()
            .oneshot(multipart_upload("book.pdf", b"%PDF-1.4 fake", None))
            .await
            .unwrap();
        let job_id = body_json(response).await["job_id"]
            .as_str()
            .unwrap()
            .to_string();
        wait_for_job(&env.app, &job_id).await;

        let response = post(&env.app, &format!("/api/jobs/{job_id}/retry")).await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_retry_after_pdf_cleanup_is_410() {
        let env = setup(3, ScriptedOcr::always_failing("HTTP 500"));
        let response = env
            .app
            .clone()
            .oneshot(multipart_upload("book.pdf", b"%PDF-1.4 fake", None))
            .await
            .unwrap();
        let job_id = body_json(response).await["job_id"]
            .as_str()
            .unwrap()
            .to_string();
        wait_for_job(&env.app, &job_id).await;

        let job = env.state.registry.get(&job_id).unwrap();
        std::fs::remove_file(job.pdf_path(&env.state.settings.data_dir)).unwrap();

        let response = post(&env.app, &format!("/api/jobs/{job_id}/retry")).await;
        assert_eq!(response.status(), StatusCode::GONE);
    }

    #[tokio::test]
    async fn test_retry_flow_recovers_failed_pages() {
        // First run: every OCR call fails. Retry: everything succeeds.
        let env = setup(3, ScriptedOcr::failing_then_ok(3, "Success from retry"));

        let response = env
            .app
            .clone()
            .oneshot(multipart_upload("book.pdf", b"%PDF-1.4 fake", None))
            .await
            .unwrap();
        let job_id = body_json(response).await["job_id"]
            .as_str()
            .unwrap()
            .to_string();

        let record = wait_for_job(&env.app, &job_id).await;
        assert_eq!(record["status"], "completed");
        assert_eq!(record["pages_failed"], 3);

        let response = post(&env.app, &format!("/api/jobs/{job_id}/retry")).await;
        assert_eq!(response.status(), StatusCode::OK);
        let retry = body_json(response).await;
        assert_eq!(retry["retrying_pages"], json!([0, 1, 2]));

        // The first poll can still see the pre-retry terminal record, so wait
        // for the rerun's outcome rather than the first terminal status.
        let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
        loop {
            let record = body_json(get(&env.app, &format!("/api/jobs/{job_id}")).await).await;
            if record["status"] == "completed" && record["pages_succeeded"] == 3 {
                assert_eq!(record["pages_failed"], 0);
                break;
            }
            assert!(
                tokio::time::Instant::now() < deadline,
                "retry for {job_id} did not complete"
            );
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
    }
}
