//! Web server for the conversion service.
//!
//! Exposes the job API: upload a scanned PDF, watch per-page progress over
//! SSE, download the finished EPUB, and retry failed pages.

mod handlers;
mod routes;

pub use routes::create_router;

use std::net::SocketAddr;
use std::sync::Arc;

use crate::config::Settings;
use crate::events::EventRegistry;
use crate::jobs::{cleanup_loop, JobRegistry};
use crate::pipeline::{OcrClient, PageRenderer, PopplerRenderer, TextRecognizer};

/// Shared state for the web server.
#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<JobRegistry>,
    pub events: Arc<EventRegistry>,
    pub settings: Arc<Settings>,
    /// Page rasterization seam; poppler in production, a stub in tests.
    pub renderer: Arc<dyn PageRenderer>,
    /// OCR seam; the remote vision service in production.
    pub recognizer: Arc<dyn TextRecognizer>,
}

impl AppState {
    pub fn new(settings: Settings) -> Self {
        let recognizer = OcrClient::new(
            settings.ocr_base_url.clone(),
            settings.ocr_model.clone(),
            settings.ocr_timeout(),
            settings.ocr_retries,
        );

        Self {
            registry: Arc::new(JobRegistry::new(settings.data_dir.clone())),
            events: Arc::new(EventRegistry::new()),
            renderer: Arc::new(PopplerRenderer),
            recognizer: Arc::new(recognizer),
            settings: Arc::new(settings),
        }
    }
}

/// Start the web server.
pub async fn serve(settings: Settings, host: &str, port: u16) -> anyhow::Result<()> {
    settings.ensure_directories()?;

    let state = AppState::new(settings);
    state.registry.load_from_disk();

    let cleanup = tokio::spawn(cleanup_loop(
        Arc::clone(&state.registry),
        Arc::clone(&state.events),
        state.settings.as_ref().clone(),
    ));

    let app = create_router(state);

    let addr: SocketAddr = format!("{}:{}", host, port).parse()?;
    tracing::info!("Starting server at http://{}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    cleanup.abort();
    Ok(())
}
