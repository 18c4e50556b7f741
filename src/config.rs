//! Configuration for the conversion service.
//!
//! All options live in a flat [`Settings`] struct with sensible defaults.
//! Every field can be overridden through a `REFLOW_*` environment variable
//! (a `.env` file is loaded by `main` before settings are read).

use std::fs;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

/// Default instruction sent to the vision model when a job carries no
/// per-job prompt override.
pub const DEFAULT_OCR_PROMPT: &str = "Extract all text from this scanned book page. \
     Preserve paragraph structure. Output only the extracted text, nothing else.";

/// Application settings.
#[derive(Debug, Clone)]
pub struct Settings {
    /// Base URL of the vision OCR service.
    pub ocr_base_url: String,
    /// Vision model name.
    pub ocr_model: String,
    /// Per-request OCR timeout in seconds.
    pub ocr_timeout_secs: u64,
    /// Attempts per page before the page is marked failed.
    pub ocr_retries: u32,
    /// Rasterization resolution.
    pub render_dpi: u32,
    /// JPEG compression quality (1-100).
    pub jpeg_quality: u8,
    /// Downscale rendered pages whose longest side exceeds this (0 = off).
    pub max_image_dimension: u32,
    /// Concurrent OCR workers per job.
    pub ocr_workers: usize,
    /// Capacity of the rendered-page queue.
    pub render_queue_size: usize,
    /// Pages grouped into one EPUB chapter.
    pub pages_per_chapter: u32,
    /// Root directory for job state and artifacts.
    pub data_dir: PathBuf,
    /// Hours after creation before a terminal job is fully removed.
    pub job_ttl_hours: u64,
    /// Hours after creation before the source PDF is deletable.
    pub pdf_ttl_hours: u64,
    /// Events retained per job for reconnection replay.
    pub sse_ring_buffer_size: usize,
    /// Default OCR prompt.
    pub default_ocr_prompt: String,
    /// HTTP bind host.
    pub host: String,
    /// HTTP bind port.
    pub port: u16,
}

impl Default for Settings {
    fn default() -> Self {
        // Falls back gracefully: platform data dir -> current dir
        let data_dir = dirs::data_local_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("reflow");

        Self {
            ocr_base_url: "http://localhost:11434".to_string(),
            ocr_model: "qwen2.5-vl:7b".to_string(),
            ocr_timeout_secs: 120,
            ocr_retries: 3,
            render_dpi: 200,
            jpeg_quality: 75,
            max_image_dimension: 1568,
            ocr_workers: 2,
            render_queue_size: 8,
            pages_per_chapter: 20,
            data_dir,
            job_ttl_hours: 24,
            pdf_ttl_hours: 1,
            sse_ring_buffer_size: 200,
            default_ocr_prompt: DEFAULT_OCR_PROMPT.to_string(),
            host: "0.0.0.0".to_string(),
            port: 8000,
        }
    }
}

impl Settings {
    /// Load settings, applying `REFLOW_*` environment overrides on top of the
    /// defaults.
    pub fn from_env() -> Self {
        let mut settings = Self::default();

        if let Some(url) = env_string("REFLOW_OCR_BASE_URL") {
            settings.ocr_base_url = url.trim_end_matches('/').to_string();
        }
        if let Some(model) = env_string("REFLOW_OCR_MODEL") {
            settings.ocr_model = model;
        }
        if let Some(v) = env_parse("REFLOW_OCR_TIMEOUT_SECS") {
            settings.ocr_timeout_secs = v;
        }
        if let Some(v) = env_parse("REFLOW_OCR_RETRIES") {
            settings.ocr_retries = v;
        }
        if let Some(v) = env_parse("REFLOW_RENDER_DPI") {
            settings.render_dpi = v;
        }
        if let Some(v) = env_parse("REFLOW_JPEG_QUALITY") {
            settings.jpeg_quality = v;
        }
        if let Some(v) = env_parse("REFLOW_MAX_IMAGE_DIMENSION") {
            settings.max_image_dimension = v;
        }
        if let Some(v) = env_parse("REFLOW_OCR_WORKERS") {
            settings.ocr_workers = v;
        }
        if let Some(v) = env_parse("REFLOW_RENDER_QUEUE_SIZE") {
            settings.render_queue_size = v;
        }
        if let Some(v) = env_parse("REFLOW_PAGES_PER_CHAPTER") {
            settings.pages_per_chapter = v;
        }
        if let Some(dir) = env_string("REFLOW_DATA_DIR") {
            settings.data_dir = PathBuf::from(shellexpand::tilde(&dir).into_owned());
        }
        if let Some(v) = env_parse("REFLOW_JOB_TTL_HOURS") {
            settings.job_ttl_hours = v;
        }
        if let Some(v) = env_parse("REFLOW_PDF_TTL_HOURS") {
            settings.pdf_ttl_hours = v;
        }
        if let Some(v) = env_parse("REFLOW_SSE_RING_BUFFER_SIZE") {
            settings.sse_ring_buffer_size = v;
        }
        if let Some(prompt) = env_string("REFLOW_OCR_PROMPT") {
            settings.default_ocr_prompt = prompt;
        }
        if let Some(host) = env_string("REFLOW_HOST") {
            settings.host = host;
        }
        if let Some(v) = env_parse("REFLOW_PORT") {
            settings.port = v;
        }

        settings
    }

    /// Create settings rooted at a custom data directory.
    pub fn with_data_dir(data_dir: PathBuf) -> Self {
        Self {
            data_dir,
            ..Default::default()
        }
    }

    /// Directory containing all per-job directories.
    pub fn jobs_dir(&self) -> PathBuf {
        self.data_dir.join("jobs")
    }

    /// OCR timeout as a [`Duration`].
    pub fn ocr_timeout(&self) -> Duration {
        Duration::from_secs(self.ocr_timeout_secs)
    }

    /// Ensure the data directory tree exists.
    pub fn ensure_directories(&self) -> std::io::Result<()> {
        fs::create_dir_all(self.jobs_dir())
    }
}

fn env_string(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|s| !s.is_empty())
}

fn env_parse<T: FromStr>(key: &str) -> Option<T> {
    match std::env::var(key) {
        Ok(raw) => match raw.trim().parse() {
            Ok(v) => Some(v),
            Err(_) => {
                tracing::warn!("Ignoring unparseable {}={:?}", key, raw);
                None
            }
        },
        Err(_) => None,
    }
}
