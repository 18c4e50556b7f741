//! PDF page rasterization using poppler-utils.
//!
//! Pages are rendered one at a time with `pdftoppm` into a scratch directory
//! and read back as JPEG bytes; the page count comes from `pdfinfo`. Both
//! binaries ship with the poppler-utils package. Rendering is blocking and is
//! expected to run on the blocking thread pool (the orchestrator wraps calls
//! in `spawn_blocking`).

use std::io::Cursor;
use std::path::{Path, PathBuf};
use std::process::Command;

use tempfile::TempDir;
use thiserror::Error;

/// Errors that can occur while rasterizing a PDF.
#[derive(Debug, Error)]
pub enum RenderError {
    #[error("External tool not found: {0}")]
    ToolNotFound(String),

    #[error("Render failed: {0}")]
    RenderFailed(String),

    #[error("Image processing failed: {0}")]
    Image(#[from] image::ImageError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Options influencing rasterization output.
#[derive(Debug, Clone, Copy)]
pub struct RenderOptions {
    /// Rasterization resolution.
    pub dpi: u32,
    /// JPEG compression quality (1-100).
    pub jpeg_quality: u8,
    /// Downscale output whose longest side exceeds this (0 = off).
    pub max_dimension: u32,
}

/// Rasterizes single pages of a PDF. The seam is a trait so the pipeline can
/// be exercised without poppler installed.
pub trait PageRenderer: Send + Sync {
    /// Number of pages in the PDF.
    fn page_count(&self, pdf_path: &Path) -> Result<u32, RenderError>;

    /// Render one 0-based page to JPEG bytes.
    fn render_page(
        &self,
        pdf_path: &Path,
        page: u32,
        options: &RenderOptions,
    ) -> Result<Vec<u8>, RenderError>;
}

/// [`PageRenderer`] backed by poppler's `pdftoppm` and `pdfinfo`.
#[derive(Default)]
pub struct PopplerRenderer;

impl PageRenderer for PopplerRenderer {
    fn page_count(&self, pdf_path: &Path) -> Result<u32, RenderError> {
        let output = Command::new("pdfinfo").arg(pdf_path).output();
        let output = match output {
            Ok(output) => output,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(RenderError::ToolNotFound(
                    "pdfinfo (install poppler-utils)".to_string(),
                ));
            }
            Err(e) => return Err(RenderError::Io(e)),
        };

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(RenderError::RenderFailed(format!(
                "pdfinfo failed: {}",
                stderr.trim()
            )));
        }

        parse_page_count(&String::from_utf8_lossy(&output.stdout)).ok_or_else(|| {
            RenderError::RenderFailed("pdfinfo output had no Pages line".to_string())
        })
    }

    fn render_page(
        &self,
        pdf_path: &Path,
        page: u32,
        options: &RenderOptions,
    ) -> Result<Vec<u8>, RenderError> {
        let temp_dir = TempDir::new()?;
        // pdftoppm numbers pages from 1.
        let page_str = (page + 1).to_string();
        let quality_opt = format!("quality={}", options.jpeg_quality);

        let status = Command::new("pdftoppm")
            .args(["-jpeg", "-r", &options.dpi.to_string()])
            .args(["-jpegopt", &quality_opt])
            .args(["-f", &page_str, "-l", &page_str])
            .arg(pdf_path)
            .arg(temp_dir.path().join("page"))
            .status();

        match status {
            Ok(s) if s.success() => {}
            Ok(_) => {
                return Err(RenderError::RenderFailed(format!(
                    "pdftoppm failed on page {}",
                    page
                )));
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(RenderError::ToolNotFound(
                    "pdftoppm (install poppler-utils)".to_string(),
                ));
            }
            Err(e) => return Err(RenderError::Io(e)),
        }

        let image_path = find_rendered_image(temp_dir.path()).ok_or_else(|| {
            RenderError::RenderFailed(format!("pdftoppm produced no image for page {}", page))
        })?;
        let jpeg_bytes = std::fs::read(image_path)?;

        downscale_if_needed(jpeg_bytes, options.max_dimension, options.jpeg_quality)
    }
}

/// Lazy stream of `(page_index, jpeg_bytes)` items. Each page is rendered on
/// the blocking pool only when the consumer pulls it, so pairing the stream
/// with a bounded queue yields natural backpressure.
pub fn render_pages(
    renderer: std::sync::Arc<dyn PageRenderer>,
    pdf_path: PathBuf,
    total_pages: u32,
    options: RenderOptions,
) -> impl futures::Stream<Item = Result<(u32, Vec<u8>), RenderError>> {
    futures::stream::unfold(0u32, move |page| {
        let renderer = std::sync::Arc::clone(&renderer);
        let pdf_path = pdf_path.clone();
        async move {
            if page >= total_pages {
                return None;
            }
            let rendered =
                tokio::task::spawn_blocking(move || renderer.render_page(&pdf_path, page, &options))
                    .await
                    .unwrap_or_else(|e| {
                        Err(RenderError::RenderFailed(format!("render task panicked: {e}")))
                    });
            Some((rendered.map(|bytes| (page, bytes)), page + 1))
        }
    })
}

/// Extract the page count from `pdfinfo` output.
fn parse_page_count(stdout: &str) -> Option<u32> {
    stdout
        .lines()
        .find(|line| line.starts_with("Pages:"))
        .and_then(|line| line.split_whitespace().nth(1))
        .and_then(|s| s.parse().ok())
}

/// Find the single JPEG `pdftoppm` wrote into the scratch directory. The
/// suffix width varies with the document's page count, so scan instead of
/// guessing the name.
fn find_rendered_image(dir: &Path) -> Option<PathBuf> {
    let mut images: Vec<PathBuf> = std::fs::read_dir(dir)
        .ok()?
        .flatten()
        .map(|e| e.path())
        .filter(|p| p.extension().map(|ext| ext == "jpg").unwrap_or(false))
        .collect();
    images.sort();
    images.into_iter().next()
}

/// Re-encode the JPEG at `quality` with its longest side capped at
/// `max_dimension`, preserving aspect ratio. Returns the input untouched when
/// the cap is disabled or already satisfied.
fn downscale_if_needed(
    jpeg_bytes: Vec<u8>,
    max_dimension: u32,
    quality: u8,
) -> Result<Vec<u8>, RenderError> {
    if max_dimension == 0 {
        return Ok(jpeg_bytes);
    }

    let img = image::load_from_memory(&jpeg_bytes)?;
    if img.width() <= max_dimension && img.height() <= max_dimension {
        return Ok(jpeg_bytes);
    }

    let resized = img.thumbnail(max_dimension, max_dimension);
    let mut out = Cursor::new(Vec::new());
    let encoder = image::codecs::jpeg::JpegEncoder::new_with_quality(&mut out, quality);
    resized.write_with_encoder(encoder)?;
    Ok(out.into_inner())
}

/// Check whether a binary is available on PATH.
pub fn check_binary(name: &str) -> bool {
    which::which(name).is_ok()
}
