//! The OCR conversion pipeline: rendering, recognition, orchestration, and
//! EPUB assembly.

pub mod assembler;
pub mod ocr;
pub mod orchestrator;
pub mod renderer;

pub use assembler::assemble_epub;
pub use ocr::{OcrClient, OcrError, TextRecognizer};
pub use orchestrator::run_pipeline;
pub use renderer::{render_pages, PageRenderer, PopplerRenderer, RenderError, RenderOptions};
