//! Job and per-page result models.
//!
//! A [`Job`] tracks one uploaded PDF through the OCR pipeline. The record is
//! held in memory by the job registry and persisted as `job.json` inside the
//! job directory; the pipeline orchestrator is its sole writer during a run.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Lifecycle status of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Processing,
    Assembling,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::Assembling => "assembling",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    /// Terminal statuses admit no further transitions.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

/// Status of a single page within a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PageStatus {
    Pending,
    Processing,
    Success,
    Failed,
}

impl PageStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::Success => "success",
            Self::Failed => "failed",
        }
    }
}

/// Result of OCR for one page.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PageResult {
    /// 0-based page index; equals the key under which it is stored.
    pub page: u32,
    pub status: PageStatus,
    /// Extracted text; empty unless `status` is `Success`.
    #[serde(default)]
    pub text: String,
    /// Short failure message when `status` is `Failed`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl PageResult {
    /// A fresh pending result for the given page.
    pub fn pending(page: u32) -> Self {
        Self {
            page,
            status: PageStatus::Pending,
            text: String::new(),
            error: None,
        }
    }
}

/// One conversion job: a single uploaded PDF and its per-page OCR state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    /// Opaque short identifier.
    pub id: String,
    pub status: JobStatus,
    /// Page count of the source PDF, set once at admission.
    pub total_pages: u32,
    /// Per-page results, keys dense over `[0, total_pages)`.
    #[serde(default)]
    pub pages: BTreeMap<u32, PageResult>,
    /// Output language tag; `fa` and `ar` select right-to-left output.
    pub language: String,
    /// Per-job OCR prompt override.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ocr_prompt: Option<String>,
    /// Per-job render DPI override.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub render_dpi: Option<u32>,
    /// Per-job JPEG quality override.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub jpeg_quality: Option<u8>,
    /// Original upload file name, informational only.
    #[serde(default)]
    pub pdf_filename: String,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    /// Fatal error message when `status` is `Failed`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Job {
    /// Create a new pending job.
    pub fn new(language: impl Into<String>, pdf_filename: impl Into<String>) -> Self {
        let id = uuid::Uuid::new_v4().simple().to_string()[..12].to_string();
        Self {
            id,
            status: JobStatus::Pending,
            total_pages: 0,
            pages: BTreeMap::new(),
            language: language.into(),
            ocr_prompt: None,
            render_dpi: None,
            jpeg_quality: None,
            pdf_filename: pdf_filename.into(),
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            error: None,
        }
    }

    /// Install a pending [`PageResult`] for every page index.
    pub fn init_pages(&mut self) {
        self.pages = (0..self.total_pages)
            .map(|i| (i, PageResult::pending(i)))
            .collect();
    }

    pub fn pages_succeeded(&self) -> u32 {
        self.count_status(PageStatus::Success)
    }

    pub fn pages_failed(&self) -> u32 {
        self.count_status(PageStatus::Failed)
    }

    pub fn pages_completed(&self) -> u32 {
        self.pages_succeeded() + self.pages_failed()
    }

    /// Page indices with a failed result, in ascending order.
    pub fn failed_page_numbers(&self) -> Vec<u32> {
        self.pages
            .values()
            .filter(|p| p.status == PageStatus::Failed)
            .map(|p| p.page)
            .collect()
    }

    fn count_status(&self, status: PageStatus) -> u32 {
        self.pages.values().filter(|p| p.status == status).count() as u32
    }

    pub fn job_dir(&self, data_dir: &Path) -> PathBuf {
        data_dir.join("jobs").join(&self.id)
    }

    pub fn pdf_path(&self, data_dir: &Path) -> PathBuf {
        self.job_dir(data_dir).join("input.pdf")
    }

    pub fn epub_path(&self, data_dir: &Path) -> PathBuf {
        self.job_dir(data_dir).join("output.epub")
    }

    /// Per-page checkpoint file, `pages/NNNNN.txt`.
    pub fn page_text_path(&self, data_dir: &Path, page: u32) -> PathBuf {
        self.job_dir(data_dir)
            .join("pages")
            .join(format!("{:05}.txt", page))
    }
}
