//! Producer-consumer pipeline driving one job from admission to a terminal
//! status.
//!
//! A single producer renders pages into a bounded queue; a fixed pool of
//! workers drains it, calling the OCR service under a concurrency permit and
//! stamping each result into the job record. Closing the queue's sender is
//! the end-of-stream signal: workers exit when `recv` returns `None`. Every
//! per-page update is checkpointed and broadcast before the next save, and
//! exactly one terminal event is emitted per run before the emitter closes.
//!
//! Per-page OCR failures never fail the job; only setup errors (the PDF is
//! gone) and assembly errors do. A mid-stream render error closes the queue
//! early so workers drain and the job still assembles what it has.

use std::collections::HashSet;
use std::sync::Arc;

use anyhow::Context;
use chrono::Utc;
use futures::StreamExt;
use serde_json::json;
use tokio::sync::{mpsc, Mutex, Semaphore};

use crate::config::Settings;
use crate::events::EventEmitter;
use crate::jobs::JobRegistry;
use crate::models::{Job, JobStatus, PageResult, PageStatus};
use crate::pipeline::assembler::assemble_epub;
use crate::pipeline::ocr::TextRecognizer;
use crate::pipeline::renderer::{render_pages, PageRenderer, RenderOptions};

const PREVIEW_CHARS: usize = 200;

/// Run the full OCR pipeline for a job.
///
/// The job is mutated on a working copy; `registry.save` is the commit point
/// that publishes snapshots to HTTP readers and disk. When
/// `pages_to_process` is set (retry), only those page indices are processed
/// and every other page keeps its prior result.
pub async fn run_pipeline(
    job: Job,
    settings: Arc<Settings>,
    registry: Arc<JobRegistry>,
    emitter: Arc<EventEmitter>,
    renderer: Arc<dyn PageRenderer>,
    recognizer: Arc<dyn TextRecognizer>,
    pages_to_process: Option<Vec<u32>>,
) {
    let job_id = job.id.clone();
    let job = Arc::new(Mutex::new(job));

    let outcome = drive(
        Arc::clone(&job),
        &settings,
        &registry,
        &emitter,
        renderer,
        recognizer,
        pages_to_process,
    )
    .await;

    if let Err(e) = outcome {
        tracing::error!("Pipeline failed for job {}: {:#}", job_id, e);
        let mut job = job.lock().await;
        job.status = JobStatus::Failed;
        job.completed_at = Some(Utc::now());
        job.error = Some(e.to_string());
        if let Err(save_err) = registry.save(&job) {
            tracing::error!("Failed to persist failed job {}: {}", job_id, save_err);
        }
        emitter.emit("job.failed", json!({ "error": e.to_string() }));
    }

    emitter.close();
}

async fn drive(
    job: Arc<Mutex<Job>>,
    settings: &Arc<Settings>,
    registry: &Arc<JobRegistry>,
    emitter: &Arc<EventEmitter>,
    renderer: Arc<dyn PageRenderer>,
    recognizer: Arc<dyn TextRecognizer>,
    pages_to_process: Option<Vec<u32>>,
) -> anyhow::Result<()> {
    let (job_id, total_pages, pdf_path, render_options, prompt) = {
        let mut job = job.lock().await;
        job.status = JobStatus::Processing;
        job.started_at = Some(Utc::now());
        registry.save(&job)?;
        (
            job.id.clone(),
            job.total_pages,
            job.pdf_path(&settings.data_dir),
            RenderOptions {
                dpi: job.render_dpi.unwrap_or(settings.render_dpi),
                jpeg_quality: job.jpeg_quality.unwrap_or(settings.jpeg_quality),
                max_dimension: settings.max_image_dimension,
            },
            job.ocr_prompt
                .clone()
                .unwrap_or_else(|| settings.default_ocr_prompt.clone()),
        )
    };

    emitter.emit(
        "job.started",
        json!({
            "job_id": job_id,
            "total_pages": total_pages,
            "status": JobStatus::Processing.as_str(),
        }),
    );

    if !pdf_path.is_file() {
        anyhow::bail!("Could not open PDF: {}", pdf_path.display());
    }

    let filter: Option<HashSet<u32>> = pages_to_process.map(|pages| pages.into_iter().collect());

    let (queue_tx, queue_rx) = mpsc::channel::<(u32, Vec<u8>)>(settings.render_queue_size.max(1));

    // Producer: pull rendered pages and feed the bounded queue. Dropping the
    // sender at the end closes the queue, which is what shuts workers down.
    let producer = {
        let renderer = Arc::clone(&renderer);
        let pdf_path = pdf_path.clone();
        tokio::spawn(async move {
            let stream = render_pages(renderer, pdf_path, total_pages, render_options);
            let mut stream = std::pin::pin!(stream);
            while let Some(item) = stream.next().await {
                match item {
                    Ok((page, image)) => {
                        if filter.as_ref().map(|f| !f.contains(&page)).unwrap_or(false) {
                            continue;
                        }
                        if queue_tx.send((page, image)).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        tracing::error!("Renderer failed: {}", e);
                        break;
                    }
                }
            }
        })
    };

    let queue_rx = Arc::new(Mutex::new(queue_rx));
    let semaphore = Arc::new(Semaphore::new(settings.ocr_workers.max(1)));
    let data_dir = settings.data_dir.clone();

    let mut workers = Vec::with_capacity(settings.ocr_workers.max(1));
    for _ in 0..settings.ocr_workers.max(1) {
        let queue_rx = Arc::clone(&queue_rx);
        let semaphore = Arc::clone(&semaphore);
        let recognizer = Arc::clone(&recognizer);
        let job = Arc::clone(&job);
        let registry = Arc::clone(registry);
        let emitter = Arc::clone(emitter);
        let prompt = prompt.clone();
        let data_dir = data_dir.clone();

        workers.push(tokio::spawn(async move {
            loop {
                let item = { queue_rx.lock().await.recv().await };
                let Some((page, image)) = item else { break };

                let Ok(_permit) = semaphore.acquire().await else { break };

                {
                    let mut job = job.lock().await;
                    job.pages.insert(
                        page,
                        PageResult {
                            page,
                            status: PageStatus::Processing,
                            text: String::new(),
                            error: None,
                        },
                    );
                }

                match recognizer.recognize(&image, &prompt).await {
                    Ok(text) => {
                        let snapshot = {
                            let mut job = job.lock().await;
                            if let Some(result) = job.pages.get_mut(&page) {
                                result.status = PageStatus::Success;
                                result.text = text.clone();
                            }
                            job.clone()
                        };

                        // Best-effort checkpoint; the in-memory record stays
                        // correct even if this write fails.
                        let text_path = snapshot.page_text_path(&data_dir, page);
                        if let Err(e) = std::fs::create_dir_all(text_path.parent().unwrap_or(&data_dir))
                            .and_then(|_| std::fs::write(&text_path, &text))
                        {
                            tracing::warn!(
                                "Failed to checkpoint page {} of job {}: {}",
                                page,
                                snapshot.id,
                                e
                            );
                        }

                        emitter.emit(
                            "page.completed",
                            json!({
                                "page": page,
                                "total_pages": snapshot.total_pages,
                                "status": PageStatus::Success.as_str(),
                                "text_preview": preview(&text),
                            }),
                        );

                        if let Err(e) = registry.save(&snapshot) {
                            tracing::error!("Failed to save job {}: {}", snapshot.id, e);
                        }
                    }
                    Err(e) => {
                        tracing::error!("OCR failed for page {}: {}", page, e);
                        let snapshot = {
                            let mut job = job.lock().await;
                            if let Some(result) = job.pages.get_mut(&page) {
                                result.status = PageStatus::Failed;
                                result.error = Some(e.to_string());
                            }
                            job.clone()
                        };

                        emitter.emit(
                            "page.completed",
                            json!({
                                "page": page,
                                "total_pages": snapshot.total_pages,
                                "status": PageStatus::Failed.as_str(),
                                "error": e.to_string(),
                            }),
                        );

                        if let Err(save_err) = registry.save(&snapshot) {
                            tracing::error!("Failed to save job {}: {}", snapshot.id, save_err);
                        }
                    }
                }
            }
        }));
    }

    producer.await.context("renderer task aborted")?;
    for worker in workers {
        worker.await.context("OCR worker aborted")?;
    }

    // Assembly phase.
    let snapshot = {
        let mut job = job.lock().await;
        job.status = JobStatus::Assembling;
        registry.save(&job)?;
        job.clone()
    };

    emitter.emit(
        "job.assembling",
        json!({
            "pages_succeeded": snapshot.pages_succeeded(),
            "pages_failed": snapshot.pages_failed(),
        }),
    );

    let page_texts: std::collections::BTreeMap<u32, String> = snapshot
        .pages
        .values()
        .filter(|p| p.status == PageStatus::Success)
        .map(|p| (p.page, p.text.clone()))
        .collect();

    let epub_path = snapshot.epub_path(&settings.data_dir);
    let title = derive_title(&snapshot.pdf_filename);
    let language = snapshot.language.clone();
    let pages_per_chapter = settings.pages_per_chapter;

    tokio::task::spawn_blocking(move || {
        assemble_epub(
            &page_texts,
            snapshot.total_pages,
            &epub_path,
            &title,
            &language,
            pages_per_chapter,
        )
    })
    .await
    .context("assembler task aborted")?
    .context("EPUB assembly failed")?;

    let (snapshot, duration_seconds) = {
        let mut job = job.lock().await;
        let finished_at = Utc::now();
        job.status = JobStatus::Completed;
        job.completed_at = Some(finished_at);
        registry.save(&job)?;
        let start = job.started_at.unwrap_or(job.created_at);
        let millis = (finished_at - start).num_milliseconds();
        (job.clone(), (millis as f64 / 100.0).round() / 10.0)
    };

    emitter.emit(
        "job.completed",
        json!({
            "download_url": format!("/api/jobs/{}/result", snapshot.id),
            "duration_seconds": duration_seconds,
            "pages_succeeded": snapshot.pages_succeeded(),
            "failed_pages": snapshot.failed_page_numbers(),
        }),
    );

    Ok(())
}

/// First 200 characters of the recognized text, for event payloads.
fn preview(text: &str) -> String {
    text.chars().take(PREVIEW_CHARS).collect()
}

/// Book title from the uploaded file name.
fn derive_title(pdf_filename: &str) -> String {
    let stem = std::path::Path::new(pdf_filename)
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("");
    if stem.is_empty() {
        "Converted Book".to_string()
    } else {
        stem.to_string()
    }
}
