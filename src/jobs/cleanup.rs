//! Background cleanup of old jobs.
//!
//! Two TTLs are enforced on a fixed interval: the source PDF is removed once
//! `pdf_ttl_hours` has passed (disk pressure control), and terminal jobs are
//! fully removed once `job_ttl_hours` has passed. Jobs that are still
//! processing or assembling are never touched, regardless of age.

use std::fs;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;

use crate::config::Settings;
use crate::events::EventRegistry;
use crate::jobs::JobRegistry;

const CLEANUP_INTERVAL: Duration = Duration::from_secs(600);

/// Periodically sweep old jobs and their files. Runs until the task is
/// aborted at shutdown.
pub async fn cleanup_loop(
    registry: Arc<JobRegistry>,
    events: Arc<EventRegistry>,
    settings: Settings,
) {
    let mut interval = tokio::time::interval(CLEANUP_INTERVAL);
    // The immediate first tick would sweep at startup; skip it.
    interval.tick().await;
    loop {
        interval.tick().await;
        sweep(&registry, &events, &settings);
    }
}

/// One cleanup pass over all registered jobs.
pub fn sweep(registry: &JobRegistry, events: &EventRegistry, settings: &Settings) {
    let now = Utc::now();
    let job_ttl = chrono::Duration::hours(settings.job_ttl_hours as i64);
    let pdf_ttl = chrono::Duration::hours(settings.pdf_ttl_hours as i64);

    for job in registry.all_jobs() {
        let age = now - job.created_at;

        if job.status.is_terminal() && age > job_ttl {
            let job_dir = job.job_dir(&settings.data_dir);
            if job_dir.exists() {
                if let Err(e) = fs::remove_dir_all(&job_dir) {
                    tracing::warn!("Failed to remove {}: {}", job_dir.display(), e);
                    continue;
                }
            }
            registry.delete(&job.id);
            events.remove(&job.id);
            tracing::info!(
                "Cleaned up job {} (age: {}h)",
                job.id,
                age.num_hours()
            );
            continue;
        }

        // Delete the source PDF earlier to save disk; the job record remains.
        if age > pdf_ttl {
            let pdf_path = job.pdf_path(&settings.data_dir);
            if pdf_path.exists() {
                match fs::remove_file(&pdf_path) {
                    Ok(()) => tracing::info!("Deleted PDF for job {}", job.id),
                    Err(e) => tracing::warn!("Failed to delete {}: {}", pdf_path.display(), e),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Job, JobStatus};
    use tempfile::tempdir;

    struct CleanupEnv {
        _dir: tempfile::TempDir,
        registry: Arc<JobRegistry>,
        events: Arc<EventRegistry>,
        settings: Settings,
    }

    fn setup() -> CleanupEnv {
        let dir = tempdir().unwrap();
        let settings = Settings {
            job_ttl_hours: 1,
            pdf_ttl_hours: 0,
            ..Settings::with_data_dir(dir.path().to_path_buf())
        };
        CleanupEnv {
            registry: Arc::new(JobRegistry::new(dir.path().to_path_buf())),
            events: Arc::new(EventRegistry::new()),
            settings,
            _dir: dir,
        }
    }

    fn aged_job(env: &CleanupEnv, status: JobStatus, age_hours: i64) -> Job {
        let mut job = Job::new("fa", "test.pdf");
        job.status = status;
        job.total_pages = 1;
        job.init_pages();
        job.created_at = Utc::now() - chrono::Duration::hours(age_hours);
        env.registry.create(&job).unwrap();
        fs::write(job.pdf_path(&env.settings.data_dir), b"%PDF-1.4").unwrap();
        job
    }

    #[tokio::test]
    async fn test_expired_terminal_job_is_fully_removed() {
        let env = setup();
        let job = aged_job(&env, JobStatus::Completed, 2);
        let emitter = env.events.get_or_create(&job.id, 50);
        let mut sub = emitter.subscribe(None);

        sweep(&env.registry, &env.events, &env.settings);

        assert!(env.registry.get(&job.id).is_none());
        assert!(!job.job_dir(&env.settings.data_dir).exists());
        assert!(env.events.get(&job.id).is_none());
        // Removal closes the emitter.
        assert!(sub.recv().await.is_none());
    }

    #[test]
    fn test_fresh_terminal_job_keeps_directory_but_loses_pdf() {
        let env = setup();
        // Within job_ttl (1h) but past pdf_ttl (0h).
        let job = aged_job(&env, JobStatus::Failed, 0);
        // Force a nonzero age for the pdf_ttl comparison.
        let mut job = env.registry.get(&job.id).unwrap();
        job.created_at = Utc::now() - chrono::Duration::minutes(30);
        env.registry.save(&job).unwrap();

        sweep(&env.registry, &env.events, &env.settings);

        assert!(env.registry.get(&job.id).is_some());
        assert!(job.job_dir(&env.settings.data_dir).exists());
        assert!(!job.pdf_path(&env.settings.data_dir).exists());
    }

    #[test]
    fn test_processing_job_is_never_swept() {
        let env = setup();
        let job = aged_job(&env, JobStatus::Processing, 100);

        sweep(&env.registry, &env.events, &env.settings);

        assert!(env.registry.get(&job.id).is_some());
        assert!(job.job_dir(&env.settings.data_dir).exists());
        // The PDF may still be deleted after pdf_ttl.
        assert!(!job.pdf_path(&env.settings.data_dir).exists());
    }

    #[test]
    fn test_assembling_job_is_never_swept() {
        let env = setup();
        let job = aged_job(&env, JobStatus::Assembling, 100);

        sweep(&env.registry, &env.events, &env.settings);

        assert!(env.registry.get(&job.id).is_some());
    }

    #[test]
    fn test_young_completed_job_survives() {
        let env = setup();
        let settings = Settings {
            pdf_ttl_hours: 10,
            ..env.settings.clone()
        };
        let job = aged_job(&env, JobStatus::Completed, 0);

        sweep(&env.registry, &env.events, &settings);

        assert!(env.registry.get(&job.id).is_some());
        assert!(job.pdf_path(&settings.data_dir).exists());
    }
}
