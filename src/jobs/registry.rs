//! In-memory job store with disk persistence.
//!
//! The registry is the authoritative source for job metadata during the
//! process lifetime. Every state transition is committed by `save`, which
//! snapshots the record into the in-memory map and rewrites `job.json`
//! through a temp-file-and-rename so a crash leaves the last complete record
//! behind rather than a torn one.

use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;
use std::sync::RwLock;

use crate::models::Job;

const JOB_META_FILE: &str = "job.json";

/// Thread-safe in-memory registry of jobs with JSON persistence.
pub struct JobRegistry {
    jobs: RwLock<HashMap<String, Job>>,
    data_dir: PathBuf,
}

impl JobRegistry {
    pub fn new(data_dir: PathBuf) -> Self {
        Self {
            jobs: RwLock::new(HashMap::new()),
            data_dir,
        }
    }

    /// Register a new job, create its directory, and persist it.
    pub fn create(&self, job: &Job) -> anyhow::Result<()> {
        fs::create_dir_all(job.job_dir(&self.data_dir))?;
        self.save(job)?;
        Ok(())
    }

    /// Snapshot of the current record for a job, if known.
    pub fn get(&self, job_id: &str) -> Option<Job> {
        self.jobs.read().unwrap().get(job_id).cloned()
    }

    /// Persist job state: update the in-memory snapshot and rewrite
    /// `job.json`. This is the commit point for every state transition.
    pub fn save(&self, job: &Job) -> anyhow::Result<()> {
        self.jobs
            .write()
            .unwrap()
            .insert(job.id.clone(), job.clone());

        let job_dir = job.job_dir(&self.data_dir);
        fs::create_dir_all(&job_dir)?;

        let bytes = serde_json::to_vec_pretty(job)?;
        let tmp_path = job_dir.join(format!("{JOB_META_FILE}.tmp"));
        fs::write(&tmp_path, bytes)?;
        fs::rename(&tmp_path, job_dir.join(JOB_META_FILE))?;
        Ok(())
    }

    /// Remove a job from the registry. Does not touch files; the cleanup
    /// sweep owns file removal.
    pub fn delete(&self, job_id: &str) {
        self.jobs.write().unwrap().remove(job_id);
    }

    /// Snapshot of all current records.
    pub fn all_jobs(&self) -> Vec<Job> {
        self.jobs.read().unwrap().values().cloned().collect()
    }

    /// Load persisted jobs from disk. Called once at startup; records that
    /// fail to parse are logged and skipped.
    pub fn load_from_disk(&self) {
        let jobs_dir = self.data_dir.join("jobs");
        let entries = match fs::read_dir(&jobs_dir) {
            Ok(entries) => entries,
            Err(_) => return,
        };

        for entry in entries.flatten() {
            let meta_path = entry.path().join(JOB_META_FILE);
            if !meta_path.is_file() {
                continue;
            }
            match fs::read(&meta_path)
                .map_err(anyhow::Error::from)
                .and_then(|bytes| Ok(serde_json::from_slice::<Job>(&bytes)?))
            {
                Ok(job) => {
                    tracing::info!("Loaded job {} from disk", job.id);
                    self.jobs.write().unwrap().insert(job.id.clone(), job);
                }
                Err(e) => {
                    tracing::warn!("Skipping unreadable job record {}: {}", meta_path.display(), e);
                }
            }
        }
    }
}
