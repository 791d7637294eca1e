// SPDX-License-Identifier: MIT

//! Durable `Job` snapshots, one file per job, written atomically
//! (write-to-`.tmp`-then-rename) so a crash mid-write never corrupts a
//! previously good snapshot.

use codestory_core::{Job, JobId};
use serde::{Deserialize, Serialize};
use std::fs::{self, File};
use std::io::{BufReader, BufWriter};
use std::path::PathBuf;
use thiserror::Error;
use tracing::warn;

#[derive(Debug, Error)]
pub enum JobStoreError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct JobSnapshot {
    job: Job,
}

/// Snapshot-per-job durable store. Recovery on process restart is a
/// directory scan, not WAL replay — jobs are relatively few and large
/// compared to progress events, so a full-rewrite snapshot per update is
/// the simpler idiom here; write-ahead logging is `EventLog`'s job, not
/// this one's.
pub struct JobStore {
    root: PathBuf,
}

impl JobStore {
    pub fn new(root: impl Into<PathBuf>) -> Result<Self, JobStoreError> {
        let root = root.into();
        fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    fn path_for(&self, job_id: &JobId) -> PathBuf {
        self.root.join(format!("{}.json", job_id.as_str()))
    }

    pub fn save(&self, job: &Job) -> Result<(), JobStoreError> {
        let path = self.path_for(&job.id);
        let tmp_path = path.with_extension("tmp");
        {
            let file = File::create(&tmp_path)?;
            let mut writer = BufWriter::new(file);
            serde_json::to_writer(&mut writer, &JobSnapshot { job: job.clone() })?;
            let file = writer.into_inner().map_err(|e| e.into_error())?;
            file.sync_all()?;
        }
        fs::rename(&tmp_path, &path)?;
        Ok(())
    }

    /// Load a job snapshot. Returns `Ok(None)` if missing or corrupt; a
    /// corrupt snapshot is rotated aside rather than surfaced as an error
    /// so a single bad file doesn't take down job listing.
    pub fn load(&self, job_id: &JobId) -> Result<Option<Job>, JobStoreError> {
        let path = self.path_for(job_id);
        if !path.exists() {
            return Ok(None);
        }
        let file = File::open(&path)?;
        let reader = BufReader::new(file);
        match serde_json::from_reader::<_, JobSnapshot>(reader) {
            Ok(snapshot) => Ok(Some(snapshot.job)),
            Err(e) => {
                let bak = path.with_extension("bak");
                warn!(error = %e, path = %path.display(), "corrupt job snapshot, rotating aside");
                fs::rename(&path, &bak)?;
                Ok(None)
            }
        }
    }

    pub fn delete(&self, job_id: &JobId) -> Result<(), JobStoreError> {
        let path = self.path_for(job_id);
        if path.exists() {
            fs::remove_file(path)?;
        }
        Ok(())
    }

    /// List every job currently on disk.
    pub fn list(&self) -> Result<Vec<Job>, JobStoreError> {
        let mut jobs = Vec::new();
        for entry in fs::read_dir(&self.root)? {
            let entry = entry?;
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let file = File::open(&path)?;
            let reader = BufReader::new(file);
            if let Ok(snapshot) = serde_json::from_reader::<_, JobSnapshot>(reader) {
                jobs.push(snapshot.job);
            }
        }
        Ok(jobs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn save_then_load_round_trips_a_job() {
        let dir = tempdir().unwrap();
        let store = JobStore::new(dir.path()).unwrap();
        let job = Job::new(JobId::new("job-1"), "/repo", 0);
        store.save(&job).unwrap();
        let loaded = store.load(&job.id).unwrap().unwrap();
        assert_eq!(loaded.id, job.id);
        assert_eq!(loaded.repo_path, "/repo");
    }

    #[test]
    fn load_returns_none_for_missing_job() {
        let dir = tempdir().unwrap();
        let store = JobStore::new(dir.path()).unwrap();
        assert!(store.load(&JobId::new("missing")).unwrap().is_none());
    }

    #[test]
    fn delete_removes_the_snapshot() {
        let dir = tempdir().unwrap();
        let store = JobStore::new(dir.path()).unwrap();
        let job = Job::new(JobId::new("job-1"), "/repo", 0);
        store.save(&job).unwrap();
        store.delete(&job.id).unwrap();
        assert!(store.load(&job.id).unwrap().is_none());
    }

    #[test]
    fn list_returns_every_saved_job() {
        let dir = tempdir().unwrap();
        let store = JobStore::new(dir.path()).unwrap();
        store.save(&Job::new(JobId::new("a"), "/repo-a", 0)).unwrap();
        store.save(&Job::new(JobId::new("b"), "/repo-b", 0)).unwrap();
        let mut jobs = store.list().unwrap();
        jobs.sort_by(|a, b| a.id.as_str().cmp(b.id.as_str()));
        assert_eq!(jobs.len(), 2);
        assert_eq!(jobs[0].id.as_str(), "a");
    }

    #[test]
    fn corrupt_snapshot_is_rotated_aside_not_surfaced_as_error() {
        let dir = tempdir().unwrap();
        let store = JobStore::new(dir.path()).unwrap();
        let job_id = JobId::new("job-1");
        fs::write(store.path_for(&job_id), b"not json").unwrap();
        assert!(store.load(&job_id).unwrap().is_none());
        assert!(store.path_for(&job_id).with_extension("bak").exists());
    }
}
