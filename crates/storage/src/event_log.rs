// SPDX-License-Identifier: MIT

//! JSONL write-ahead log for `ProgressEvent`s, with group commit and
//! TTL-based trimming — a linear log of `ProgressEvent`s trimmed by TTL.
//!
//! Each entry is a single line of JSON: `{"job_id":"...","event":{...}}\n`.
//! Durability point is `flush()`; callers that need a `since_sequence`
//! resume replay via [`EventLog::replay`].

use codestory_core::ProgressEvent;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{self, BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use thiserror::Error;

const FLUSH_INTERVAL: Duration = Duration::from_millis(10);
const FLUSH_THRESHOLD: usize = 100;

#[derive(Debug, Error)]
pub enum EventLogError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

#[derive(Serialize, Deserialize)]
struct Record {
    event: ProgressEvent,
}

/// Append-only durable log of `ProgressEvent`s for one job, group-committed
/// the way a write-ahead log is, but scoped per job rather than to a
/// single global event stream — `sequence` is scoped to `(job_id,
/// step_name)` and events are queried per `job_id`.
pub struct EventLog {
    file: File,
    path: PathBuf,
    buffer: Vec<Vec<u8>>,
    last_flush: Instant,
}

impl EventLog {
    pub fn open(path: &Path) -> Result<Self, EventLogError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .append(true)
            .open(path)?;
        Ok(Self {
            file,
            path: path.to_owned(),
            buffer: Vec::new(),
            last_flush: Instant::now(),
        })
    }

    pub fn append(&mut self, event: ProgressEvent) -> Result<(), EventLogError> {
        let record = Record { event };
        let mut bytes = serde_json::to_vec(&record)?;
        bytes.push(b'\n');
        self.buffer.push(bytes);
        Ok(())
    }

    pub fn needs_flush(&self) -> bool {
        !self.buffer.is_empty()
            && (self.last_flush.elapsed() >= FLUSH_INTERVAL || self.buffer.len() >= FLUSH_THRESHOLD)
    }

    pub fn flush(&mut self) -> Result<(), EventLogError> {
        if self.buffer.is_empty() {
            return Ok(());
        }
        for bytes in self.buffer.drain(..) {
            self.file.write_all(&bytes)?;
        }
        self.file.sync_all()?;
        self.last_flush = Instant::now();
        Ok(())
    }

    /// Replay every durable event with `sequence > since_sequence`, in
    /// order, skipping any unparseable (corrupt) trailing line rather than
    /// failing the whole read.
    pub fn replay(path: &Path, since_sequence: u64) -> Result<Vec<ProgressEvent>, EventLogError> {
        let file = match File::open(path) {
            Ok(f) => f,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let reader = BufReader::new(file);
        let mut events = Vec::new();
        for line in reader.lines() {
            let line = line?;
            let trimmed = line.trim();
            if trimmed.is_empty() {
                continue;
            }
            match serde_json::from_str::<Record>(trimmed) {
                Ok(record) if record.event.sequence > since_sequence => events.push(record.event),
                Ok(_) => {}
                Err(_) => break,
            }
        }
        Ok(events)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// One `EventLog` per job, keyed by `job_id`, with TTL-based retention
/// (retained for a configurable TTL, default 1h).
pub struct EventLogRegistry {
    root: PathBuf,
    ttl: Duration,
    opened: HashMap<String, EventLog>,
}

impl EventLogRegistry {
    pub fn new(root: impl Into<PathBuf>, ttl: Duration) -> Self {
        Self {
            root: root.into(),
            ttl,
            opened: HashMap::new(),
        }
    }

    fn path_for(&self, job_id: &str) -> PathBuf {
        self.root.join(format!("{job_id}.jsonl"))
    }

    #[allow(clippy::expect_used)]
    pub fn append(&mut self, job_id: &str, event: ProgressEvent) -> Result<(), EventLogError> {
        if !self.opened.contains_key(job_id) {
            let path = self.path_for(job_id);
            let log = EventLog::open(&path)?;
            self.opened.insert(job_id.to_string(), log);
        }
        // The branch above guarantees `job_id` is present in `opened`.
        let log = self.opened.get_mut(job_id).expect("just inserted");
        log.append(event)?;
        if log.needs_flush() {
            log.flush()?;
        }
        Ok(())
    }

    pub fn flush_all(&mut self) -> Result<(), EventLogError> {
        for log in self.opened.values_mut() {
            log.flush()?;
        }
        Ok(())
    }

    pub fn replay(&self, job_id: &str, since_sequence: u64) -> Result<Vec<ProgressEvent>, EventLogError> {
        EventLog::replay(&self.path_for(job_id), since_sequence)
    }

    /// Remove logs for jobs whose last write is older than the TTL. The
    /// mtime of the file is used as the retention clock — the simplest
    /// mechanism consistent with a flat JSONL-per-job layout.
    pub fn trim_expired(&mut self, now: std::time::SystemTime) -> Result<(), EventLogError> {
        self.flush_all()?;
        self.opened.retain(|_, log| {
            let Ok(meta) = std::fs::metadata(log.path()) else {
                return false;
            };
            let Ok(modified) = meta.modified() else {
                return true;
            };
            now.duration_since(modified).map(|age| age < self.ttl).unwrap_or(true)
        });
        if let Ok(entries) = std::fs::read_dir(&self.root) {
            for entry in entries.flatten() {
                let path = entry.path();
                let Ok(meta) = entry.metadata() else { continue };
                let Ok(modified) = meta.modified() else { continue };
                let expired = now
                    .duration_since(modified)
                    .map(|age| age >= self.ttl)
                    .unwrap_or(false);
                if expired {
                    let _ = std::fs::remove_file(&path);
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use codestory_core::{JobId, ProgressKind};
    use tempfile::tempdir;

    fn event(job_id: &JobId, seq: u64) -> ProgressEvent {
        ProgressEvent::step(job_id.clone(), "filesystem", seq, 1000 + seq, ProgressKind::StepStarted)
    }

    #[test]
    fn append_and_flush_then_replay_round_trips() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("job-1.jsonl");
        let mut log = EventLog::open(&path).unwrap();
        let job_id = JobId::new("job-1");
        log.append(event(&job_id, 0)).unwrap();
        log.append(event(&job_id, 1)).unwrap();
        log.flush().unwrap();

        let replayed = EventLog::replay(&path, 0).unwrap();
        assert_eq!(replayed.len(), 1);
        assert_eq!(replayed[0].sequence, 1);
    }

    #[test]
    fn replay_stops_at_first_corrupt_line() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("job-1.jsonl");
        let mut log = EventLog::open(&path).unwrap();
        let job_id = JobId::new("job-1");
        log.append(event(&job_id, 0)).unwrap();
        log.flush().unwrap();
        {
            let mut file = OpenOptions::new().append(true).open(&path).unwrap();
            writeln!(file, "not json").unwrap();
        }
        let replayed = EventLog::replay(&path, 0).unwrap();
        assert_eq!(replayed.len(), 0); // seq 0 was already <= since_sequence=0
    }

    #[test]
    fn registry_scopes_logs_per_job() {
        let dir = tempdir().unwrap();
        let mut registry = EventLogRegistry::new(dir.path(), Duration::from_secs(3600));
        let job_a = JobId::new("a");
        let job_b = JobId::new("b");
        registry.append("a", event(&job_a, 0)).unwrap();
        registry.append("b", event(&job_b, 0)).unwrap();
        registry.flush_all().unwrap();

        assert_eq!(registry.replay("a", 0).unwrap().len(), 1);
        assert_eq!(registry.replay("b", 0).unwrap().len(), 1);
        assert_eq!(registry.replay("c", 0).unwrap().len(), 0);
    }
}
