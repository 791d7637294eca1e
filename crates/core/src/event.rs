// SPDX-License-Identifier: MIT

//! The single normalized `ProgressEvent` schema, used as both the
//! in-process `ProgressBus` wire format and the persisted progress log
//! entry.

use crate::error::ErrorRecord;
use crate::id::JobId;
use crate::job::{JobState, Progress};
use serde::{Deserialize, Serialize};

/// Kind of progress event.
///
/// Serializes as `{"type": "step_started", ...}`, matching the
/// tagged-enum convention the rest of the corpus uses for wire events.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ProgressKind {
    StepStarted,
    StepProgress { progress: Progress },
    StepSucceeded,
    StepFailed { error: ErrorRecord },
    StepCancelled { abandoned: bool },
    JobStateChanged { state: JobState },
}

/// A single progress event.
///
/// `sequence` is strictly increasing within `(job_id, step_name)`; across
/// steps within a job only the timestamp is guaranteed monotone per
/// publisher.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressEvent {
    pub job_id: JobId,
    /// `None` for job-level events (e.g. `JobStateChanged`) that are not
    /// scoped to a single step.
    pub step_name: Option<String>,
    pub sequence: u64,
    pub timestamp_ms: u64,
    pub kind: ProgressKind,
}

impl ProgressEvent {
    pub fn step(
        job_id: JobId,
        step_name: impl Into<String>,
        sequence: u64,
        timestamp_ms: u64,
        kind: ProgressKind,
    ) -> Self {
        Self {
            job_id,
            step_name: Some(step_name.into()),
            sequence,
            timestamp_ms,
            kind,
        }
    }

    pub fn job(job_id: JobId, sequence: u64, timestamp_ms: u64, state: JobState) -> Self {
        Self {
            job_id,
            step_name: None,
            sequence,
            timestamp_ms,
            kind: ProgressKind::JobStateChanged { state },
        }
    }
}

/// Per-`(job_id, step_name)` strictly-increasing sequence counter.
///
/// The orchestrator owns one of these per step; it resets to 0 (with a
/// fresh `StepStarted` event) on retry.
#[derive(Debug, Default)]
pub struct SequenceCounter(u64);

impl SequenceCounter {
    pub fn new() -> Self {
        Self(0)
    }

    pub fn next(&mut self) -> u64 {
        let seq = self.0;
        self.0 += 1;
        seq
    }

    pub fn reset(&mut self) {
        self.0 = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sequence_counter_is_strictly_increasing() {
        let mut counter = SequenceCounter::new();
        assert_eq!(counter.next(), 0);
        assert_eq!(counter.next(), 1);
        assert_eq!(counter.next(), 2);
    }

    #[test]
    fn sequence_counter_resets_on_retry() {
        let mut counter = SequenceCounter::new();
        counter.next();
        counter.next();
        counter.reset();
        assert_eq!(counter.next(), 0);
    }

    #[test]
    fn progress_event_round_trips_through_json() {
        let event = ProgressEvent::step(
            JobId::new("job-1"),
            "filesystem",
            0,
            1000,
            ProgressKind::StepProgress {
                progress: Progress::new(0.5, "250/500 files"),
            },
        );
        let json = serde_json::to_string(&event).unwrap();
        let back: ProgressEvent = serde_json::from_str(&json).unwrap();
        assert_eq!(event, back);
        assert!(json.contains("\"type\":\"step_progress\""));
    }
}
