// SPDX-License-Identifier: MIT

//! Job and per-step state machines.

use crate::error::ErrorRecord;
use crate::id::JobId;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};

/// Overall job state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Pending,
    Running,
    Succeeded,
    Failed,
    Cancelled,
}

impl JobState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobState::Succeeded | JobState::Failed | JobState::Cancelled
        )
    }
}

impl std::fmt::Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            JobState::Pending => "pending",
            JobState::Running => "running",
            JobState::Succeeded => "succeeded",
            JobState::Failed => "failed",
            JobState::Cancelled => "cancelled",
        };
        write!(f, "{s}")
    }
}

/// Per-step status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatusKind {
    Pending,
    Ready,
    Running,
    Succeeded,
    Failed,
    Cancelled,
    Skipped,
}

impl StepStatusKind {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            StepStatusKind::Succeeded
                | StepStatusKind::Failed
                | StepStatusKind::Cancelled
                | StepStatusKind::Skipped
        )
    }
}

impl std::fmt::Display for StepStatusKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            StepStatusKind::Pending => "pending",
            StepStatusKind::Ready => "ready",
            StepStatusKind::Running => "running",
            StepStatusKind::Succeeded => "succeeded",
            StepStatusKind::Failed => "failed",
            StepStatusKind::Cancelled => "cancelled",
            StepStatusKind::Skipped => "skipped",
        };
        write!(f, "{s}")
    }
}

/// Monotone-nondecreasing progress within a step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Progress {
    /// In `[0, 1]`.
    pub fraction: f64,
    pub message: String,
    #[serde(default)]
    pub counters: HashMap<String, u64>,
}

impl Default for Progress {
    fn default() -> Self {
        Self {
            fraction: 0.0,
            message: String::new(),
            counters: HashMap::new(),
        }
    }
}

impl Progress {
    pub fn new(fraction: f64, message: impl Into<String>) -> Self {
        Self {
            fraction: fraction.clamp(0.0, 1.0),
            message: message.into(),
            counters: HashMap::new(),
        }
    }
}

/// State of a single step within a job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepState {
    pub name: String,
    pub status: StepStatusKind,
    pub attempts: u32,
    pub progress: Progress,
    pub dependencies: HashSet<String>,
    pub started_at_ms: Option<u64>,
    pub finished_at_ms: Option<u64>,
    pub error: Option<ErrorRecord>,
}

impl StepState {
    pub fn new(name: impl Into<String>, dependencies: HashSet<String>) -> Self {
        Self {
            name: name.into(),
            status: StepStatusKind::Pending,
            attempts: 0,
            progress: Progress::default(),
            dependencies,
            started_at_ms: None,
            finished_at_ms: None,
            error: None,
        }
    }
}

/// A single ingestion job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub repo_path: String,
    /// Order steps were requested in, for tie-breaking.
    pub requested_steps: Vec<String>,
    pub state: JobState,
    pub step_states: HashMap<String, StepState>,
    pub created_at_ms: u64,
    pub updated_at_ms: u64,
    pub finished_at_ms: Option<u64>,
    pub last_error: Option<ErrorRecord>,
}

impl Job {
    pub fn new(id: JobId, repo_path: impl Into<String>, now_ms: u64) -> Self {
        Self {
            id,
            repo_path: repo_path.into(),
            requested_steps: Vec::new(),
            state: JobState::Pending,
            step_states: HashMap::new(),
            created_at_ms: now_ms,
            updated_at_ms: now_ms,
            finished_at_ms: None,
            last_error: None,
        }
    }

    pub fn add_step(&mut self, name: impl Into<String>, dependencies: HashSet<String>) {
        let name = name.into();
        self.requested_steps.push(name.clone());
        self.step_states
            .insert(name.clone(), StepState::new(name, dependencies));
    }

    /// Invariant: `state` becomes terminal iff every step is in a
    /// terminal sub-state (or the job was cancelled outright).
    pub fn all_steps_terminal(&self) -> bool {
        self.step_states.values().all(|s| s.status.is_terminal())
    }

    pub fn any_step_failed(&self) -> bool {
        self.step_states
            .values()
            .any(|s| s.status == StepStatusKind::Failed)
    }

    pub fn all_steps_succeeded(&self) -> bool {
        self.step_states
            .values()
            .all(|s| s.status == StepStatusKind::Succeeded)
    }

    pub fn touch(&mut self, now_ms: u64) {
        self.updated_at_ms = now_ms;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    fn deps(names: &[&str]) -> HashSet<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn new_job_starts_pending_with_no_steps() {
        let job = Job::new(JobId::new("job-1"), "/repo", 0);
        assert_eq!(job.state, JobState::Pending);
        assert!(job.step_states.is_empty());
        assert!(job.all_steps_terminal()); // vacuously true
    }

    #[test]
    fn all_steps_terminal_false_while_any_step_running() {
        let mut job = Job::new(JobId::new("job-1"), "/repo", 0);
        job.add_step("filesystem", deps(&[]));
        job.add_step("ast", deps(&["filesystem"]));
        job.step_states.get_mut("filesystem").unwrap().status = StepStatusKind::Succeeded;
        job.step_states.get_mut("ast").unwrap().status = StepStatusKind::Running;
        assert!(!job.all_steps_terminal());
    }

    #[test]
    fn all_steps_terminal_true_once_all_resolved() {
        let mut job = Job::new(JobId::new("job-1"), "/repo", 0);
        job.add_step("filesystem", deps(&[]));
        job.step_states.get_mut("filesystem").unwrap().status = StepStatusKind::Succeeded;
        assert!(job.all_steps_terminal());
        assert!(job.all_steps_succeeded());
    }

    #[test]
    fn any_step_failed_detects_failure_even_if_others_still_running() {
        let mut job = Job::new(JobId::new("job-1"), "/repo", 0);
        job.add_step("filesystem", deps(&[]));
        job.add_step("docgrapher", deps(&["filesystem"]));
        job.step_states.get_mut("filesystem").unwrap().status = StepStatusKind::Failed;
        job.step_states.get_mut("docgrapher").unwrap().status = StepStatusKind::Running;
        assert!(job.any_step_failed());
        assert!(!job.all_steps_succeeded());
    }

    #[test]
    fn step_status_terminal_classification() {
        assert!(StepStatusKind::Succeeded.is_terminal());
        assert!(StepStatusKind::Skipped.is_terminal());
        assert!(!StepStatusKind::Ready.is_terminal());
        assert!(!StepStatusKind::Running.is_terminal());
    }

    #[test]
    fn progress_clamps_fraction_to_unit_interval() {
        let p = Progress::new(1.5, "overshoot");
        assert_eq!(p.fraction, 1.0);
        let p = Progress::new(-0.2, "undershoot");
        assert_eq!(p.fraction, 0.0);
    }
}
