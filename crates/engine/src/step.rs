// SPDX-License-Identifier: MIT

//! The `Step` contract steps implement and the per-run `StepContext` the
//! orchestrator hands them.

use async_trait::async_trait;
use codestory_core::{ErrorRecord, Job, JobId, Progress, RetryPolicy};
use codestory_graph::GraphStore;
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Merged step parameters (precedence: step defaults < pipeline-config
/// file < per-job request).
pub type StepParams = HashMap<String, Value>;

/// A callback a step invokes to report progress.
///
/// Boxed so `StepContext` can hand out a concrete, cloneable type without
/// steps needing to know about the orchestrator's internal publisher.
pub type ProgressReporter = Arc<dyn Fn(Progress) + Send + Sync>;

/// Job-scoped key-value area for inter-step handoff.
#[derive(Debug, Default, Clone)]
pub struct SharedState {
    inner: Arc<Mutex<HashMap<String, Value>>>,
}

impl SharedState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<Value> {
        self.inner.lock().get(key).cloned()
    }

    pub fn set(&self, key: impl Into<String>, value: Value) {
        self.inner.lock().insert(key.into(), value);
    }
}

/// Everything a step needs to do its work.
pub struct StepContext {
    pub job_id: JobId,
    pub repo_path: String,
    pub params: StepParams,
    pub graph: Arc<dyn GraphStore>,
    pub cancellation: CancellationToken,
    pub shared_state: SharedState,
    progress: ProgressReporter,
}

impl StepContext {
    pub fn new(
        job_id: JobId,
        repo_path: impl Into<String>,
        params: StepParams,
        graph: Arc<dyn GraphStore>,
        cancellation: CancellationToken,
        shared_state: SharedState,
        progress: ProgressReporter,
    ) -> Self {
        Self {
            job_id,
            repo_path: repo_path.into(),
            params,
            graph,
            cancellation,
            shared_state,
            progress,
        }
    }

    pub fn report_progress(&self, progress: Progress) {
        (self.progress)(progress);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancellation.is_cancelled()
    }

    /// A cloneable handle to the progress callback, for steps that need to
    /// hand progress reporting to a spawned task or an adapter that can't
    /// borrow `StepContext` itself (e.g. a streaming subprocess reader).
    pub fn progress_reporter(&self) -> ProgressReporter {
        self.progress.clone()
    }
}

/// Terminal result of a single step attempt.
#[derive(Debug, Clone)]
pub enum StepOutcome {
    Succeeded,
    Failed(ErrorRecord),
    Cancelled,
}

/// An estimate used only for progress smoothing, never for scheduling
/// decisions.
#[derive(Debug, Clone, Copy)]
pub struct WorkHint {
    pub estimated_units: u64,
}

/// A unit of ingestion work with declared dependencies.
#[async_trait]
pub trait Step: Send + Sync {
    fn name(&self) -> &str;

    /// Names of steps this step requires to have succeeded, resolved
    /// against the job's requested steps.
    fn declared_dependencies(&self, params: &StepParams) -> HashSet<String>;

    async fn run(&self, ctx: StepContext) -> StepOutcome;

    fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::default()
    }

    /// Per-step timeout; `None` means no timeout.
    fn timeout(&self) -> Option<std::time::Duration> {
        None
    }

    fn estimate(&self, _ctx: &StepContext) -> Option<WorkHint> {
        None
    }
}

/// Builds a fresh [`Step`] instance per run.
pub trait StepFactory: Send + Sync {
    fn create(&self) -> Box<dyn Step>;
}

impl<F> StepFactory for F
where
    F: Fn() -> Box<dyn Step> + Send + Sync,
{
    fn create(&self) -> Box<dyn Step> {
        self()
    }
}

/// Read-only accessor steps use when they need to inspect the job they're
/// running inside (e.g. which sibling steps are also requested).
pub fn requested_step_names(job: &Job) -> Vec<String> {
    job.requested_steps.clone()
}
