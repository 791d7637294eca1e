// SPDX-License-Identifier: MIT

//! `PipelineOrchestrator`: the stateful core driving job and step state
//! machines — a clock-generic runtime holding shared state behind a lock,
//! with one background task per in-flight job rather than a single global
//! event loop, since steps here are independent async units rather than
//! one process watcher.

use crate::registry::StepRegistry;
use crate::scheduler::{ready_steps, steps_to_skip};
use crate::step::{ProgressReporter, SharedState, Step, StepContext, StepOutcome, StepParams};
use crate::worker_pool::WorkerPool;
use codestory_core::{
    Clock, CoreError, ErrorKind, ErrorRecord, IdGen, Job, JobId, JobState, Progress,
    ProgressEvent, ProgressKind, RetryPolicy, SequenceCounter, StepStatusKind,
};
use codestory_graph::GraphStore;
use codestory_storage::{EventLogRegistry, JobStore};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Hard deadline after a cooperative cancellation request before the
/// orchestrator force-finalizes a job regardless of step cooperation.
const CANCEL_HARD_DEADLINE: Duration = Duration::from_secs(30);

/// Callback the orchestrator publishes every [`ProgressEvent`] through; the
/// daemon's `ProgressBus` (or a test harness) is the subscriber on the
/// other end. Kept as a plain callback rather than a channel so the
/// orchestrator doesn't need to know about subscriber lifecycles.
pub type ProgressSink = Arc<dyn Fn(ProgressEvent) + Send + Sync>;

enum StepCompletion {
    Succeeded,
    Failed(ErrorRecord),
    Cancelled,
}

/// Per-job configuration resolved at submit time (merge precedence: step
/// defaults < pipeline config file < per-job request).
#[derive(Debug, Clone)]
pub struct StepClassConfig {
    pub name: String,
    pub concurrency: usize,
}

#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    pub step_classes: Vec<StepClassConfig>,
    pub default_concurrency: usize,
    /// Whether any step failure fails the whole job outright, cancelling
    /// unrelated in-flight steps, versus only failing the steps downstream
    /// of the failure.
    pub fail_fast: bool,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            step_classes: vec![
                StepClassConfig { name: "filesystem".to_string(), concurrency: 1 },
                StepClassConfig { name: "ast".to_string(), concurrency: 1 },
                StepClassConfig { name: "summarizer".to_string(), concurrency: 4 },
                StepClassConfig { name: "docgrapher".to_string(), concurrency: 1 },
            ],
            default_concurrency: 1,
            fail_fast: true,
        }
    }
}

/// Drives every submitted job's DAG to completion, owning durable state
/// (via [`JobStore`] / [`EventLogRegistry`]) and in-memory materialized
/// state (`jobs`) behind a `Mutex`.
pub struct PipelineOrchestrator<C: Clock + 'static> {
    registry: Arc<StepRegistry>,
    graph: Arc<dyn GraphStore>,
    job_store: Arc<JobStore>,
    event_log: Arc<Mutex<EventLogRegistry>>,
    worker_pool: Arc<WorkerPool>,
    id_gen: Arc<dyn IdGen>,
    clock: C,
    config: OrchestratorConfig,
    jobs: Arc<Mutex<HashMap<JobId, Job>>>,
    cancellations: Arc<Mutex<HashMap<JobId, CancellationToken>>>,
    progress_sink: ProgressSink,
}

impl<C: Clock + 'static> Clone for PipelineOrchestrator<C> {
    fn clone(&self) -> Self {
        Self {
            registry: self.registry.clone(),
            graph: self.graph.clone(),
            job_store: self.job_store.clone(),
            event_log: self.event_log.clone(),
            worker_pool: self.worker_pool.clone(),
            id_gen: self.id_gen.clone(),
            clock: self.clock.clone(),
            config: self.config.clone(),
            jobs: self.jobs.clone(),
            cancellations: self.cancellations.clone(),
            progress_sink: self.progress_sink.clone(),
        }
    }
}

impl<C: Clock + 'static> PipelineOrchestrator<C> {
    pub fn new(
        registry: StepRegistry,
        graph: Arc<dyn GraphStore>,
        job_store: JobStore,
        event_log: EventLogRegistry,
        id_gen: Arc<dyn IdGen>,
        clock: C,
        config: OrchestratorConfig,
        progress_sink: ProgressSink,
    ) -> Self {
        let caps = config
            .step_classes
            .iter()
            .map(|c| (c.name.clone(), c.concurrency))
            .collect();
        Self {
            registry: Arc::new(registry),
            graph,
            job_store: Arc::new(job_store),
            event_log: Arc::new(Mutex::new(event_log)),
            worker_pool: Arc::new(WorkerPool::new(caps, config.default_concurrency)),
            id_gen,
            clock,
            config,
            jobs: Arc::new(Mutex::new(HashMap::new())),
            cancellations: Arc::new(Mutex::new(HashMap::new())),
            progress_sink,
        }
    }

    /// Restore previously-persisted jobs into memory (e.g. on daemon
    /// startup); non-terminal jobs loaded this way stay exactly as
    /// recorded, since resuming an in-flight run after a crash is out of
    /// scope.
    pub fn load_persisted_jobs(&self) -> Result<(), CoreError> {
        let jobs = self
            .job_store
            .list()
            .map_err(|e| CoreError::InvalidPipeline(format!("failed to load jobs: {e}")))?;
        let mut guard = self.jobs.lock();
        for job in jobs {
            guard.insert(job.id.clone(), job);
        }
        Ok(())
    }

    /// Submit a new job for the given `repo_path` and requested steps with
    /// their per-job parameters.
    pub fn submit(
        &self,
        repo_path: impl Into<String>,
        requested: Vec<(String, StepParams)>,
    ) -> Result<JobId, CoreError> {
        let deps = self.registry.validate(&requested)?;
        let now = self.clock.epoch_ms();
        let mut job = Job::new(JobId::new(self.id_gen.next()), repo_path, now);
        let mut params_by_step = HashMap::new();
        for (name, params) in requested {
            let step_deps = deps.get(&name).cloned().unwrap_or_default();
            job.add_step(&name, step_deps);
            params_by_step.insert(name, params);
        }
        job.state = JobState::Running;

        if let Err(e) = self.job_store.save(&job) {
            warn!(job_id = %job.id, error = %e, "failed to persist initial job snapshot");
        }

        let cancellation = CancellationToken::new();
        self.cancellations.lock().insert(job.id.clone(), cancellation.clone());
        self.jobs.lock().insert(job.id.clone(), job.clone());
        self.publish_job_event(&job.id, JobState::Running);

        let orchestrator = self.clone();
        let job_id = job.id.clone();
        tokio::spawn(async move {
            orchestrator.drive_job(job_id, params_by_step, cancellation).await;
        });

        Ok(job.id)
    }

    pub fn get_job(&self, job_id: &JobId) -> Option<Job> {
        self.jobs.lock().get(job_id).cloned()
    }

    pub fn list_jobs(&self) -> Vec<Job> {
        self.jobs.lock().values().cloned().collect()
    }

    /// Replay durably persisted progress events for a job, in order, for
    /// everything after `since_sequence` (per `(job_id, step_name)` lane).
    /// Used to serve a resubscribing subscriber without loss within TTL.
    pub fn replay_events(&self, job_id: &JobId, since_sequence: u64) -> Vec<ProgressEvent> {
        self.event_log
            .lock()
            .replay(job_id.as_str(), since_sequence)
            .unwrap_or_default()
    }

    /// Request cancellation of a job. Cooperative: steps observe
    /// `ctx.is_cancelled()` and exit; any step still running after
    /// [`CANCEL_HARD_DEADLINE`] is force-marked `Cancelled` regardless.
    pub fn cancel(&self, job_id: &JobId) -> Result<(), CoreError> {
        let job = self
            .jobs
            .lock()
            .get(job_id)
            .cloned()
            .ok_or_else(|| CoreError::NotFound(job_id.to_string()))?;
        if job.state.is_terminal() {
            return Err(CoreError::AlreadyTerminal(job_id.to_string()));
        }
        let token = self
            .cancellations
            .lock()
            .get(job_id)
            .cloned()
            .ok_or_else(|| CoreError::NotFound(job_id.to_string()))?;
        token.cancel();

        let orchestrator = self.clone();
        let job_id = job_id.clone();
        tokio::spawn(async move {
            tokio::time::sleep(CANCEL_HARD_DEADLINE).await;
            orchestrator.force_cancel_if_still_active(&job_id);
        });
        Ok(())
    }

    fn force_cancel_if_still_active(&self, job_id: &JobId) {
        let now = self.clock.epoch_ms();
        let mut jobs = self.jobs.lock();
        let Some(job) = jobs.get_mut(job_id) else { return };
        if job.state.is_terminal() {
            return;
        }
        for state in job.step_states.values_mut() {
            if !state.status.is_terminal() {
                state.status = StepStatusKind::Cancelled;
                state.finished_at_ms = Some(now);
            }
        }
        job.state = JobState::Cancelled;
        job.finished_at_ms = Some(now);
        if let Err(e) = self.job_store.save(job) {
            warn!(job_id = %job_id, error = %e, "failed to persist force-cancelled job");
        }
        warn!(job_id = %job_id, "cancel hard deadline reached, force-finalized job");
    }

    async fn drive_job(
        &self,
        job_id: JobId,
        params_by_step: HashMap<String, StepParams>,
        cancellation: CancellationToken,
    ) {
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel::<(String, StepCompletion)>();
        let shared_state = SharedState::new();
        let sequences: Arc<Mutex<HashMap<String, SequenceCounter>>> =
            Arc::new(Mutex::new(HashMap::new()));
        let mut dispatched: HashSet<String> = HashSet::new();

        loop {
            let (newly_ready, done) = self.dispatch_ready_and_check_done(&job_id, &mut dispatched);
            if done {
                break;
            }
            for name in newly_ready {
                self.spawn_step_attempt(
                    job_id.clone(),
                    name,
                    params_by_step.clone(),
                    cancellation.clone(),
                    shared_state.clone(),
                    sequences.clone(),
                    tx.clone(),
                );
            }

            let Some((step_name, completion)) = rx.recv().await else {
                break;
            };
            self.apply_completion(&job_id, &step_name, completion, &cancellation);
        }

        self.persist(&job_id);
    }

    /// Recompute readiness, mark steps `Skipped`/`Ready`, and report every
    /// step newly promoted to `Ready` this tick (so the caller spawns each
    /// attempt exactly once) plus whether the job has reached a terminal
    /// state.
    // Allow expect here: `steps_to_skip`/`ready_steps` only ever return
    // names drawn from `job.step_states`, so the lookups below cannot miss.
    #[allow(clippy::expect_used)]
    fn dispatch_ready_and_check_done(
        &self,
        job_id: &JobId,
        dispatched: &mut HashSet<String>,
    ) -> (Vec<String>, bool) {
        let mut jobs = self.jobs.lock();
        let Some(job) = jobs.get_mut(job_id) else { return (Vec::new(), true) };
        if job.state.is_terminal() {
            return (Vec::new(), true);
        }

        for name in steps_to_skip(job) {
            let state = job.step_states.get_mut(&name).expect("skip candidate exists");
            if state.status != StepStatusKind::Skipped {
                state.status = StepStatusKind::Skipped;
                state.finished_at_ms = Some(self.clock.epoch_ms());
            }
        }

        let mut newly_ready = Vec::new();
        for name in ready_steps(job) {
            if dispatched.insert(name.clone()) {
                job.step_states.get_mut(&name).expect("ready candidate exists").status =
                    StepStatusKind::Ready;
                newly_ready.push(name);
            }
        }

        if job.all_steps_terminal() {
            job.state = if job.any_step_failed() {
                JobState::Failed
            } else if job.state == JobState::Cancelled {
                JobState::Cancelled
            } else {
                JobState::Succeeded
            };
            job.finished_at_ms = Some(self.clock.epoch_ms());
            let state = job.state;
            drop(jobs);
            self.publish_job_event(job_id, state);
            return (newly_ready, true);
        }
        (newly_ready, false)
    }

    fn spawn_step_attempt(
        &self,
        job_id: JobId,
        step_name: String,
        params_by_step: HashMap<String, StepParams>,
        cancellation: CancellationToken,
        shared_state: SharedState,
        sequences: Arc<Mutex<HashMap<String, SequenceCounter>>>,
        tx: tokio::sync::mpsc::UnboundedSender<(String, StepCompletion)>,
    ) {
        let orchestrator = self.clone();
        tokio::spawn(async move {
            let params = params_by_step.get(&step_name).cloned().unwrap_or_default();
            let repo_path = orchestrator
                .get_job(&job_id)
                .map(|j| j.repo_path)
                .unwrap_or_default();

            orchestrator.mark_running(&job_id, &step_name);

            let permit = orchestrator.worker_pool.acquire(&step_name).await;
            let outcome = orchestrator
                .run_with_retries(
                    &job_id,
                    &step_name,
                    &repo_path,
                    &params,
                    &cancellation,
                    &shared_state,
                    &sequences,
                )
                .await;
            drop(permit);

            let _ = tx.send((step_name, outcome));
        });
    }

    async fn run_with_retries(
        &self,
        job_id: &JobId,
        step_name: &str,
        repo_path: &str,
        params: &StepParams,
        cancellation: &CancellationToken,
        shared_state: &SharedState,
        sequences: &Arc<Mutex<HashMap<String, SequenceCounter>>>,
    ) -> StepCompletion {
        let mut attempts: u32 = 0;
        loop {
            attempts += 1;
            let Some(step) = self.registry.create(step_name) else {
                return StepCompletion::Failed(
                    ErrorRecord::new(ErrorKind::InvalidPipeline, format!("unknown step: {step_name}"))
                        .with_step(step_name),
                );
            };
            let retry_policy = step.retry_policy();
            let timeout = step.timeout();

            sequences.lock().entry(step_name.to_string()).or_insert_with(SequenceCounter::new).reset();
            self.publish_step_event(job_id, step_name, ProgressKind::StepStarted, sequences);
            self.record_attempt(job_id, step_name, attempts);

            let reporter = self.progress_reporter(job_id.clone(), step_name.to_string(), sequences.clone());
            let ctx = StepContext::new(
                job_id.clone(),
                repo_path.to_string(),
                params.clone(),
                self.graph.clone(),
                cancellation.clone(),
                shared_state.clone(),
                reporter,
            );

            let outcome = self.run_step_once(step, ctx, cancellation, timeout).await;

            match outcome {
                StepOutcome::Succeeded => {
                    self.publish_step_event(job_id, step_name, ProgressKind::StepSucceeded, sequences);
                    return StepCompletion::Succeeded;
                }
                StepOutcome::Cancelled => {
                    self.publish_step_event(
                        job_id,
                        step_name,
                        ProgressKind::StepCancelled { abandoned: false },
                        sequences,
                    );
                    return StepCompletion::Cancelled;
                }
                StepOutcome::Failed(err) => {
                    let can_retry = err.is_retryable()
                        && !retry_policy.exhausted(attempts)
                        && !cancellation.is_cancelled();
                    if can_retry {
                        let seed = seed_for(job_id, step_name, attempts);
                        let delay = retry_policy.jittered_backoff(attempts, seed);
                        warn!(job = %job_id, step = step_name, attempts, delay_ms = delay.as_millis() as u64, "retrying step after transient failure");
                        tokio::select! {
                            _ = tokio::time::sleep(delay) => {}
                            _ = cancellation.cancelled() => {
                                self.publish_step_event(
                                    job_id,
                                    step_name,
                                    ProgressKind::StepCancelled { abandoned: false },
                                    sequences,
                                );
                                return StepCompletion::Cancelled;
                            }
                        }
                        continue;
                    }
                    self.publish_step_event(
                        job_id,
                        step_name,
                        ProgressKind::StepFailed { error: err.clone() },
                        sequences,
                    );
                    return StepCompletion::Failed(err);
                }
            }
        }
    }

    async fn run_step_once(
        &self,
        step: Box<dyn crate::step::Step>,
        ctx: StepContext,
        cancellation: &CancellationToken,
        timeout: Option<Duration>,
    ) -> StepOutcome {
        if cancellation.is_cancelled() {
            return StepOutcome::Cancelled;
        }
        let run_fut = step.run(ctx);
        let timed = async {
            match timeout {
                Some(d) => match tokio::time::timeout(d, run_fut).await {
                    Ok(outcome) => outcome,
                    Err(_) => StepOutcome::Failed(ErrorRecord::new(
                        ErrorKind::TimeoutError,
                        format!("step exceeded its {:?} timeout", d),
                    )),
                },
                None => run_fut.await,
            }
        };
        tokio::select! {
            outcome = timed => outcome,
            _ = cancellation.cancelled() => StepOutcome::Cancelled,
        }
    }

    fn progress_reporter(
        &self,
        job_id: JobId,
        step_name: String,
        sequences: Arc<Mutex<HashMap<String, SequenceCounter>>>,
    ) -> ProgressReporter {
        let orchestrator = self.clone();
        Arc::new(move |progress: Progress| {
            orchestrator.publish_step_event(
                &job_id,
                &step_name,
                ProgressKind::StepProgress { progress },
                &sequences,
            );
        })
    }

    fn mark_running(&self, job_id: &JobId, step_name: &str) {
        let now = self.clock.epoch_ms();
        let mut jobs = self.jobs.lock();
        if let Some(job) = jobs.get_mut(job_id) {
            if let Some(state) = job.step_states.get_mut(step_name) {
                state.status = StepStatusKind::Running;
                state.started_at_ms = Some(now);
            }
        }
    }

    fn record_attempt(&self, job_id: &JobId, step_name: &str, attempts: u32) {
        let mut jobs = self.jobs.lock();
        if let Some(job) = jobs.get_mut(job_id) {
            if let Some(state) = job.step_states.get_mut(step_name) {
                state.attempts = attempts;
            }
        }
    }

    fn apply_completion(
        &self,
        job_id: &JobId,
        step_name: &str,
        completion: StepCompletion,
        job_cancellation: &CancellationToken,
    ) {
        let now = self.clock.epoch_ms();
        let mut failed = false;
        {
            let mut jobs = self.jobs.lock();
            if let Some(job) = jobs.get_mut(job_id) {
                if let Some(state) = job.step_states.get_mut(step_name) {
                    state.finished_at_ms = Some(now);
                    match &completion {
                        StepCompletion::Succeeded => state.status = StepStatusKind::Succeeded,
                        StepCompletion::Cancelled => state.status = StepStatusKind::Cancelled,
                        StepCompletion::Failed(err) => {
                            state.status = StepStatusKind::Failed;
                            state.error = Some(err.clone());
                            job.last_error = Some(err.clone().with_step(step_name));
                            failed = true;
                        }
                    }
                }
                job.touch(now);
            }
        }
        self.persist(job_id);

        if failed && self.config.fail_fast {
            info!(job = %job_id, step = step_name, "fail-fast: cancelling remaining steps after failure");
            job_cancellation.cancel();
            let mut jobs = self.jobs.lock();
            if let Some(job) = jobs.get_mut(job_id) {
                // Steps already `Running` are left alone here: the shared
                // cancellation token just cancelled above will make their own
                // attempt task resolve to `Cancelled` and report back through
                // `apply_completion`. Forcing them to `Skipped` here too would
                // race that completion and double-write the step's status.
                for (name, state) in job.step_states.iter_mut() {
                    if name != step_name
                        && !state.status.is_terminal()
                        && state.status != StepStatusKind::Running
                    {
                        state.status = StepStatusKind::Skipped;
                        state.finished_at_ms = Some(now);
                    }
                }
            }
        }
    }

    fn persist(&self, job_id: &JobId) {
        let snapshot = self.jobs.lock().get(job_id).cloned();
        if let Some(job) = snapshot {
            if let Err(e) = self.job_store.save(&job) {
                warn!(job_id = %job_id, error = %e, "failed to persist job snapshot");
            }
        }
    }

    fn publish_job_event(&self, job_id: &JobId, state: JobState) {
        let seq = 0; // job-level events aren't scoped to a (job, step) sequence lane
        let event = ProgressEvent::job(job_id.clone(), seq, self.clock.epoch_ms(), state);
        self.emit(job_id, event);
    }

    fn publish_step_event(
        &self,
        job_id: &JobId,
        step_name: &str,
        kind: ProgressKind,
        sequences: &Arc<Mutex<HashMap<String, SequenceCounter>>>,
    ) {
        let seq = sequences
            .lock()
            .entry(step_name.to_string())
            .or_insert_with(SequenceCounter::new)
            .next();
        let event = ProgressEvent::step(job_id.clone(), step_name, seq, self.clock.epoch_ms(), kind);
        self.emit(job_id, event);
    }

    fn emit(&self, job_id: &JobId, event: ProgressEvent) {
        if let Err(e) = self.event_log.lock().append(job_id.as_str(), event.clone()) {
            warn!(job_id = %job_id, error = %e, "failed to append progress event");
        }
        (self.progress_sink)(event);
    }
}

fn seed_for(job_id: &JobId, step_name: &str, attempt: u32) -> u64 {
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    job_id.as_str().hash(&mut hasher);
    step_name.hash(&mut hasher);
    attempt.hash(&mut hasher);
    hasher.finish()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::StepRegistry;
    use crate::step::Step;
    use async_trait::async_trait;
    use codestory_core::{ErrorKind, FakeClock, SequentialIdGen};
    use codestory_graph::InMemoryGraphStore;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration as StdDuration;

    struct AlwaysSucceeds(&'static str, Vec<&'static str>);

    #[async_trait]
    impl Step for AlwaysSucceeds {
        fn name(&self) -> &str {
            self.0
        }
        fn declared_dependencies(&self, _: &StepParams) -> HashSet<String> {
            self.1.iter().map(|s| s.to_string()).collect()
        }
        async fn run(&self, _ctx: StepContext) -> StepOutcome {
            StepOutcome::Succeeded
        }
    }

    struct AlwaysFails(&'static str);

    #[async_trait]
    impl Step for AlwaysFails {
        fn name(&self) -> &str {
            self.0
        }
        fn declared_dependencies(&self, _: &StepParams) -> HashSet<String> {
            HashSet::new()
        }
        async fn run(&self, _ctx: StepContext) -> StepOutcome {
            StepOutcome::Failed(ErrorRecord::new(ErrorKind::ExternalToolError, "boom"))
        }
        fn retry_policy(&self) -> RetryPolicy {
            RetryPolicy::new(1, StdDuration::from_millis(1), 1.0)
        }
    }

    struct SucceedsOnSecondAttempt(AtomicU32);

    #[async_trait]
    impl Step for SucceedsOnSecondAttempt {
        fn name(&self) -> &str {
            "flaky"
        }
        fn declared_dependencies(&self, _: &StepParams) -> HashSet<String> {
            HashSet::new()
        }
        async fn run(&self, _ctx: StepContext) -> StepOutcome {
            if self.0.fetch_add(1, Ordering::SeqCst) == 0 {
                StepOutcome::Failed(ErrorRecord::new(ErrorKind::TransientGraphError, "retry me"))
            } else {
                StepOutcome::Succeeded
            }
        }
        fn retry_policy(&self) -> RetryPolicy {
            RetryPolicy::new(3, StdDuration::from_millis(1), 1.0)
        }
    }

    struct WaitsForCancellation;

    #[async_trait]
    impl Step for WaitsForCancellation {
        fn name(&self) -> &str {
            "slow"
        }
        fn declared_dependencies(&self, _: &StepParams) -> HashSet<String> {
            HashSet::new()
        }
        async fn run(&self, ctx: StepContext) -> StepOutcome {
            ctx.cancellation.cancelled().await;
            StepOutcome::Cancelled
        }
    }

    fn harness(
        registry: StepRegistry,
        fail_fast: bool,
    ) -> (PipelineOrchestrator<FakeClock>, Arc<Mutex<Vec<ProgressEvent>>>, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let job_store = JobStore::new(dir.path().join("jobs")).unwrap();
        let event_log = EventLogRegistry::new(dir.path().join("events"), StdDuration::from_secs(3600));
        let events = Arc::new(Mutex::new(Vec::new()));
        let sink_events = events.clone();
        let config = OrchestratorConfig {
            step_classes: vec![],
            default_concurrency: 4,
            fail_fast,
        };
        let orchestrator = PipelineOrchestrator::new(
            registry,
            Arc::new(InMemoryGraphStore::new()),
            job_store,
            event_log,
            Arc::new(SequentialIdGen::new("job")),
            FakeClock::new(1_000),
            config,
            Arc::new(move |event: ProgressEvent| sink_events.lock().push(event)),
        );
        (orchestrator, events, dir)
    }

    async fn wait_for_terminal<C: Clock + 'static>(orchestrator: &PipelineOrchestrator<C>, job_id: &JobId) -> Job {
        for _ in 0..200 {
            if let Some(job) = orchestrator.get_job(job_id) {
                if job.state.is_terminal() {
                    return job;
                }
            }
            tokio::time::sleep(StdDuration::from_millis(10)).await;
        }
        panic!("job did not reach a terminal state in time");
    }

    #[tokio::test]
    async fn happy_path_runs_every_step_to_success() {
        let registry = StepRegistry::builder()
            .register("filesystem", || Box::new(AlwaysSucceeds("filesystem", vec![])) as Box<dyn Step>)
            .register("ast", || {
                Box::new(AlwaysSucceeds("ast", vec!["filesystem"])) as Box<dyn Step>
            })
            .build();
        let (orchestrator, events, _dir) = harness(registry, true);
        let job_id = orchestrator
            .submit("/repo", vec![("filesystem".into(), StepParams::new()), ("ast".into(), StepParams::new())])
            .unwrap();
        let job = wait_for_terminal(&orchestrator, &job_id).await;
        assert_eq!(job.state, JobState::Succeeded);
        assert!(events.lock().iter().any(|e| matches!(e.kind, ProgressKind::JobStateChanged { state: JobState::Succeeded })));
    }

    #[tokio::test]
    async fn failing_step_fails_the_job_and_skips_unrelated_steps() {
        let registry = StepRegistry::builder()
            .register("filesystem", || Box::new(AlwaysFails("filesystem")) as Box<dyn Step>)
            .register("other", || Box::new(AlwaysSucceeds("other", vec![])) as Box<dyn Step>)
            .build();
        let (orchestrator, _events, _dir) = harness(registry, true);
        let job_id = orchestrator
            .submit("/repo", vec![("filesystem".into(), StepParams::new()), ("other".into(), StepParams::new())])
            .unwrap();
        let job = wait_for_terminal(&orchestrator, &job_id).await;
        assert_eq!(job.state, JobState::Failed);
    }

    #[tokio::test]
    async fn dependent_step_is_skipped_when_its_dependency_fails() {
        let registry = StepRegistry::builder()
            .register("filesystem", || Box::new(AlwaysFails("filesystem")) as Box<dyn Step>)
            .register("ast", || {
                Box::new(AlwaysSucceeds("ast", vec!["filesystem"])) as Box<dyn Step>
            })
            .build();
        let (orchestrator, _events, _dir) = harness(registry, false);
        let job_id = orchestrator
            .submit("/repo", vec![("filesystem".into(), StepParams::new()), ("ast".into(), StepParams::new())])
            .unwrap();
        let job = wait_for_terminal(&orchestrator, &job_id).await;
        assert_eq!(job.state, JobState::Failed);
        assert_eq!(job.step_states["ast"].status, StepStatusKind::Skipped);
    }

    #[tokio::test]
    async fn transient_failure_is_retried_until_success() {
        let flaky = Arc::new(AtomicU32::new(0));
        let registry = StepRegistry::builder()
            .register("flaky", move || {
                Box::new(SucceedsOnSecondAttempt(AtomicU32::new(flaky.load(Ordering::SeqCst))))
                    as Box<dyn Step>
            })
            .build();
        let (orchestrator, _events, _dir) = harness(registry, true);
        let job_id = orchestrator.submit("/repo", vec![("flaky".into(), StepParams::new())]).unwrap();
        let job = wait_for_terminal(&orchestrator, &job_id).await;
        assert_eq!(job.state, JobState::Succeeded);
        assert_eq!(job.step_states["flaky"].attempts, 2);
    }

    #[tokio::test]
    async fn cancel_marks_a_waiting_step_cancelled() {
        let registry = StepRegistry::builder()
            .register("slow", || Box::new(WaitsForCancellation) as Box<dyn Step>)
            .build();
        let (orchestrator, _events, _dir) = harness(registry, true);
        let job_id = orchestrator.submit("/repo", vec![("slow".into(), StepParams::new())]).unwrap();
        tokio::time::sleep(StdDuration::from_millis(20)).await;
        orchestrator.cancel(&job_id).unwrap();
        let job = wait_for_terminal(&orchestrator, &job_id).await;
        assert_eq!(job.state, JobState::Cancelled);
    }

    #[tokio::test]
    async fn cancelling_an_already_terminal_job_is_an_error() {
        let registry = StepRegistry::builder()
            .register("filesystem", || Box::new(AlwaysSucceeds("filesystem", vec![])) as Box<dyn Step>)
            .build();
        let (orchestrator, _events, _dir) = harness(registry, true);
        let job_id = orchestrator.submit("/repo", vec![("filesystem".into(), StepParams::new())]).unwrap();
        let _ = wait_for_terminal(&orchestrator, &job_id).await;
        assert!(matches!(orchestrator.cancel(&job_id), Err(CoreError::AlreadyTerminal(_))));
    }
}
