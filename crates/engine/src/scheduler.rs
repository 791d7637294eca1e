// SPDX-License-Identifier: MIT

//! Pure DAG-readiness computation. Kept free of I/O and task-spawning so
//! it can be unit tested without a runtime, the same separation kept
//! between this module (pure bookkeeping) and the orchestrator (the task
//! that actually drives effects).

use codestory_core::{Job, StepStatusKind};

/// Steps whose dependencies are all `Succeeded` and that are still
/// `Pending`, in dispatch order: stable by `requested_steps` order, then
/// lexicographic by name.
pub fn ready_steps(job: &Job) -> Vec<String> {
    let mut ready: Vec<String> = job
        .requested_steps
        .iter()
        .filter(|name| {
            job.step_states
                .get(*name)
                .map(|s| s.status == StepStatusKind::Pending)
                .unwrap_or(false)
        })
        .filter(|name| {
            job.step_states[*name]
                .dependencies
                .iter()
                .all(|dep| {
                    job.step_states
                        .get(dep)
                        .map(|d| d.status == StepStatusKind::Succeeded)
                        .unwrap_or(false)
                })
        })
        .cloned()
        .collect();

    // requested_steps order is already the primary tie-break; apply the
    // secondary lexicographic rule only among steps that tied on identical
    // declared order (duplicates aren't expected, but keep it total).
    ready.sort_by(|a, b| {
        let pos_a = job.requested_steps.iter().position(|n| n == a);
        let pos_b = job.requested_steps.iter().position(|n| n == b);
        pos_a.cmp(&pos_b).then_with(|| a.cmp(b))
    });
    ready
}

/// Steps that must be force-transitioned to `Skipped` because a
/// dependency is terminally `Failed` or `Cancelled`.
pub fn steps_to_skip(job: &Job) -> Vec<String> {
    job.requested_steps
        .iter()
        .filter(|name| {
            job.step_states
                .get(*name)
                .map(|s| matches!(s.status, StepStatusKind::Pending | StepStatusKind::Ready))
                .unwrap_or(false)
        })
        .filter(|name| {
            job.step_states[*name].dependencies.iter().any(|dep| {
                job.step_states
                    .get(dep)
                    .map(|d| matches!(d.status, StepStatusKind::Failed | StepStatusKind::Cancelled | StepStatusKind::Skipped))
                    .unwrap_or(false)
            })
        })
        .cloned()
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use codestory_core::JobId;
    use std::collections::HashSet;

    fn deps(names: &[&str]) -> HashSet<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    fn sample_job() -> Job {
        let mut job = Job::new(JobId::new("job-1"), "/repo", 0);
        job.add_step("filesystem", deps(&[]));
        job.add_step("ast", deps(&["filesystem"]));
        job.add_step("docgrapher", deps(&["filesystem"]));
        job.add_step("summarizer", deps(&["filesystem", "ast"]));
        job
    }

    #[test]
    fn only_steps_with_no_unmet_dependencies_are_ready() {
        let job = sample_job();
        assert_eq!(ready_steps(&job), vec!["filesystem".to_string()]);
    }

    #[test]
    fn ready_order_follows_requested_steps_order() {
        let mut job = sample_job();
        job.step_states.get_mut("filesystem").unwrap().status = StepStatusKind::Succeeded;
        let ready = ready_steps(&job);
        assert_eq!(ready, vec!["ast".to_string(), "docgrapher".to_string()]);
    }

    #[test]
    fn failed_dependency_marks_dependents_for_skip() {
        let mut job = sample_job();
        job.step_states.get_mut("filesystem").unwrap().status = StepStatusKind::Succeeded;
        job.step_states.get_mut("ast").unwrap().status = StepStatusKind::Failed;
        let skip = steps_to_skip(&job);
        assert_eq!(skip, vec!["summarizer".to_string()]);
    }

    #[test]
    fn succeeded_step_is_never_re_marked_ready() {
        let mut job = sample_job();
        job.step_states.get_mut("filesystem").unwrap().status = StepStatusKind::Succeeded;
        assert!(!ready_steps(&job).contains(&"filesystem".to_string()));
    }
}
