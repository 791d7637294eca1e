// SPDX-License-Identifier: MIT

#![cfg_attr(test, allow(clippy::panic))]
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! codestory-engine: the DAG execution engine driving ingestion pipelines.
//!
//! - `step`: the `Step` trait contract and `StepContext` handed to each run.
//! - `registry`: discovers steps by name and validates the requested DAG.
//! - `config`: pipeline configuration file parsing (HCL steps + TOML graph
//!   connection settings).
//! - `scheduler`: pure DAG-readiness computation, no I/O.
//! - `worker_pool`: bounded per-step-class concurrency.
//! - `orchestrator`: the stateful runtime tying the above together.

pub mod config;
pub mod orchestrator;
pub mod registry;
pub mod scheduler;
pub mod step;
pub mod worker_pool;

pub use config::{ConfigError, GraphConfig, PipelineConfig, RetryConfig, StepConfig};
pub use orchestrator::{OrchestratorConfig, PipelineOrchestrator, ProgressSink, StepClassConfig};
pub use registry::{StepRegistry, StepRegistryBuilder};
pub use scheduler::{ready_steps, steps_to_skip};
pub use step::{
    ProgressReporter, SharedState, Step, StepContext, StepFactory, StepOutcome, StepParams,
    WorkHint,
};
pub use worker_pool::{WorkerPermit, WorkerPool};
