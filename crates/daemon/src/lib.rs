// SPDX-License-Identifier: MIT

// Allow panic!/unwrap/expect in test code
#![cfg_attr(test, allow(clippy::panic))]
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! codestory-daemon: the long-running process that owns the
//! `PipelineOrchestrator` and exposes it over a Unix-domain socket.
//!
//! - `protocol`: the length-prefixed JSON wire format and request/response
//!   types.
//! - `progress_bus`: job-scoped pub/sub fan-out of `ProgressEvent`s.
//! - `listener`: the accept loop and per-connection dispatch.
//! - `bootstrap`: wires configuration into a runnable `Listener`.

pub mod listener;
pub mod progress_bus;
pub mod protocol;

pub use listener::{ConnectionError, ListenCtx, Listener};
pub use progress_bus::ProgressBus;
pub use protocol::{ProtocolError, Request, RequestError, RequestedStep, Response};

use codestory_core::SystemClock;
use codestory_engine::{
    OrchestratorConfig, PipelineConfig, PipelineOrchestrator, StepClassConfig, StepRegistry,
};
use codestory_graph::{GraphError, GraphStore, Neo4jConfig, Neo4jGraphStore};
use codestory_steps::{AstTool, DockerAstTool, HttpLlmClient, LlmClient, LlmConfig};
use codestory_storage::{EventLogRegistry, JobStore, JobStoreError};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Concrete orchestrator type this daemon drives: real wall-clock time
/// everywhere outside of tests.
pub type Orchestrator = PipelineOrchestrator<SystemClock>;

#[derive(Debug, Error)]
pub enum DaemonError {
    #[error("graph connection failed: {0}")]
    Graph(#[from] GraphError),
    #[error("job store error: {0}")]
    JobStore(#[from] JobStoreError),
    #[error("daemon io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("orchestrator error: {0}")]
    Orchestrator(#[from] codestory_core::CoreError),
}

/// Everything `bootstrap` needs beyond the parsed pipeline configuration.
#[derive(Debug, Clone)]
pub struct DaemonConfig {
    pub socket_path: PathBuf,
    pub data_dir: PathBuf,
    pub pipeline: PipelineConfig,
    pub llm: LlmConfig,
    pub progress_bus_capacity: usize,
    pub event_log_ttl: Duration,
}

/// Build every durable/in-memory component and bind the listening socket,
/// restoring any previously persisted jobs before accepting connections.
/// Does not start serving; call `Listener::run` on the result.
pub async fn bootstrap(config: DaemonConfig) -> Result<Listener, DaemonError> {
    let job_store = JobStore::new(config.data_dir.join("jobs"))?;
    let event_log = EventLogRegistry::new(config.data_dir.join("events"), config.event_log_ttl);
    let progress_bus = Arc::new(ProgressBus::new(config.progress_bus_capacity));

    let graph_config = &config.pipeline.graph;
    let graph: Arc<dyn GraphStore> = Arc::new(
        Neo4jGraphStore::connect(Neo4jConfig {
            uri: graph_config.uri.clone(),
            user: graph_config.user.clone(),
            password: graph_config.password.clone(),
            database: graph_config.database.clone(),
            retry: codestory_core::RetryPolicy::new(
                5,
                Duration::from_millis(200),
                2.0,
            ),
        })
        .await?,
    );
    graph.initialize_schema(false).await?;

    let ast_tool: Arc<dyn AstTool> = Arc::new(DockerAstTool);
    let llm: Arc<dyn LlmClient> = Arc::new(HttpLlmClient::new(config.llm.clone()));
    let registry: StepRegistry =
        codestory_steps::register_default_steps(StepRegistry::builder(), ast_tool, llm).build();

    let orchestrator_config = orchestrator_config_from_pipeline(&config.pipeline);

    let sink_bus = progress_bus.clone();
    let orchestrator: Orchestrator = PipelineOrchestrator::new(
        registry,
        graph,
        job_store,
        event_log,
        Arc::new(codestory_core::UuidIdGen),
        SystemClock,
        orchestrator_config,
        Arc::new(move |event| sink_bus.publish(event)),
    );
    orchestrator.load_persisted_jobs()?;

    let ctx = Arc::new(ListenCtx { orchestrator, progress_bus });
    Ok(Listener::bind(&config.socket_path, ctx)?)
}

fn orchestrator_config_from_pipeline(pipeline: &PipelineConfig) -> OrchestratorConfig {
    let step_classes = pipeline
        .steps
        .iter()
        .map(|s| StepClassConfig {
            name: s.name.clone(),
            concurrency: s.concurrency.unwrap_or(1),
        })
        .collect();
    OrchestratorConfig {
        step_classes,
        default_concurrency: 1,
        fail_fast: pipeline.retry.fail_fast,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use codestory_engine::{GraphConfig, RetryConfig};

    fn pipeline_with(steps: Vec<codestory_engine::StepConfig>, fail_fast: bool) -> PipelineConfig {
        PipelineConfig {
            steps,
            retry: RetryConfig { max_retries: None, back_off_seconds: None, fail_fast },
            graph: GraphConfig {
                uri: "bolt://localhost:7687".to_string(),
                user: "neo4j".to_string(),
                password: "x".to_string(),
                database: None,
                pool_size: 10,
                connection_timeout_seconds: 10,
                max_retry_time_seconds: 30,
            },
        }
    }

    #[test]
    fn maps_step_concurrency_and_fail_fast_from_pipeline_config() {
        let pipeline = pipeline_with(
            vec![codestory_engine::StepConfig {
                name: "summarizer".to_string(),
                concurrency: Some(5),
                max_retries: None,
                back_off_seconds: None,
                timeout_seconds: None,
                params: Default::default(),
            }],
            false,
        );
        let config = orchestrator_config_from_pipeline(&pipeline);
        assert!(!config.fail_fast);
        assert_eq!(config.step_classes[0].concurrency, 5);
    }

    #[test]
    fn defaults_unset_concurrency_to_one() {
        let pipeline = pipeline_with(
            vec![codestory_engine::StepConfig {
                name: "filesystem".to_string(),
                concurrency: None,
                max_retries: None,
                back_off_seconds: None,
                timeout_seconds: None,
                params: Default::default(),
            }],
            true,
        );
        let config = orchestrator_config_from_pipeline(&pipeline);
        assert_eq!(config.step_classes[0].concurrency, 1);
    }
}
