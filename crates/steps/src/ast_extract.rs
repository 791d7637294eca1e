// SPDX-License-Identifier: MIT

//! `ASTExtractStep`: runs a containerized parser against the checked-out
//! repository and turns its structured stdout stream into `Module`/
//! `Class`/`Function` nodes and `Imports`/`Calls`/`InheritsFrom`/`Defines`
//! edges. Depends on `filesystem` so the directory tree already exists to
//! attach nodes to.
//!
//! The actual subprocess is behind the `AstTool` trait the same way the
//! teacher puts `tokio::process::Command` behind its own adapters rather
//! than calling it inline from step logic: it keeps the untestable part
//! (spawning a real container) swappable for a fake in tests.

use crate::errors::classify_graph_error;
use async_trait::async_trait;
use codestory_core::{ErrorKind, ErrorRecord, Progress};
use codestory_engine::{Step, StepContext, StepOutcome, StepParams};
use codestory_graph::{
    edge_row, module_identity, named_in_module, EdgeLabel, EdgeSpec, NodeLabel, PropertyBag, Row,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashSet;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;

const DEFAULT_IMAGE: &str = "codestory/ast-extract:latest";
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(300);

/// The `shared_state` key `ASTExtractStep` publishes its parsed records
/// under, so later steps in the same job can read them directly instead
/// of re-deriving them from the graph.
pub const SHARED_STATE_KEY: &str = "ast.records";

/// One line of the tool's structured stdout stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AstRecord {
    Module { name: String, path: String },
    Class { name: String, module: String, #[serde(default)] inherits_from: Vec<String> },
    Function {
        name: String,
        module: String,
        #[serde(default)] defined_in_class: Option<String>,
        #[serde(default)] calls: Vec<String>,
    },
    Import { module: String, imports: String },
}

/// Result of a single extraction run.
pub struct AstOutput {
    pub records: Vec<AstRecord>,
}

/// Adapter over the external AST-extraction tool. `run` streams progress
/// lines through `on_log` as they arrive so the step can surface them as
/// step progress without buffering the whole run in memory.
#[async_trait]
pub trait AstTool: Send + Sync {
    async fn run(
        &self,
        repo_path: &str,
        image: &str,
        timeout: Duration,
        on_log: Arc<dyn Fn(String) + Send + Sync>,
    ) -> Result<AstOutput, ErrorRecord>;
}

/// Spawns `docker run --rm -v <repo>:/repo:ro <image>` and parses each
/// stdout line as one JSON-encoded `AstRecord`; lines that aren't valid
/// records (banner output, warnings) are forwarded as plain progress logs
/// instead of failing the run.
pub struct DockerAstTool;

#[async_trait]
impl AstTool for DockerAstTool {
    async fn run(
        &self,
        repo_path: &str,
        image: &str,
        timeout: Duration,
        on_log: Arc<dyn Fn(String) + Send + Sync>,
    ) -> Result<AstOutput, ErrorRecord> {
        let mut cmd = Command::new("docker");
        cmd.args(["run", "--rm", "-v", &format!("{repo_path}:/repo:ro"), image]);
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());

        let mut child = cmd.spawn().map_err(|err| {
            ErrorRecord::new(ErrorKind::ExternalToolError, format!("failed to spawn docker: {err}"))
        })?;

        let stdout = match child.stdout.take() {
            Some(stdout) => stdout,
            None => {
                return Err(ErrorRecord::new(
                    ErrorKind::ExternalToolError,
                    "docker child process had no stdout pipe",
                ))
            }
        };
        let mut lines = BufReader::new(stdout).lines();
        let mut records = Vec::new();

        let read_loop = async {
            while let Ok(Some(line)) = lines.next_line().await {
                match serde_json::from_str::<AstRecord>(&line) {
                    Ok(record) => records.push(record),
                    Err(_) => on_log(line),
                }
            }
        };

        match tokio::time::timeout(timeout, read_loop).await {
            Ok(()) => {}
            Err(_) => {
                let _ = child.kill().await;
                return Err(ErrorRecord::new(
                    ErrorKind::TimeoutError,
                    format!("ast extraction timed out after {}s", timeout.as_secs()),
                ));
            }
        }

        let status = child.wait().await.map_err(|err| {
            ErrorRecord::new(ErrorKind::ExternalToolError, format!("failed to wait for docker: {err}"))
        })?;

        if !status.success() {
            return Err(ErrorRecord::new(
                ErrorKind::ExternalToolError,
                format!("ast extraction container exited with {status}"),
            ));
        }

        Ok(AstOutput { records })
    }
}

/// Canned, deterministic stand-in for `DockerAstTool` used by this crate's
/// own tests and by downstream integration tests that need an
/// `ASTExtractStep` without a real container runtime.
#[cfg(any(test, feature = "test-support"))]
pub struct FakeAstTool {
    pub records: Vec<AstRecord>,
}

#[cfg(any(test, feature = "test-support"))]
#[async_trait]
impl AstTool for FakeAstTool {
    async fn run(
        &self,
        _repo_path: &str,
        _image: &str,
        _timeout: Duration,
        on_log: Arc<dyn Fn(String) + Send + Sync>,
    ) -> Result<AstOutput, ErrorRecord> {
        on_log("fake ast tool: starting".to_string());
        Ok(AstOutput { records: self.records.clone() })
    }
}

pub struct ASTExtractStep {
    tool: Arc<dyn AstTool>,
}

impl ASTExtractStep {
    pub fn new(tool: Arc<dyn AstTool>) -> Self {
        Self { tool }
    }
}

impl Default for ASTExtractStep {
    fn default() -> Self {
        Self::new(Arc::new(DockerAstTool))
    }
}

fn image(params: &StepParams) -> String {
    params
        .get("image")
        .and_then(Value::as_str)
        .map(str::to_string)
        .unwrap_or_else(|| DEFAULT_IMAGE.to_string())
}

/// Duration to pass down to the tool adapter so it can bound its own
/// subprocess read loop and kill the container promptly on expiry. Clamped
/// to `DEFAULT_TIMEOUT` so a job can ask for less time than the orchestrator
/// allows, never more — the orchestrator's own `Step::timeout()` wrap is
/// always the outer, authoritative deadline.
fn timeout(params: &StepParams) -> Duration {
    let requested = params
        .get("timeout_seconds")
        .and_then(Value::as_u64)
        .map(Duration::from_secs)
        .unwrap_or(DEFAULT_TIMEOUT);
    requested.min(DEFAULT_TIMEOUT)
}

#[async_trait]
impl Step for ASTExtractStep {
    fn name(&self) -> &str {
        "ast"
    }

    fn declared_dependencies(&self, _params: &StepParams) -> HashSet<String> {
        HashSet::from(["filesystem".to_string()])
    }

    fn timeout(&self) -> Option<Duration> {
        Some(DEFAULT_TIMEOUT)
    }

    async fn run(&self, ctx: StepContext) -> StepOutcome {
        let image = image(&ctx.params);
        let timeout = timeout(&ctx.params);

        let on_log: Arc<dyn Fn(String) + Send + Sync> = {
            let progress = ctx.progress_reporter();
            let lines_seen = std::sync::atomic::AtomicU64::new(0);
            Arc::new(move |line: String| {
                let n = lines_seen.fetch_add(1, std::sync::atomic::Ordering::SeqCst) + 1;
                progress(Progress::new(0.0, format!("[{n}] {line}")));
            })
        };

        let output = match self.tool.run(&ctx.repo_path, &image, timeout, on_log).await {
            Ok(output) => output,
            Err(err) => return StepOutcome::Failed(err.with_step(self.name())),
        };

        if ctx.is_cancelled() {
            return StepOutcome::Cancelled;
        }

        if let Err(outcome) = write_records(&ctx, &output.records).await {
            return outcome;
        }

        if let Ok(value) = serde_json::to_value(&output.records) {
            ctx.shared_state.set(SHARED_STATE_KEY, value);
        }

        ctx.report_progress(Progress::new(1.0, format!("{} records", output.records.len())));
        StepOutcome::Succeeded
    }
}

/// Resolves a bare or `module::name` reference (as found in
/// `inherits_from`/`calls`) to the `(name, module)` pair its defining
/// record carries, the same ambiguity rule `summarizer` uses: an
/// unqualified name defined in more than one module is left unresolved
/// rather than guessed at.
#[derive(Default)]
struct NameIndex {
    qualified: std::collections::HashMap<String, (String, String)>,
    bare: std::collections::HashMap<String, Option<(String, String)>>,
}

impl NameIndex {
    fn record(&mut self, name: &str, module: &str) {
        self.qualified.insert(format!("{module}::{name}"), (name.to_string(), module.to_string()));
        self.bare
            .entry(name.to_string())
            .and_modify(|existing| *existing = None)
            .or_insert_with(|| Some((name.to_string(), module.to_string())));
    }

    fn resolve(&self, raw: &str) -> Option<(String, String)> {
        if let Some(pair) = self.qualified.get(raw) {
            return Some(pair.clone());
        }
        self.bare.get(raw).and_then(|v| v.clone())
    }
}

async fn write_records(ctx: &StepContext, records: &[AstRecord]) -> Result<(), StepOutcome> {
    let mut names = NameIndex::default();
    for record in records {
        match record {
            AstRecord::Class { name, module, .. } => names.record(name, module),
            AstRecord::Function { name, module, .. } => names.record(name, module),
            AstRecord::Module { .. } | AstRecord::Import { .. } => {}
        }
    }

    let mut modules = Vec::new();
    let mut classes = Vec::new();
    let mut functions = Vec::new();
    let mut inherits_edges = Vec::new();
    let mut defines_class_edges = Vec::new();
    let mut defines_fn_edges = Vec::new();
    let mut calls_edges = Vec::new();
    let mut import_edges = Vec::new();

    for record in records {
        match record {
            AstRecord::Module { name, path } => {
                let mut row = Row::new();
                row.insert("name".into(), Value::String(name.clone()));
                row.insert("path".into(), Value::String(path.clone()));
                modules.push(row);
            }
            AstRecord::Class { name, module, inherits_from } => {
                let mut row = Row::new();
                row.insert("name".into(), Value::String(name.clone()));
                row.insert("module".into(), Value::String(module.clone()));
                classes.push(row);

                defines_class_edges.push(edge_row(
                    module_identity(module),
                    named_in_module(name, module),
                    PropertyBag::new(),
                ));

                for base in inherits_from {
                    if let Some((base_name, base_module)) = names.resolve(base) {
                        inherits_edges.push(edge_row(
                            named_in_module(name, module),
                            named_in_module(&base_name, &base_module),
                            PropertyBag::new(),
                        ));
                    }
                }
            }
            AstRecord::Function { name, module, defined_in_class, calls } => {
                let mut row = Row::new();
                row.insert("name".into(), Value::String(name.clone()));
                row.insert("module".into(), Value::String(module.clone()));
                functions.push(row);

                let definer = defined_in_class
                    .as_ref()
                    .map(|class| named_in_module(class, module))
                    .unwrap_or_else(|| module_identity(module));
                defines_fn_edges.push(edge_row(
                    definer,
                    named_in_module(name, module),
                    PropertyBag::new(),
                ));

                for callee in calls {
                    if let Some((callee_name, callee_module)) = names.resolve(callee) {
                        calls_edges.push(edge_row(
                            named_in_module(name, module),
                            named_in_module(&callee_name, &callee_module),
                            PropertyBag::new(),
                        ));
                    }
                }
            }
            AstRecord::Import { module, imports } => {
                import_edges.push(edge_row(
                    module_identity(module),
                    module_identity(imports),
                    PropertyBag::new(),
                ));
            }
        }
    }

    upsert(ctx, NodeLabel::Module, modules).await?;
    upsert(ctx, NodeLabel::Class, classes).await?;
    upsert(ctx, NodeLabel::Function, functions).await?;

    upsert_edges(ctx, EdgeLabel::Defines, NodeLabel::Module, NodeLabel::Class, defines_class_edges).await?;
    upsert_edges(ctx, EdgeLabel::Defines, NodeLabel::Module, NodeLabel::Function, defines_fn_edges).await?;
    upsert_edges(ctx, EdgeLabel::InheritsFrom, NodeLabel::Class, NodeLabel::Class, inherits_edges).await?;
    upsert_edges(ctx, EdgeLabel::Calls, NodeLabel::Function, NodeLabel::Function, calls_edges).await?;
    upsert_edges(ctx, EdgeLabel::Imports, NodeLabel::Module, NodeLabel::Module, import_edges).await?;
    Ok(())
}

async fn upsert(ctx: &StepContext, label: NodeLabel, rows: Vec<Row>) -> Result<(), StepOutcome> {
    if rows.is_empty() {
        return Ok(());
    }
    ctx.graph
        .upsert_nodes(label, rows)
        .await
        .map(|_| ())
        .map_err(|err| StepOutcome::Failed(classify_graph_error("ast", err)))
}

async fn upsert_edges(
    ctx: &StepContext,
    label: EdgeLabel,
    from_label: NodeLabel,
    to_label: NodeLabel,
    rows: Vec<Row>,
) -> Result<(), StepOutcome> {
    if rows.is_empty() {
        return Ok(());
    }
    let spec = EdgeSpec { label, from_label, to_label };
    ctx.graph
        .upsert_edges(spec, rows)
        .await
        .map(|_| ())
        .map_err(|err| StepOutcome::Failed(classify_graph_error("ast", err)))
}
