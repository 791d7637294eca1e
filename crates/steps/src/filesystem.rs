// SPDX-License-Identifier: MIT

//! `FilesystemStep`: walks the repository tree and writes `File`/`Directory`
//! nodes plus `Contains` edges. The first step in every pipeline, with no
//! declared dependencies.

use crate::errors::classify_graph_error;
use crate::hashing::{hash_bytes_with, HashAlgorithm};
use async_trait::async_trait;
use codestory_core::{ErrorKind, ErrorRecord, Progress};
use codestory_engine::{Step, StepContext, StepOutcome, StepParams};
use codestory_graph::{edge_row, path_identity, EdgeSpec, GraphError, NodeLabel, PropertyBag, Row};
use serde_json::Value;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Directories skipped during the walk unless a job overrides
/// `ignore_patterns`. Plain names double as globs that match themselves
/// exactly, so the defaults keep working unchanged under real matching.
const DEFAULT_IGNORE: &[&str] = &[
    ".git",
    "node_modules",
    "__pycache__",
    "target",
    ".venv",
    "venv",
    ".tox",
    "dist",
    "build",
];

/// Files larger than this are recorded without a `content` property; the
/// node still gets its path, size, and hash. Overridden per job by
/// `max_file_size_bytes`.
const DEFAULT_MAX_INLINE_CONTENT_BYTES: u64 = 1024 * 1024;

const DEFAULT_BATCH_SIZE: usize = 500;

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(600);

struct WalkedEntry {
    relative_path: String,
    name: String,
    parent_relative_path: Option<String>,
    is_dir: bool,
    extension: Option<String>,
    size: u64,
    content_hash: String,
    content: Option<String>,
}

pub struct FilesystemStep;

impl FilesystemStep {
    pub fn new() -> Self {
        Self
    }
}

impl Default for FilesystemStep {
    fn default() -> Self {
        Self::new()
    }
}

/// Parses the raw `ignore_patterns` strings into real globs. A pattern that
/// fails to parse is dropped rather than failing the job, but is reported
/// as step progress so a typo'd pattern doesn't silently stop excluding
/// anything.
fn ignore_patterns(ctx: &StepContext) -> Vec<glob::Pattern> {
    let raw: Vec<String> = match ctx.params.get("ignore_patterns") {
        Some(Value::Array(items)) => items
            .iter()
            .filter_map(|v| v.as_str().map(str::to_string))
            .collect(),
        _ => DEFAULT_IGNORE.iter().map(|s| s.to_string()).collect(),
    };
    raw.iter()
        .filter_map(|pattern| match glob::Pattern::new(pattern) {
            Ok(parsed) => Some(parsed),
            Err(err) => {
                ctx.report_progress(Progress::new(
                    0.0,
                    format!("ignoring malformed ignore_patterns entry {pattern:?}: {err}"),
                ));
                None
            }
        })
        .collect()
}

fn batch_size(params: &StepParams) -> usize {
    params
        .get("batch_size")
        .and_then(Value::as_u64)
        .map(|n| n as usize)
        .filter(|n| *n > 0)
        .unwrap_or(DEFAULT_BATCH_SIZE)
}

fn max_inline_content_bytes(params: &StepParams) -> u64 {
    params
        .get("max_file_size_bytes")
        .and_then(Value::as_u64)
        .unwrap_or(DEFAULT_MAX_INLINE_CONTENT_BYTES)
}

fn hash_algorithm(params: &StepParams) -> HashAlgorithm {
    params
        .get("hash_algorithm")
        .and_then(Value::as_str)
        .and_then(HashAlgorithm::parse)
        .unwrap_or_default()
}

/// A pattern matches either the entry's bare name (`*.log`) or its path
/// relative to the repo root (`build/**`), mirroring how a shell glob
/// matches a bare filename versus a path containing a separator.
fn is_ignored(name: &str, relative_path: &str, patterns: &[glob::Pattern]) -> bool {
    patterns
        .iter()
        .any(|pattern| pattern.matches(name) || pattern.matches(relative_path))
}

/// Walks `root` depth-first, collecting every file and directory that
/// survives `ignored`. Errors reading a subdirectory abort the whole walk:
/// a partially-ingested filesystem is worse than a failed job.
fn walk(
    root: &Path,
    ignored: &[glob::Pattern],
    max_inline_bytes: u64,
    algorithm: HashAlgorithm,
) -> std::io::Result<Vec<WalkedEntry>> {
    let mut out = Vec::new();
    let mut stack = vec![(root.to_path_buf(), None::<String>)];
    while let Some((dir, parent_relative)) = stack.pop() {
        let mut children: Vec<std::fs::DirEntry> = std::fs::read_dir(&dir)?.collect::<Result<_, _>>()?;
        children.sort_by_key(|e| e.file_name());
        for entry in children {
            let name = entry.file_name().to_string_lossy().into_owned();
            let path = entry.path();
            let relative_path = relative_to(root, &path);
            if is_ignored(&name, &relative_path, ignored) {
                continue;
            }
            let metadata = entry.metadata()?;
            if metadata.is_dir() {
                out.push(WalkedEntry {
                    relative_path: relative_path.clone(),
                    name: name.clone(),
                    parent_relative_path: parent_relative.clone(),
                    is_dir: true,
                    extension: None,
                    size: 0,
                    content_hash: hash_bytes_with(algorithm, relative_path.as_bytes()),
                    content: None,
                });
                stack.push((path, Some(relative_path)));
            } else if metadata.is_file() {
                let size = metadata.len();
                let bytes = std::fs::read(&path)?;
                let content_hash = hash_bytes_with(algorithm, &bytes);
                let content = if size <= max_inline_bytes {
                    Some(String::from_utf8_lossy(&bytes).into_owned())
                } else {
                    None
                };
                let extension = path
                    .extension()
                    .map(|ext| ext.to_string_lossy().into_owned());
                out.push(WalkedEntry {
                    relative_path,
                    name,
                    parent_relative_path: parent_relative.clone(),
                    is_dir: false,
                    extension,
                    size,
                    content_hash,
                    content,
                });
            }
        }
    }
    Ok(out)
}

fn relative_to(root: &Path, path: &Path) -> String {
    path.strip_prefix(root)
        .unwrap_or(path)
        .to_string_lossy()
        .replace('\\', "/")
}

fn entry_to_row(entry: &WalkedEntry) -> Row {
    let mut row = Row::new();
    row.insert("path".into(), Value::String(entry.relative_path.clone()));
    row.insert("name".into(), Value::String(entry.name.clone()));
    row.insert("content_hash".into(), Value::String(entry.content_hash.clone()));
    if !entry.is_dir {
        row.insert("size".into(), Value::from(entry.size));
        if let Some(ext) = &entry.extension {
            row.insert("extension".into(), Value::String(ext.clone()));
        }
        if let Some(content) = &entry.content {
            row.insert("content".into(), Value::String(content.clone()));
        }
    }
    row
}

#[async_trait]
impl Step for FilesystemStep {
    fn name(&self) -> &str {
        "filesystem"
    }

    fn declared_dependencies(&self, _params: &StepParams) -> HashSet<String> {
        HashSet::new()
    }

    fn timeout(&self) -> Option<Duration> {
        Some(DEFAULT_TIMEOUT)
    }

    async fn run(&self, ctx: StepContext) -> StepOutcome {
        let root = PathBuf::from(&ctx.repo_path);
        let ignored = ignore_patterns(&ctx);
        let max_inline_bytes = max_inline_content_bytes(&ctx.params);
        let algorithm = hash_algorithm(&ctx.params);

        let entries = match walk(&root, &ignored, max_inline_bytes, algorithm) {
            Ok(entries) => entries,
            Err(err) => {
                return StepOutcome::Failed(
                    ErrorRecord::new(ErrorKind::RepoNotAccessible, err.to_string())
                        .with_step(self.name()),
                );
            }
        };

        let total = entries.len().max(1);
        let batch = batch_size(&ctx.params);
        let mut processed = 0usize;

        for chunk in entries.chunks(batch) {
            if ctx.is_cancelled() {
                return StepOutcome::Cancelled;
            }

            let dir_rows: Vec<Row> = chunk.iter().filter(|e| e.is_dir).map(entry_to_row).collect();
            let file_rows: Vec<Row> = chunk.iter().filter(|e| !e.is_dir).map(entry_to_row).collect();

            if !dir_rows.is_empty() {
                if let Err(err) = ctx.graph.upsert_nodes(NodeLabel::Directory, dir_rows).await {
                    return StepOutcome::Failed(classify_graph_error(self.name(), err));
                }
            }
            if !file_rows.is_empty() {
                if let Err(err) = ctx.graph.upsert_nodes(NodeLabel::File, file_rows).await {
                    return StepOutcome::Failed(classify_graph_error(self.name(), err));
                }
            }

            if let Err(outcome) = write_contains_edges(&ctx, chunk).await {
                return outcome;
            }

            processed += chunk.len();
            ctx.report_progress(Progress::new(
                processed as f64 / total as f64,
                format!("{processed}/{total} entries"),
            ));
        }

        ctx.shared_state.set(
            "filesystem.file_count",
            Value::from(entries.iter().filter(|e| !e.is_dir).count() as u64),
        );

        StepOutcome::Succeeded
    }
}

async fn write_contains_edges(
    ctx: &StepContext,
    chunk: &[WalkedEntry],
) -> Result<(), StepOutcome> {
    let mut dir_to_dir = Vec::new();
    let mut dir_to_file = Vec::new();
    for entry in chunk {
        let Some(parent) = &entry.parent_relative_path else {
            continue;
        };
        let row = edge_row(path_identity(parent), path_identity(&entry.relative_path), PropertyBag::new());
        if entry.is_dir {
            dir_to_dir.push(row);
        } else {
            dir_to_file.push(row);
        }
    }

    if !dir_to_dir.is_empty() {
        let spec = EdgeSpec {
            label: codestory_graph::EdgeLabel::Contains,
            from_label: NodeLabel::Directory,
            to_label: NodeLabel::Directory,
        };
        ctx.graph
            .upsert_edges(spec, dir_to_dir)
            .await
            .map_err(|err: GraphError| StepOutcome::Failed(classify_graph_error("filesystem", err)))?;
    }
    if !dir_to_file.is_empty() {
        let spec = EdgeSpec {
            label: codestory_graph::EdgeLabel::Contains,
            from_label: NodeLabel::Directory,
            to_label: NodeLabel::File,
        };
        ctx.graph
            .upsert_edges(spec, dir_to_file)
            .await
            .map_err(|err: GraphError| StepOutcome::Failed(classify_graph_error("filesystem", err)))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use codestory_core::JobId;
    use codestory_engine::SharedState;
    use codestory_graph::InMemoryGraphStore;
    use std::sync::Arc;
    use tokio_util::sync::CancellationToken;

    fn ctx(repo_path: &str, graph: Arc<dyn codestory_graph::GraphStore>) -> StepContext {
        ctx_with_params(repo_path, graph, StepParams::new())
    }

    fn ctx_with_params(
        repo_path: &str,
        graph: Arc<dyn codestory_graph::GraphStore>,
        params: StepParams,
    ) -> StepContext {
        StepContext::new(
            JobId::new("job-1"),
            repo_path,
            params,
            graph,
            CancellationToken::new(),
            SharedState::new(),
            Arc::new(|_| {}),
        )
    }

    #[tokio::test]
    async fn walks_tree_and_writes_nodes_and_edges() {
        let dir = tempfile::tempdir().expect("tempdir");
        std::fs::create_dir(dir.path().join("src")).expect("mkdir");
        std::fs::write(dir.path().join("src/main.rs"), "fn main() {}").expect("write");
        std::fs::write(dir.path().join("README.md"), "hello").expect("write");

        let graph = Arc::new(InMemoryGraphStore::new());
        let step = FilesystemStep::new();
        let outcome = step.run(ctx(dir.path().to_str().unwrap(), graph.clone())).await;
        assert!(matches!(outcome, StepOutcome::Succeeded));

        let files = graph.nodes(NodeLabel::File);
        assert_eq!(files.len(), 2);
        let dirs = graph.nodes(NodeLabel::Directory);
        assert_eq!(dirs.len(), 1);
    }

    #[tokio::test]
    async fn ignored_directories_are_skipped() {
        let dir = tempfile::tempdir().expect("tempdir");
        std::fs::create_dir(dir.path().join("node_modules")).expect("mkdir");
        std::fs::write(dir.path().join("node_modules/pkg.js"), "x").expect("write");
        std::fs::write(dir.path().join("lib.rs"), "x").expect("write");

        let graph = Arc::new(InMemoryGraphStore::new());
        let step = FilesystemStep::new();
        step.run(ctx(dir.path().to_str().unwrap(), graph.clone())).await;

        let files = graph.nodes(NodeLabel::File);
        assert_eq!(files.len(), 1);
    }

    #[tokio::test]
    async fn glob_ignore_patterns_match_by_extension_and_subtree() {
        let dir = tempfile::tempdir().expect("tempdir");
        std::fs::write(dir.path().join("debug.log"), "x").expect("write");
        std::fs::create_dir(dir.path().join("build")).expect("mkdir");
        std::fs::write(dir.path().join("build/out.o"), "x").expect("write");
        std::fs::write(dir.path().join("lib.rs"), "x").expect("write");

        let mut params = StepParams::new();
        params.insert(
            "ignore_patterns".into(),
            Value::Array(vec![Value::String("*.log".into()), Value::String("build/**".into())]),
        );

        let graph = Arc::new(InMemoryGraphStore::new());
        let step = FilesystemStep::new();
        let outcome = step
            .run(ctx_with_params(dir.path().to_str().unwrap(), graph.clone(), params))
            .await;
        assert!(matches!(outcome, StepOutcome::Succeeded));

        let files: Vec<String> = graph
            .nodes(NodeLabel::File)
            .into_iter()
            .filter_map(|node| node.property("name").and_then(Value::as_str).map(str::to_string))
            .collect();
        assert_eq!(files, vec!["lib.rs".to_string()]);
    }

    #[tokio::test]
    async fn max_file_size_bytes_suppresses_inline_content_for_large_files() {
        let dir = tempfile::tempdir().expect("tempdir");
        std::fs::write(dir.path().join("big.txt"), "0123456789").expect("write");

        let mut params = StepParams::new();
        params.insert("max_file_size_bytes".into(), Value::from(4_u64));

        let graph = Arc::new(InMemoryGraphStore::new());
        let step = FilesystemStep::new();
        step.run(ctx_with_params(dir.path().to_str().unwrap(), graph.clone(), params))
            .await;

        let files = graph.nodes(NodeLabel::File);
        let file = files.first().expect("one file node");
        assert!(file.property("content").is_none());
    }

    #[tokio::test]
    async fn hash_algorithm_param_changes_the_stored_digest() {
        let dir = tempfile::tempdir().expect("tempdir");
        std::fs::write(dir.path().join("a.txt"), "hello").expect("write");

        let graph_sha = Arc::new(InMemoryGraphStore::new());
        FilesystemStep::new()
            .run(ctx(dir.path().to_str().unwrap(), graph_sha.clone()))
            .await;
        let sha_hash = graph_sha.nodes(NodeLabel::File)[0]
            .property("content_hash")
            .and_then(Value::as_str)
            .unwrap()
            .to_string();

        let mut params = StepParams::new();
        params.insert("hash_algorithm".into(), Value::String("blake3".into()));
        let graph_blake = Arc::new(InMemoryGraphStore::new());
        FilesystemStep::new()
            .run(ctx_with_params(dir.path().to_str().unwrap(), graph_blake.clone(), params))
            .await;
        let blake_hash = graph_blake.nodes(NodeLabel::File)[0]
            .property("content_hash")
            .and_then(Value::as_str)
            .unwrap()
            .to_string();

        assert_ne!(sha_hash, blake_hash);
    }

    #[tokio::test]
    async fn missing_repo_path_fails_with_repo_not_accessible() {
        let graph = Arc::new(InMemoryGraphStore::new());
        let step = FilesystemStep::new();
        let outcome = step.run(ctx("/no/such/path/anywhere", graph)).await;
        match outcome {
            StepOutcome::Failed(err) => assert_eq!(err.kind, ErrorKind::RepoNotAccessible),
            other => panic!("expected Failed, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn malformed_ignore_pattern_is_dropped_but_reported_as_progress() {
        let dir = tempfile::tempdir().expect("tempdir");
        std::fs::write(dir.path().join("lib.rs"), "x").expect("write");

        let mut params = StepParams::new();
        params.insert(
            "ignore_patterns".to_string(),
            Value::Array(vec![Value::String("[invalid".to_string())]),
        );

        let seen: Arc<std::sync::Mutex<Vec<String>>> = Arc::new(std::sync::Mutex::new(Vec::new()));
        let seen_for_cb = seen.clone();
        let ctx = StepContext::new(
            JobId::new("job-1"),
            dir.path().to_str().unwrap(),
            params,
            Arc::new(InMemoryGraphStore::new()),
            CancellationToken::new(),
            SharedState::new(),
            Arc::new(move |p: Progress| seen_for_cb.lock().unwrap().push(p.message)),
        );

        let step = FilesystemStep::new();
        let outcome = step.run(ctx).await;
        assert!(matches!(outcome, StepOutcome::Succeeded));
        assert!(seen.lock().unwrap().iter().any(|m| m.contains("[invalid")));
    }
}
