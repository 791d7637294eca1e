// SPDX-License-Identifier: MIT

//! `DocGrapherStep`: parses README/`*.md`/`*.rst` documentation into
//! `Documentation` nodes and links the code identifiers and paths they
//! mention to existing graph nodes, falling back to a `DocumentationEntity`
//! stub when nothing matches closely enough.
//!
//! Only `filesystem` is a hard dependency — the step walks the repository
//! itself the same way `FilesystemStep` does rather than reading file
//! contents back out of the graph. When `ast`'s records are present in
//! shared state (job requested it), they widen the set of identifiers a
//! mention can resolve against; when absent, only path-shaped mentions
//! resolve, against `File`/`Directory` nodes.

mod matching;

use crate::ast_extract::{self, AstRecord};
use crate::errors::classify_graph_error;
use crate::hashing::hash_bytes;
use async_trait::async_trait;
use codestory_core::{ErrorKind, ErrorRecord, Progress};
use codestory_engine::{Step, StepContext, StepOutcome, StepParams};
use codestory_graph::{
    edge_row, module_identity, named_in_module, path_identity, EdgeLabel, EdgeSpec, NodeLabel,
    PropertyBag,
};
use llm::SummaryPrompt;
use pulldown_cmark::{Event, Parser};
use regex::Regex;
use serde_json::Value;
use std::collections::HashMap;
use std::path::{Path, PathBuf};

use crate::summarizer::llm;

const DEFAULT_FORMATS: &[&str] = &["md", "rst"];
const DEFAULT_FUZZY_THRESHOLD: f64 = 0.8;
const MAX_CONTEXT_CHARS: usize = 8_000;
const DEFAULT_IGNORE: &[&str] = &[".git", "node_modules", "__pycache__", "target", ".venv", "venv", ".tox", "dist", "build"];
const DEFAULT_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(600);

fn supported_formats(params: &StepParams) -> Vec<String> {
    match params.get("supported_formats") {
        Some(Value::Array(items)) => items.iter().filter_map(|v| v.as_str().map(str::to_lowercase)).collect(),
        _ => DEFAULT_FORMATS.iter().map(|s| s.to_string()).collect(),
    }
}

fn fuzzy_threshold(params: &StepParams) -> f64 {
    params.get("fuzzy_threshold").and_then(Value::as_f64).unwrap_or(DEFAULT_FUZZY_THRESHOLD)
}

fn enabled(params: &StepParams) -> bool {
    params.get("enabled").and_then(Value::as_bool).unwrap_or(true)
}

struct DocFile {
    relative_path: String,
    content: String,
    is_markdown: bool,
}

fn is_readme(name: &str) -> bool {
    name.to_lowercase().starts_with("readme")
}

fn walk_docs(root: &Path, formats: &[String]) -> std::io::Result<Vec<DocFile>> {
    let ignored: std::collections::HashSet<&str> = DEFAULT_IGNORE.iter().copied().collect();
    let mut out = Vec::new();
    let mut stack = vec![root.to_path_buf()];
    while let Some(dir) = stack.pop() {
        let mut children: Vec<std::fs::DirEntry> = std::fs::read_dir(&dir)?.collect::<Result<_, _>>()?;
        children.sort_by_key(|e| e.file_name());
        for entry in children {
            let name = entry.file_name().to_string_lossy().into_owned();
            if ignored.contains(name.as_str()) {
                continue;
            }
            let path = entry.path();
            let metadata = entry.metadata()?;
            if metadata.is_dir() {
                stack.push(path);
                continue;
            }
            let extension = path.extension().map(|e| e.to_string_lossy().to_lowercase());
            let is_doc = is_readme(&name) || extension.as_deref().is_some_and(|ext| formats.iter().any(|f| f == ext));
            if !is_doc {
                continue;
            }
            // READMEs without an extension, and anything explicitly `.md`,
            // are treated as Markdown; everything else (notably `.rst`)
            // falls back to the plain backtick scan below.
            let is_markdown = extension.as_deref() == Some("md") || (is_readme(&name) && extension.is_none());
            let relative_path = path.strip_prefix(root).unwrap_or(&path).to_string_lossy().replace('\\', "/");
            if let Ok(content) = std::fs::read_to_string(&path) {
                out.push(DocFile { relative_path, content, is_markdown });
            }
        }
    }
    Ok(out)
}

// Allow expect here: the pattern is a fixed literal verified at compile time.
#[allow(clippy::expect_used)]
fn mention_pattern() -> Regex {
    Regex::new(r"`([^`\n]{1,200})`").expect("valid regex literal")
}

/// One backtick-delimited mention and the byte range (within the doc's raw
/// content) it was found at.
struct Mention {
    text: String,
    start: usize,
    end: usize,
}

/// Markdown files are parsed properly so code spans inside fenced blocks,
/// emphasis, and links don't confuse a naive scan; everything else (README
/// files without a recognized extension, `.rst`) gets the same plain
/// backtick scan since `pulldown-cmark` can't parse non-Markdown formats.
fn extract_mentions(doc: &DocFile) -> Vec<Mention> {
    if doc.is_markdown {
        Parser::new(&doc.content)
            .into_offset_iter()
            .filter_map(|(event, range)| match event {
                Event::Code(text) => {
                    let trimmed = text.trim();
                    if trimmed.is_empty() {
                        None
                    } else {
                        Some(Mention { text: trimmed.to_string(), start: range.start, end: range.end })
                    }
                }
                _ => None,
            })
            .collect()
    } else {
        mention_pattern()
            .captures_iter(&doc.content)
            .filter_map(|capture| {
                let m = capture.get(1)?;
                let trimmed = m.as_str().trim();
                if trimmed.is_empty() {
                    None
                } else {
                    Some(Mention { text: trimmed.to_string(), start: m.start(), end: m.end() })
                }
            })
            .collect()
    }
}

#[derive(Clone)]
struct CodeTarget {
    label: NodeLabel,
    /// Exactly `label.identity_keys()`, ready to pass as either side of an
    /// `edge_row`.
    identity: PropertyBag,
    module_path: Option<String>,
}

#[derive(Default)]
struct CodeIndex {
    qualified: HashMap<String, CodeTarget>,
    bare: HashMap<String, Vec<(String, CodeTarget)>>,
}

impl CodeIndex {
    fn insert(&mut self, bare_name: &str, qualified_name: &str, target: CodeTarget) {
        self.qualified.insert(qualified_name.to_string(), target.clone());
        self.bare.entry(bare_name.to_string()).or_default().push((qualified_name.to_string(), target));
    }

    fn all_names(&self) -> impl Iterator<Item = &String> {
        self.bare.keys()
    }
}

fn build_code_index(records: &[AstRecord]) -> CodeIndex {
    let mut index = CodeIndex::default();
    let mut module_paths = HashMap::new();
    for record in records {
        if let AstRecord::Module { name, path } = record {
            module_paths.insert(name.clone(), path.clone());
        }
    }
    for record in records {
        match record {
            AstRecord::Module { name, path } => {
                index.insert(
                    name,
                    name,
                    CodeTarget { label: NodeLabel::Module, identity: module_identity(name), module_path: Some(path.clone()) },
                );
            }
            AstRecord::Class { name, module, .. } => {
                let qualified = format!("{module}::{name}");
                index.insert(
                    name,
                    &qualified,
                    CodeTarget {
                        label: NodeLabel::Class,
                        identity: named_in_module(name, module),
                        module_path: module_paths.get(module).cloned(),
                    },
                );
            }
            AstRecord::Function { name, module, .. } => {
                let qualified = format!("{module}::{name}");
                index.insert(
                    name,
                    &qualified,
                    CodeTarget {
                        label: NodeLabel::Function,
                        identity: named_in_module(name, module),
                        module_path: module_paths.get(module).cloned(),
                    },
                );
            }
            AstRecord::Import { .. } => {}
        }
    }
    index
}

enum Resolution {
    Resolved(CodeTarget),
    Unresolved,
}

async fn resolve_mention(ctx: &StepContext, index: &CodeIndex, mention: &str, threshold: f64) -> Resolution {
    if mention.contains('/') || mention.contains('.') {
        let identity = path_identity(mention);
        if let Ok(Some(_)) = ctx.graph.find_node(NodeLabel::File, identity.clone()).await {
            return Resolution::Resolved(CodeTarget {
                label: NodeLabel::File,
                identity: path_identity(mention),
                module_path: Some(mention.to_string()),
            });
        }
        if let Ok(Some(_)) = ctx.graph.find_node(NodeLabel::Directory, identity).await {
            return Resolution::Resolved(CodeTarget {
                label: NodeLabel::Directory,
                identity: path_identity(mention),
                module_path: Some(mention.to_string()),
            });
        }
    }

    if let Some(target) = index.qualified.get(mention) {
        return Resolution::Resolved(target.clone());
    }

    if let Some(candidates) = index.bare.get(mention) {
        if candidates.len() == 1 {
            return Resolution::Resolved(candidates[0].1.clone());
        }
    }

    let mut best: Option<(f64, &CodeTarget)> = None;
    for name in index.all_names() {
        let score = matching::similarity(mention, name);
        if score < threshold {
            continue;
        }
        let Some(candidates) = index.bare.get(name) else { continue };
        for (_, target) in candidates {
            let better = match &best {
                None => true,
                Some((best_score, best_target)) => {
                    score > *best_score
                        || (score == *best_score
                            && target.module_path.as_ref().map(String::len).unwrap_or(usize::MAX)
                                < best_target.module_path.as_ref().map(String::len).unwrap_or(usize::MAX))
                }
            };
            if better {
                best = Some((score, target));
            }
        }
    }
    match best {
        Some((_, target)) => Resolution::Resolved(target.clone()),
        None => Resolution::Unresolved,
    }
}

pub struct DocGrapherStep {
    llm: std::sync::Arc<dyn llm::LlmClient>,
}

impl DocGrapherStep {
    pub fn new(llm: std::sync::Arc<dyn llm::LlmClient>) -> Self {
        Self { llm }
    }
}

fn truncate(text: &str, max_chars: usize) -> String {
    if text.len() <= max_chars {
        text.to_string()
    } else {
        text.chars().take(max_chars).collect()
    }
}

async fn existing_content_hash(ctx: &StepContext, doc_path: &str) -> Option<String> {
    let mut identity = PropertyBag::new();
    identity.insert("path".to_string(), Value::String(doc_path.to_string()));
    let node = ctx.graph.find_node(NodeLabel::Documentation, identity).await.ok().flatten()?;
    node.property("content_hash").and_then(Value::as_str).map(str::to_string)
}

async fn process_doc(
    ctx: &StepContext,
    llm: &std::sync::Arc<dyn llm::LlmClient>,
    index: &CodeIndex,
    threshold: f64,
    doc: &DocFile,
) -> Result<(), ErrorRecord> {
    let content_hash = hash_bytes(doc.content.as_bytes());
    let unchanged = existing_content_hash(ctx, &doc.relative_path).await.as_deref() == Some(content_hash.as_str());

    if !unchanged {
        let prompt = SummaryPrompt {
            entity_kind: "documentation",
            name: doc.relative_path.clone(),
            context: truncate(&doc.content, MAX_CONTEXT_CHARS),
            ..Default::default()
        };
        let result = llm.summarize(prompt).await?;

        let mut row = PropertyBag::new();
        row.insert("path".to_string(), Value::String(doc.relative_path.clone()));
        row.insert("content".to_string(), Value::String(doc.content.clone()));
        row.insert("description".to_string(), Value::String(result.text));
        row.insert("embedding".to_string(), Value::Array(result.embedding.into_iter().map(|f| Value::from(f as f64)).collect()));
        row.insert("content_hash".to_string(), Value::String(content_hash));
        ctx.graph.upsert_nodes(NodeLabel::Documentation, vec![row]).await.map_err(|err| classify_graph_error("docgrapher", err))?;
    }

    for mention in extract_mentions(doc) {
        match resolve_mention(ctx, index, &mention.text, threshold).await {
            Resolution::Resolved(target) => {
                let row = edge_row(target.identity, path_identity(&doc.relative_path), PropertyBag::new());
                let spec = EdgeSpec { label: EdgeLabel::DocumentedBy, from_label: target.label, to_label: NodeLabel::Documentation };
                ctx.graph.upsert_edges(spec, vec![row]).await.map_err(|err| classify_graph_error("docgrapher", err))?;
            }
            Resolution::Unresolved => {
                let text_range = format!("{}-{}", mention.start, mention.end);
                let mut stub = PropertyBag::new();
                stub.insert("source_path".to_string(), Value::String(doc.relative_path.clone()));
                stub.insert("text_range".to_string(), Value::String(text_range.clone()));
                stub.insert("mention".to_string(), Value::String(mention.text.clone()));
                ctx.graph.upsert_nodes(NodeLabel::DocumentationEntity, vec![stub]).await.map_err(|err| classify_graph_error("docgrapher", err))?;

                let mut entity_identity = PropertyBag::new();
                entity_identity.insert("source_path".to_string(), Value::String(doc.relative_path.clone()));
                entity_identity.insert("text_range".to_string(), Value::String(text_range));
                let row = edge_row(path_identity(&doc.relative_path), entity_identity, PropertyBag::new());
                let spec = EdgeSpec { label: EdgeLabel::References, from_label: NodeLabel::Documentation, to_label: NodeLabel::DocumentationEntity };
                ctx.graph.upsert_edges(spec, vec![row]).await.map_err(|err| classify_graph_error("docgrapher", err))?;
            }
        }
    }

    Ok(())
}

#[async_trait]
impl Step for DocGrapherStep {
    fn name(&self) -> &str {
        "docgrapher"
    }

    fn declared_dependencies(&self, _params: &StepParams) -> std::collections::HashSet<String> {
        std::collections::HashSet::from(["filesystem".to_string()])
    }

    fn timeout(&self) -> Option<std::time::Duration> {
        Some(DEFAULT_TIMEOUT)
    }

    async fn run(&self, ctx: StepContext) -> StepOutcome {
        if !enabled(&ctx.params) {
            return StepOutcome::Succeeded;
        }

        let root = PathBuf::from(&ctx.repo_path);
        let formats = supported_formats(&ctx.params);
        let docs = match walk_docs(&root, &formats) {
            Ok(docs) => docs,
            Err(err) => {
                return StepOutcome::Failed(ErrorRecord::new(ErrorKind::RepoNotAccessible, err.to_string()).with_step(self.name()))
            }
        };

        let records: Vec<AstRecord> = ctx
            .shared_state
            .get(ast_extract::SHARED_STATE_KEY)
            .and_then(|v| serde_json::from_value(v).ok())
            .unwrap_or_default();
        let index = build_code_index(&records);
        let threshold = fuzzy_threshold(&ctx.params);

        let total = docs.len().max(1);
        for (processed, doc) in docs.iter().enumerate() {
            if ctx.is_cancelled() {
                return StepOutcome::Cancelled;
            }
            if let Err(err) = process_doc(&ctx, &self.llm, &index, threshold, doc).await {
                return StepOutcome::Failed(err.with_step(self.name()));
            }
            ctx.report_progress(Progress::new(
                (processed + 1) as f64 / total as f64,
                format!("{}/{} documents linked", processed + 1, total),
            ));
        }

        StepOutcome::Succeeded
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::summarizer::llm::FakeLlmClient;
    use codestory_core::JobId;
    use codestory_engine::SharedState;
    use codestory_graph::{GraphStore, InMemoryGraphStore};
    use std::sync::Arc;
    use tokio_util::sync::CancellationToken;

    fn ctx(repo_path: &str, graph: Arc<dyn GraphStore>, shared_state: SharedState) -> StepContext {
        StepContext::new(
            JobId::new("job-1"),
            repo_path,
            StepParams::new(),
            graph,
            CancellationToken::new(),
            shared_state,
            Arc::new(|_| {}),
        )
    }

    #[tokio::test]
    async fn links_backtick_mention_to_a_known_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        std::fs::write(dir.path().join("README.md"), "See `src/lib.rs` for details.").expect("write");

        let store = Arc::new(InMemoryGraphStore::new());
        let mut file = PropertyBag::new();
        file.insert("path".to_string(), Value::String("src/lib.rs".to_string()));
        store.upsert_nodes(NodeLabel::File, vec![file]).await.unwrap();

        let step = DocGrapherStep::new(Arc::new(FakeLlmClient));
        let graph: Arc<dyn GraphStore> = store.clone();
        let outcome = step.run(ctx(dir.path().to_str().unwrap(), graph, SharedState::new())).await;
        assert!(matches!(outcome, StepOutcome::Succeeded), "{outcome:?}");
        assert_eq!(store.nodes(NodeLabel::Documentation).len(), 1);
        assert!(store.edge_count() >= 1);
    }

    #[tokio::test]
    async fn unresolved_mention_becomes_a_documentation_entity_stub() {
        let dir = tempfile::tempdir().expect("tempdir");
        std::fs::write(dir.path().join("README.md"), "See `TotallyUnknownThing` for details.").expect("write");

        let store = Arc::new(InMemoryGraphStore::new());
        let step = DocGrapherStep::new(Arc::new(FakeLlmClient));
        let graph: Arc<dyn GraphStore> = store.clone();
        step.run(ctx(dir.path().to_str().unwrap(), graph, SharedState::new())).await;

        assert_eq!(store.nodes(NodeLabel::DocumentationEntity).len(), 1);
    }

    #[test]
    fn declares_only_filesystem_as_a_hard_dependency() {
        let step = DocGrapherStep::new(Arc::new(FakeLlmClient));
        let deps = step.declared_dependencies(&StepParams::new());
        assert!(deps.contains("filesystem"));
        assert_eq!(deps.len(), 1);
    }
}
