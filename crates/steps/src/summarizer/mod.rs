// SPDX-License-Identifier: MIT

//! `SummarizerStep`: walks the code-entity graph produced by `ast` and
//! asks an `LlmClient` to summarize each module, class, and function,
//! writing `Summary` nodes and `SummarizedBy` edges. Entities are
//! processed in dependency order — callees before callers, base classes
//! before subclasses, members before their enclosing module — so a
//! parent's prompt can reference its children's summaries; mutually
//! dependent entities are collapsed into one unit first so a cycle can't
//! stall the walk.

pub mod llm;
mod scc;

use crate::ast_extract::{self, AstRecord};
use crate::errors::classify_graph_error;
use crate::hashing::hash_fields;
use codestory_core::{ErrorKind, ErrorRecord, Progress};
use codestory_engine::{Step, StepContext, StepOutcome, StepParams};
use codestory_graph::{
    edge_row, module_identity, named_in_module, EdgeLabel, EdgeSpec, GraphStore, NodeLabel,
    PropertyBag,
};
use llm::{LlmClient, SummaryPrompt};
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::Semaphore;

const DEFAULT_MAX_CONCURRENCY: usize = 5;
const DEFAULT_MAX_CONTEXT_CHARS: usize = 8_000; // ~2000 tokens at a 4-chars/token estimate
const DEFAULT_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(1_800);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EntityKind {
    Module,
    Class,
    Function,
}

impl EntityKind {
    fn as_str(self) -> &'static str {
        match self {
            EntityKind::Module => "module",
            EntityKind::Class => "class",
            EntityKind::Function => "function",
        }
    }

    fn node_label(self) -> NodeLabel {
        match self {
            EntityKind::Module => NodeLabel::Module,
            EntityKind::Class => NodeLabel::Class,
            EntityKind::Function => NodeLabel::Function,
        }
    }
}

/// One module/class/function pulled out of the `ast` step's records, with
/// enough of its own metadata to build an idempotence hash and an LLM
/// prompt without going back to the graph.
#[derive(Debug, Clone)]
struct Entity {
    kind: EntityKind,
    key: String,
    name: String,
    module: String,
    relations: Vec<String>,
    /// Exactly `kind.node_label().identity_keys()`, ready to pass as the
    /// `from` side of a `SummarizedBy` edge.
    node_identity: PropertyBag,
}

impl Entity {
    fn content_hash(&self) -> String {
        let mut fields = vec![self.kind.as_str().to_string(), self.name.clone(), self.module.clone()];
        fields.extend(self.relations.iter().cloned());
        hash_fields(fields)
    }

    fn context(&self) -> String {
        match self.kind {
            EntityKind::Module => format!("module {} ({})", self.name, self.module),
            EntityKind::Class => format!(
                "class {} in module {}, inherits from: {}",
                self.name,
                self.module,
                if self.relations.is_empty() { "(none)".to_string() } else { self.relations.join(", ") }
            ),
            EntityKind::Function => format!(
                "function {} in module {}, calls: {}",
                self.name,
                self.module,
                if self.relations.is_empty() { "(none)".to_string() } else { self.relations.join(", ") }
            ),
        }
    }
}

fn max_concurrency(params: &StepParams) -> usize {
    params
        .get("max_concurrency")
        .and_then(Value::as_u64)
        .map(|n| n.max(1) as usize)
        .unwrap_or(DEFAULT_MAX_CONCURRENCY)
}

fn max_context_chars(params: &StepParams) -> usize {
    params
        .get("max_tokens_per_file")
        .and_then(Value::as_u64)
        .map(|tokens| (tokens as usize).saturating_mul(4))
        .unwrap_or(DEFAULT_MAX_CONTEXT_CHARS)
}

fn chat_model(params: &StepParams) -> Option<String> {
    params.get("chat_model").and_then(Value::as_str).map(str::to_string)
}

fn embedding_model(params: &StepParams) -> Option<String> {
    params.get("embedding_model").and_then(Value::as_str).map(str::to_string)
}

/// `prompt_template_overrides` is a per-job map from entity kind
/// (`"module"`/`"class"`/`"function"`) to a replacement prompt template.
fn prompt_template_override(params: &StepParams, entity_kind: &str) -> Option<String> {
    params
        .get("prompt_template_overrides")
        .and_then(Value::as_object)
        .and_then(|overrides| overrides.get(entity_kind))
        .and_then(Value::as_str)
        .map(str::to_string)
}

fn truncate(text: &str, max_chars: usize) -> String {
    if text.len() <= max_chars {
        text.to_string()
    } else {
        text.chars().take(max_chars).collect()
    }
}

/// Best-effort lookup from a bare or `module::name` reference (as found in
/// `inherits_from`/`calls`) to the entity it names. Ambiguous bare names
/// (the same identifier defined in more than one module) are left
/// unresolved rather than guessed at.
#[derive(Default)]
struct EntityIndex {
    qualified: HashMap<String, String>,
    bare: HashMap<String, Option<String>>,
}

impl EntityIndex {
    fn record(&mut self, module: &str, name: &str, key: &str) {
        self.qualified.insert(format!("{module}::{name}"), key.to_string());
        self.bare
            .entry(name.to_string())
            .and_modify(|existing| *existing = None)
            .or_insert_with(|| Some(key.to_string()));
    }

    fn resolve(&self, raw: &str) -> Option<String> {
        if let Some(key) = self.qualified.get(raw) {
            return Some(key.clone());
        }
        self.bare.get(raw).and_then(|v| v.clone())
    }
}

/// Builds the entity set and "must be summarized before" dependency graph
/// from the `ast` step's parsed records.
fn build_entities(records: &[AstRecord]) -> (Vec<Entity>, HashMap<String, HashSet<String>>) {
    let mut entities = Vec::new();
    let mut index = EntityIndex::default();

    for record in records {
        match record {
            AstRecord::Module { name, .. } => {
                let key = format!("module::{name}");
                index.record(name, name, &key);
                entities.push(Entity {
                    kind: EntityKind::Module,
                    key,
                    name: name.clone(),
                    module: name.clone(),
                    relations: Vec::new(),
                    node_identity: module_identity(name),
                });
            }
            AstRecord::Class { name, module, inherits_from } => {
                let key = format!("class::{module}::{name}");
                index.record(module, name, &key);
                entities.push(Entity {
                    kind: EntityKind::Class,
                    key,
                    name: name.clone(),
                    module: module.clone(),
                    relations: inherits_from.clone(),
                    node_identity: named_in_module(name, module),
                });
            }
            AstRecord::Function { name, module, calls, .. } => {
                let key = format!("function::{module}::{name}");
                index.record(module, name, &key);
                entities.push(Entity {
                    kind: EntityKind::Function,
                    key,
                    name: name.clone(),
                    module: module.clone(),
                    relations: calls.clone(),
                    node_identity: named_in_module(name, module),
                });
            }
            AstRecord::Import { .. } => {}
        }
    }

    let mut deps: HashMap<String, HashSet<String>> =
        entities.iter().map(|e| (e.key.clone(), HashSet::new())).collect();

    for record in records {
        match record {
            AstRecord::Class { name, module, inherits_from } => {
                let key = format!("class::{module}::{name}");
                for base in inherits_from {
                    if let Some(base_key) = index.resolve(base) {
                        if base_key != key {
                            deps.entry(key.clone()).or_default().insert(base_key);
                        }
                    }
                }
            }
            AstRecord::Function { name, module, defined_in_class, calls } => {
                let key = format!("function::{module}::{name}");
                for callee in calls {
                    if let Some(callee_key) = index.resolve(callee) {
                        if callee_key != key {
                            deps.entry(key.clone()).or_default().insert(callee_key);
                        }
                    }
                }
                let container_key = match defined_in_class {
                    Some(class) => format!("class::{module}::{class}"),
                    None => format!("module::{module}"),
                };
                deps.entry(container_key).or_default().insert(key);
            }
            AstRecord::Module { .. } | AstRecord::Import { .. } => {}
        }
    }

    // A module also depends on every class defined in it, not just its
    // own top-level functions.
    for entity in &entities {
        if entity.kind == EntityKind::Class {
            let module_key = format!("module::{}", entity.module);
            if deps.contains_key(&module_key) {
                deps.entry(module_key).or_default().insert(entity.key.clone());
            }
        }
    }

    (entities, deps)
}

/// Groups entity keys into dependency layers: collapse cycles into single
/// units with `scc`, then repeatedly peel off components whose
/// dependencies have already been processed, mirroring the "ready set"
/// topological walk `StepRegistry` uses to validate step graphs.
fn layered_order(all_keys: &[String], deps: &HashMap<String, HashSet<String>>) -> Vec<Vec<String>> {
    let components = scc::strongly_connected_components(all_keys, deps);
    let mut component_of: HashMap<&str, usize> = HashMap::new();
    for (idx, component) in components.iter().enumerate() {
        for key in component {
            component_of.insert(key.as_str(), idx);
        }
    }

    let mut comp_deps: Vec<HashSet<usize>> = vec![HashSet::new(); components.len()];
    for (key, key_deps) in deps {
        let Some(&from) = component_of.get(key.as_str()) else { continue };
        for dep in key_deps {
            let Some(&to) = component_of.get(dep.as_str()) else { continue };
            if to != from {
                comp_deps[from].insert(to);
            }
        }
    }

    let mut unresolved: Vec<usize> = comp_deps.iter().map(|d| d.len()).collect();
    let mut processed = vec![false; components.len()];
    let mut layers = Vec::new();

    loop {
        let ready: Vec<usize> = (0..components.len())
            .filter(|&i| !processed[i] && unresolved[i] == 0)
            .collect();
        if ready.is_empty() {
            break;
        }
        for &i in &ready {
            processed[i] = true;
        }
        for (i, deps_of_i) in comp_deps.iter().enumerate() {
            if processed[i] {
                continue;
            }
            for &dep in deps_of_i.iter() {
                if ready.contains(&dep) {
                    unresolved[i] -= 1;
                }
            }
        }
        let mut layer: Vec<String> = ready.into_iter().flat_map(|i| components[i].clone()).collect();
        layer.sort();
        layers.push(layer);
    }

    // Any components left over sit in an unresolvable dependency cycle
    // across components, which `scc` should have already collapsed away;
    // surface them as a final layer rather than silently dropping work.
    let leftover: Vec<String> = (0..components.len())
        .filter(|&i| !processed[i])
        .flat_map(|i| components[i].clone())
        .collect();
    if !leftover.is_empty() {
        layers.push(leftover);
    }

    layers
}

pub struct SummarizerStep {
    llm: Arc<dyn LlmClient>,
}

impl SummarizerStep {
    pub fn new(llm: Arc<dyn LlmClient>) -> Self {
        Self { llm }
    }
}

async fn module_source(graph: &Arc<dyn GraphStore>, module_path: &str) -> Option<String> {
    let mut identity = PropertyBag::new();
    identity.insert("path".to_string(), Value::String(module_path.to_string()));
    let node = graph.find_node(NodeLabel::File, identity).await.ok().flatten()?;
    node.property("content").and_then(Value::as_str).map(str::to_string)
}

async fn existing_content_hash(graph: &Arc<dyn GraphStore>, entity_key: &str) -> Option<String> {
    let mut identity = PropertyBag::new();
    identity.insert("entity_key".to_string(), Value::String(entity_key.to_string()));
    let node = graph.find_node(NodeLabel::Summary, identity).await.ok().flatten()?;
    node.property("content_hash").and_then(Value::as_str).map(str::to_string)
}

async fn summarize_entity(
    ctx: &StepContext,
    llm: &Arc<dyn LlmClient>,
    records_by_module: &HashMap<String, String>,
    max_context_chars: usize,
    entity: &Entity,
) -> Result<bool, ErrorRecord> {
    let content_hash = entity.content_hash();
    if existing_content_hash(&ctx.graph, &entity.key).await.as_deref() == Some(content_hash.as_str()) {
        return Ok(false);
    }

    let mut context = entity.context();
    if let Some(source) = records_by_module.get(&entity.module) {
        context.push_str("\n---\n");
        context.push_str(source);
    }
    let context = truncate(&context, max_context_chars);

    let prompt = SummaryPrompt {
        entity_kind: entity.kind.as_str(),
        name: entity.name.clone(),
        context,
        chat_model: chat_model(&ctx.params),
        embedding_model: embedding_model(&ctx.params),
        prompt_template: prompt_template_override(&ctx.params, entity.kind.as_str()),
    };
    let result = llm.summarize(prompt).await?;

    let mut row = PropertyBag::new();
    row.insert("entity_key".to_string(), Value::String(entity.key.clone()));
    row.insert("text".to_string(), Value::String(result.text));
    row.insert(
        "embedding".to_string(),
        Value::Array(result.embedding.into_iter().map(|f| Value::from(f as f64)).collect()),
    );
    row.insert("content_hash".to_string(), Value::String(content_hash));
    ctx.graph
        .upsert_nodes(NodeLabel::Summary, vec![row])
        .await
        .map_err(|err| classify_graph_error("summarizer", err))?;

    let mut summary_identity = PropertyBag::new();
    summary_identity.insert("entity_key".to_string(), Value::String(entity.key.clone()));
    let row = edge_row(entity.node_identity.clone(), summary_identity, PropertyBag::new());
    let spec = EdgeSpec { label: EdgeLabel::SummarizedBy, from_label: entity.kind.node_label(), to_label: NodeLabel::Summary };
    ctx.graph
        .upsert_edges(spec, vec![row])
        .await
        .map_err(|err| classify_graph_error("summarizer", err))?;

    Ok(true)
}

#[async_trait::async_trait]
impl Step for SummarizerStep {
    fn name(&self) -> &str {
        "summarizer"
    }

    fn declared_dependencies(&self, _params: &StepParams) -> HashSet<String> {
        HashSet::from(["filesystem".to_string(), "ast".to_string()])
    }

    fn timeout(&self) -> Option<std::time::Duration> {
        Some(DEFAULT_TIMEOUT)
    }

    async fn run(&self, ctx: StepContext) -> StepOutcome {
        let records: Vec<AstRecord> = match ctx.shared_state.get(ast_extract::SHARED_STATE_KEY) {
            Some(value) => match serde_json::from_value(value) {
                Ok(records) => records,
                Err(err) => {
                    return StepOutcome::Failed(
                        ErrorRecord::new(ErrorKind::InvalidPipeline, format!("malformed ast records: {err}"))
                            .with_step(self.name()),
                    )
                }
            },
            None => {
                return StepOutcome::Failed(
                    ErrorRecord::new(
                        ErrorKind::InvalidPipeline,
                        "no ast records in shared state; the ast step must run in the same job",
                    )
                    .with_step(self.name()),
                )
            }
        };

        let (entities, deps) = build_entities(&records);
        let entity_by_key: HashMap<String, &Entity> = entities.iter().map(|e| (e.key.clone(), e)).collect();
        let module_sources: HashMap<String, String> = {
            let mut sources = HashMap::new();
            for record in &records {
                if let AstRecord::Module { name, path } = record {
                    if let Some(source) = module_source(&ctx.graph, path).await {
                        sources.insert(name.clone(), source);
                    }
                }
            }
            sources
        };

        let all_keys: Vec<String> = entities.iter().map(|e| e.key.clone()).collect();
        let layers = layered_order(&all_keys, &deps);
        let total = all_keys.len().max(1);
        let mut processed = 0usize;
        let max_context_chars = max_context_chars(&ctx.params);
        let semaphore = Arc::new(Semaphore::new(max_concurrency(&ctx.params)));

        for layer in layers {
            if ctx.is_cancelled() {
                return StepOutcome::Cancelled;
            }

            let mut handles = Vec::with_capacity(layer.len());
            for key in &layer {
                let Some(entity) = entity_by_key.get(key) else { continue };
                let entity = (*entity).clone();
                let llm = self.llm.clone();
                let graph = ctx.graph.clone();
                let module_sources = module_sources.clone();
                let semaphore = semaphore.clone();
                let job_id = ctx.job_id.clone();
                let repo_path = ctx.repo_path.clone();
                let params = ctx.params.clone();
                let cancellation = ctx.cancellation.clone();
                let shared_state = ctx.shared_state.clone();
                let progress = ctx.progress_reporter();
                handles.push(tokio::spawn(async move {
                    let _permit = semaphore.acquire_owned().await;
                    let scoped_ctx = StepContext::new(job_id, repo_path, params, graph, cancellation, shared_state, progress);
                    summarize_entity(&scoped_ctx, &llm, &module_sources, max_context_chars, &entity).await
                }));
            }

            for handle in handles {
                match handle.await {
                    Ok(Ok(_wrote)) => {
                        processed += 1;
                        ctx.report_progress(Progress::new(
                            processed as f64 / total as f64,
                            format!("{processed}/{total} entities summarized"),
                        ));
                    }
                    Ok(Err(err)) => return StepOutcome::Failed(err.with_step(self.name())),
                    Err(join_err) => {
                        return StepOutcome::Failed(
                            ErrorRecord::new(ErrorKind::LlmError, format!("summarizer task panicked: {join_err}"))
                                .with_step(self.name()),
                        )
                    }
                }
            }
        }

        StepOutcome::Succeeded
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast_extract::{AstRecord, SHARED_STATE_KEY};
    use codestory_core::JobId;
    use codestory_engine::SharedState;
    use codestory_graph::InMemoryGraphStore;
    use llm::FakeLlmClient;
    use tokio_util::sync::CancellationToken;

    fn ctx(graph: Arc<dyn GraphStore>, shared_state: SharedState) -> StepContext {
        StepContext::new(
            JobId::new("job-1"),
            "/repo",
            StepParams::new(),
            graph,
            CancellationToken::new(),
            shared_state,
            Arc::new(|_| {}),
        )
    }

    fn sample_records() -> Vec<AstRecord> {
        vec![
            AstRecord::Module { name: "app".into(), path: "app.py".into() },
            AstRecord::Class { name: "Widget".into(), module: "app".into(), inherits_from: vec![] },
            AstRecord::Function {
                name: "helper".into(),
                module: "app".into(),
                defined_in_class: None,
                calls: vec![],
            },
            AstRecord::Function {
                name: "run".into(),
                module: "app".into(),
                defined_in_class: Some("Widget".into()),
                calls: vec!["helper".into()],
            },
        ]
    }

    async fn seed_ast_nodes(store: &InMemoryGraphStore) {
        let mut module = PropertyBag::new();
        module.insert("name".to_string(), Value::String("app".into()));
        store.upsert_nodes(NodeLabel::Module, vec![module]).await.unwrap();

        let mut class = PropertyBag::new();
        class.insert("name".to_string(), Value::String("Widget".into()));
        class.insert("module".to_string(), Value::String("app".into()));
        store.upsert_nodes(NodeLabel::Class, vec![class]).await.unwrap();

        for name in ["helper", "run"] {
            let mut function = PropertyBag::new();
            function.insert("name".to_string(), Value::String(name.into()));
            function.insert("module".to_string(), Value::String("app".into()));
            store.upsert_nodes(NodeLabel::Function, vec![function]).await.unwrap();
        }
    }

    #[tokio::test]
    async fn writes_a_summary_per_entity_in_dependency_order() {
        let store = Arc::new(InMemoryGraphStore::new());
        seed_ast_nodes(&store).await;
        let graph: Arc<dyn GraphStore> = store.clone();
        let shared_state = SharedState::new();
        shared_state.set(SHARED_STATE_KEY, serde_json::to_value(sample_records()).unwrap());
        let step = SummarizerStep::new(Arc::new(FakeLlmClient));
        let outcome = step.run(ctx(graph, shared_state)).await;
        assert!(matches!(outcome, StepOutcome::Succeeded), "{outcome:?}");

        // one Module, one Class, two Functions
        assert_eq!(store.nodes(NodeLabel::Summary).len(), 4);
        assert_eq!(store.edge_count(), 4);
    }

    #[tokio::test]
    async fn fails_cleanly_when_ast_has_not_run() {
        let graph: Arc<dyn GraphStore> = Arc::new(InMemoryGraphStore::new());
        let step = SummarizerStep::new(Arc::new(FakeLlmClient));
        let outcome = step.run(ctx(graph, SharedState::new())).await;
        assert!(matches!(outcome, StepOutcome::Failed(ref err) if err.kind == ErrorKind::InvalidPipeline));
    }

    #[test]
    fn builds_a_dependency_edge_from_caller_to_callee() {
        let (_entities, deps) = build_entities(&sample_records());
        assert!(deps["function::app::run"].contains("function::app::helper"));
    }

    #[test]
    fn module_depends_on_its_own_class_and_functions() {
        let (_entities, deps) = build_entities(&sample_records());
        let module_deps = &deps["module::app"];
        assert!(module_deps.contains("class::app::Widget"));
        assert!(module_deps.contains("function::app::helper"));
    }

    #[test]
    fn declares_filesystem_and_ast_as_dependencies() {
        let step = SummarizerStep::new(Arc::new(FakeLlmClient));
        assert!(step.declared_dependencies(&StepParams::new()).contains("ast"));
        assert!(step.declared_dependencies(&StepParams::new()).contains("filesystem"));
    }
}
