// SPDX-License-Identifier: MIT

//! The `GraphStore` adapter contract — the only path from steps to
//! persistent graph state. Modeled as an `async_trait`, the same shape
//! used elsewhere in this codebase for swappable session/agent adapters.

use crate::entity::{EdgeLabel, Node, NodeLabel, PropertyBag, RowSet, Statement};
use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;

/// Errors a `GraphStore` implementation can raise.
#[derive(Debug, Error, Clone)]
pub enum GraphError {
    #[error("query error: {query}: {cause}")]
    Query { query: String, cause: String },
    #[error("schema error: {0}")]
    Schema(String),
    #[error("connection error: {0}")]
    Connection(String),
    /// Classified transient (connection reset, leader election, ...);
    /// `with_transaction` retries these automatically.
    #[error("transient graph error: {0}")]
    Transient(String),
}

impl GraphError {
    pub fn is_transient(&self) -> bool {
        matches!(self, GraphError::Transient(_))
    }
}

/// A single row of parameters for `upsert_nodes`/`upsert_edges`.
pub type Row = PropertyBag;

/// Build an `upsert_edges` row whose `"from"`/`"to"` each carry exactly the
/// identity properties of their endpoint (per `NodeLabel::identity_keys()`),
/// not a single scalar — a bare name collides between, say, two `Function`s
/// of the same name in different modules, which is why `Class`/`Function`
/// identity is `(name, module)` rather than `name` alone. `props` becomes
/// the relationship's own properties, set on the edge itself.
pub fn edge_row(from: PropertyBag, to: PropertyBag, props: PropertyBag) -> Row {
    let mut row = Row::new();
    row.insert("from".to_string(), Value::Object(from.into_iter().collect()));
    row.insert("to".to_string(), Value::Object(to.into_iter().collect()));
    row.insert("props".to_string(), Value::Object(props.into_iter().collect()));
    row
}

/// Identity bag for a node whose `identity_keys()` is `["path"]` (`File`,
/// `Directory`, `Documentation`).
pub fn path_identity(path: &str) -> PropertyBag {
    let mut bag = PropertyBag::new();
    bag.insert("path".to_string(), Value::String(path.to_string()));
    bag
}

/// Identity bag for a node whose `identity_keys()` is `["name"]` (`Module`).
pub fn module_identity(name: &str) -> PropertyBag {
    let mut bag = PropertyBag::new();
    bag.insert("name".to_string(), Value::String(name.to_string()));
    bag
}

/// Identity bag for a node whose `identity_keys()` is `["name", "module"]`
/// (`Class`, `Function`).
pub fn named_in_module(name: &str, module: &str) -> PropertyBag {
    let mut bag = PropertyBag::new();
    bag.insert("name".to_string(), Value::String(name.to_string()));
    bag.insert("module".to_string(), Value::String(module.to_string()));
    bag
}

/// Edge upsert target.
#[derive(Debug, Clone, Copy)]
pub struct EdgeSpec {
    pub label: EdgeLabel,
    pub from_label: NodeLabel,
    pub to_label: NodeLabel,
}

/// The only path from steps to persistent graph state.
///
/// Implementations must be safe to call concurrently from multiple
/// workers: transactions are linearizable per the underlying store, but
/// there is no cross-transaction ordering guarantee beyond what the
/// caller imposes.
#[async_trait]
pub trait GraphStore: Send + Sync {
    /// Create uniqueness constraints, indexes, and vector indexes for the
    /// full entity set. Safe to call repeatedly; with `force=false`
    /// existing compatible schema objects are left alone, with
    /// `force=true` incompatible ones are dropped and recreated.
    async fn initialize_schema(&self, force: bool) -> Result<(), GraphError>;

    async fn execute_read(&self, query: &str, params: PropertyBag) -> Result<RowSet, GraphError>;

    async fn execute_write(&self, query: &str, params: PropertyBag) -> Result<RowSet, GraphError>;

    /// Execute multiple statements atomically in a single transaction.
    async fn execute_batch(
        &self,
        statements: Vec<Statement>,
        write: bool,
    ) -> Result<Vec<RowSet>, GraphError>;

    /// Merge nodes by `label.identity_keys()`; non-key fields are set on
    /// create and updated on match. Returns the number of rows processed.
    async fn upsert_nodes(
        &self,
        label: NodeLabel,
        rows: Vec<Row>,
    ) -> Result<usize, GraphError>;

    /// Look up a single node by its identity key, for steps that need to
    /// check existing state before doing expensive work (e.g. skipping a
    /// summary whose `content_hash` hasn't changed). `identity` must carry
    /// exactly `label.identity_keys()`.
    async fn find_node(
        &self,
        label: NodeLabel,
        identity: PropertyBag,
    ) -> Result<Option<Node>, GraphError>;

    /// Merge edges between existing nodes, creating missing endpoints only
    /// when `edge.label.may_create_missing_endpoints()`.
    async fn upsert_edges(&self, edge: EdgeSpec, rows: Vec<Row>) -> Result<usize, GraphError>;

    /// Cosine-similarity nearest-neighbor search over a vector-indexed
    /// property.
    async fn vector_search(
        &self,
        label: NodeLabel,
        property: &str,
        embedding: &[f32],
        k: usize,
        min_similarity: Option<f32>,
    ) -> Result<Vec<(Node, f32)>, GraphError>;
}

/// Retry a `GraphStore` operation against a default policy (up to 3
/// retries, 1.5x backoff) whenever it fails with a transient error.
pub async fn with_transaction<T, F, Fut>(retry: codestory_core::RetryPolicy, mut op: F) -> Result<T, GraphError>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, GraphError>>,
{
    let mut attempt = 1;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) if err.is_transient() && attempt < retry.max_attempts => {
                tracing::warn!(attempt, error = %err, "transient graph error, retrying");
                tokio::time::sleep(retry.backoff(attempt)).await;
                attempt += 1;
            }
            Err(err) => return Err(err),
        }
    }
}
