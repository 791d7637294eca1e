// SPDX-License-Identifier: MIT

//! An in-process `GraphStore` fake used by engine/steps tests so they never
//! need a live Neo4j instance. Mirrors the real adapter's
//! upsert-by-identity-key and vector-search semantics closely enough that
//! a test written against this fake exercises the same contract the real
//! adapter promises.

use crate::entity::{Node, NodeLabel, PropertyBag, RowSet, Statement};
use crate::store::{EdgeSpec, GraphError, GraphStore, Row};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::HashMap;

#[derive(Debug, Clone, Default)]
struct StoredNode {
    properties: PropertyBag,
}

#[derive(Debug, Clone)]
struct StoredEdge {
    label: String,
    from: (String, PropertyBag),
    to: (String, PropertyBag),
}

#[derive(Default)]
struct Inner {
    nodes: HashMap<String, Vec<StoredNode>>,
    edges: Vec<StoredEdge>,
    schema_initialized: bool,
}

/// In-memory `GraphStore` fake. Node identity is computed from
/// `label.identity_keys()`, matching the real adapter's `MERGE` semantics.
pub struct InMemoryGraphStore {
    inner: Mutex<Inner>,
}

impl InMemoryGraphStore {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
        }
    }

    fn identity_value(label: NodeLabel, row: &PropertyBag) -> String {
        label
            .identity_keys()
            .iter()
            .map(|key| {
                row.get(*key)
                    .map(|v| v.to_string())
                    .unwrap_or_else(|| "null".to_string())
            })
            .collect::<Vec<_>>()
            .join("\u{1f}")
    }

    /// Snapshot all nodes of a label, for assertions in tests that build on
    /// this fake directly rather than through `GraphStore` alone.
    pub fn nodes(&self, label: NodeLabel) -> Vec<Node> {
        let inner = self.inner.lock();
        inner
            .nodes
            .get(label.as_str())
            .cloned()
            .unwrap_or_default()
            .into_iter()
            .map(|n| Node {
                label: label.as_str().to_string(),
                properties: n.properties,
            })
            .collect()
    }

    pub fn edge_count(&self) -> usize {
        self.inner.lock().edges.len()
    }

    /// Snapshot every stored edge under `label`, for tests that need to
    /// assert on *which* edges were written rather than just the count.
    pub fn edges(&self, label: crate::entity::EdgeLabel) -> Vec<(PropertyBag, PropertyBag)> {
        self.inner
            .lock()
            .edges
            .iter()
            .filter(|e| e.label == label.as_str())
            .map(|e| (e.from.1.clone(), e.to.1.clone()))
            .collect()
    }
}

impl Default for InMemoryGraphStore {
    fn default() -> Self {
        Self::new()
    }
}

fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let norm_a = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        0.0
    } else {
        dot / (norm_a * norm_b)
    }
}

/// Pull an edge row's `"from"`/`"to"` identity bag out, matching the real
/// adapter's expectation that each is an object of identity properties, not
/// a bare scalar.
fn endpoint_identity(row: &PropertyBag, side: &str) -> Result<PropertyBag, GraphError> {
    match row.get(side) {
        Some(Value::Object(map)) => Ok(map.clone().into_iter().collect()),
        Some(_) => Err(GraphError::Query {
            query: "upsert_edges".to_string(),
            cause: format!("row '{side}' must be an identity object, not a scalar"),
        }),
        None => Err(GraphError::Query {
            query: "upsert_edges".to_string(),
            cause: format!("row missing '{side}' key"),
        }),
    }
}

fn as_f32_vec(value: &Value) -> Option<Vec<f32>> {
    value.as_array().map(|arr| {
        arr.iter()
            .filter_map(|v| v.as_f64().map(|f| f as f32))
            .collect()
    })
}

#[async_trait]
impl GraphStore for InMemoryGraphStore {
    async fn initialize_schema(&self, force: bool) -> Result<(), GraphError> {
        let mut inner = self.inner.lock();
        if inner.schema_initialized && !force {
            return Ok(());
        }
        if force {
            inner.nodes.clear();
            inner.edges.clear();
        }
        inner.schema_initialized = true;
        Ok(())
    }

    async fn execute_read(&self, query: &str, _params: PropertyBag) -> Result<RowSet, GraphError> {
        Err(GraphError::Query {
            query: query.to_string(),
            cause: "ad-hoc Cypher is not supported by the in-memory fake; use the typed methods"
                .to_string(),
        })
    }

    async fn execute_write(&self, query: &str, _params: PropertyBag) -> Result<RowSet, GraphError> {
        Err(GraphError::Query {
            query: query.to_string(),
            cause: "ad-hoc Cypher is not supported by the in-memory fake; use the typed methods"
                .to_string(),
        })
    }

    async fn execute_batch(
        &self,
        statements: Vec<Statement>,
        _write: bool,
    ) -> Result<Vec<RowSet>, GraphError> {
        if statements.is_empty() {
            return Ok(Vec::new());
        }
        Err(GraphError::Query {
            query: statements[0].query.clone(),
            cause: "ad-hoc Cypher is not supported by the in-memory fake; use the typed methods"
                .to_string(),
        })
    }

    async fn upsert_nodes(&self, label: NodeLabel, rows: Vec<Row>) -> Result<usize, GraphError> {
        let mut inner = self.inner.lock();
        let bucket = inner.nodes.entry(label.as_str().to_string()).or_default();
        let mut count = 0;
        for row in rows {
            let key = Self::identity_value(label, &row);
            if let Some(existing) = bucket.iter_mut().find(|n| {
                Self::identity_value(label, &n.properties) == key
            }) {
                existing.properties.extend(row);
            } else {
                bucket.push(StoredNode { properties: row });
            }
            count += 1;
        }
        Ok(count)
    }

    async fn find_node(
        &self,
        label: NodeLabel,
        identity: PropertyBag,
    ) -> Result<Option<Node>, GraphError> {
        let key = Self::identity_value(label, &identity);
        let inner = self.inner.lock();
        let found = inner
            .nodes
            .get(label.as_str())
            .and_then(|nodes| nodes.iter().find(|n| Self::identity_value(label, &n.properties) == key))
            .map(|n| Node {
                label: label.as_str().to_string(),
                properties: n.properties.clone(),
            });
        Ok(found)
    }

    async fn upsert_edges(&self, edge: EdgeSpec, rows: Vec<Row>) -> Result<usize, GraphError> {
        let mut inner = self.inner.lock();
        let mut count = 0;
        for row in rows {
            let from_props = endpoint_identity(&row, "from")?;
            let to_props = endpoint_identity(&row, "to")?;

            for (label, props) in [(edge.from_label, &from_props), (edge.to_label, &to_props)] {
                let key = Self::identity_value(label, props);
                let present = inner
                    .nodes
                    .get(label.as_str())
                    .map(|ns| ns.iter().any(|n| Self::identity_value(label, &n.properties) == key))
                    .unwrap_or(false);
                if !present {
                    if edge.label.may_create_missing_endpoints() {
                        inner
                            .nodes
                            .entry(label.as_str().to_string())
                            .or_default()
                            .push(StoredNode { properties: props.clone() });
                    } else {
                        return Err(GraphError::Query {
                            query: "upsert_edges".to_string(),
                            cause: format!(
                                "{} edges require both endpoints to already exist",
                                edge.label.as_str()
                            ),
                        });
                    }
                }
            }

            inner.edges.push(StoredEdge {
                label: edge.label.as_str().to_string(),
                from: (edge.from_label.as_str().to_string(), from_props),
                to: (edge.to_label.as_str().to_string(), to_props),
            });
            count += 1;
        }
        Ok(count)
    }

    async fn vector_search(
        &self,
        label: NodeLabel,
        property: &str,
        embedding: &[f32],
        k: usize,
        min_similarity: Option<f32>,
    ) -> Result<Vec<(Node, f32)>, GraphError> {
        if !label.has_vector_index() {
            return Err(GraphError::Schema(format!(
                "{} has no vector index",
                label.as_str()
            )));
        }
        let inner = self.inner.lock();
        let mut scored: Vec<(Node, f32)> = inner
            .nodes
            .get(label.as_str())
            .cloned()
            .unwrap_or_default()
            .into_iter()
            .filter_map(|n| {
                let vector = n.properties.get(property).and_then(as_f32_vec)?;
                let score = cosine_similarity(embedding, &vector);
                Some((
                    Node {
                        label: label.as_str().to_string(),
                        properties: n.properties,
                    },
                    score,
                ))
            })
            .filter(|(_, score)| min_similarity.map(|min| *score >= min).unwrap_or(true))
            .collect();
        scored.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
        scored.truncate(k);
        Ok(scored)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn row(pairs: &[(&str, Value)]) -> PropertyBag {
        pairs.iter().map(|(k, v)| (k.to_string(), v.clone())).collect()
    }

    #[tokio::test]
    async fn upsert_nodes_merges_by_identity_key() {
        let store = InMemoryGraphStore::new();
        store
            .upsert_nodes(
                NodeLabel::File,
                vec![row(&[("path", json!("src/lib.rs")), ("size", json!(10))])],
            )
            .await
            .unwrap();
        store
            .upsert_nodes(
                NodeLabel::File,
                vec![row(&[("path", json!("src/lib.rs")), ("size", json!(20))])],
            )
            .await
            .unwrap();
        let nodes = store.nodes(NodeLabel::File);
        assert_eq!(nodes.len(), 1);
        assert_eq!(nodes[0].property("size"), Some(&json!(20)));
    }

    #[tokio::test]
    async fn upsert_edges_rejects_missing_endpoints_for_structural_edges() {
        let store = InMemoryGraphStore::new();
        let edge = EdgeSpec {
            label: crate::entity::EdgeLabel::Contains,
            from_label: NodeLabel::Directory,
            to_label: NodeLabel::File,
        };
        let result = store
            .upsert_edges(
                edge,
                vec![row(&[
                    ("from", json!({"path": "a"})),
                    ("to", json!({"path": "b"})),
                ])],
            )
            .await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn upsert_edges_allows_missing_endpoints_for_documentation_edges() {
        let store = InMemoryGraphStore::new();
        let edge = EdgeSpec {
            label: crate::entity::EdgeLabel::DocumentedBy,
            from_label: NodeLabel::Function,
            to_label: NodeLabel::DocumentationEntity,
        };
        let result = store
            .upsert_edges(
                edge,
                vec![row(&[
                    ("from", json!({"name": "run", "module": "app"})),
                    ("to", json!({"source_path": "README.md", "text_range": "0-4"})),
                ])],
            )
            .await;
        assert_eq!(result.unwrap(), 1);
        assert_eq!(store.edge_count(), 1);
    }

    #[tokio::test]
    async fn find_node_looks_up_by_identity_key() {
        let store = InMemoryGraphStore::new();
        store
            .upsert_nodes(
                NodeLabel::File,
                vec![row(&[("path", json!("src/lib.rs")), ("size", json!(10))])],
            )
            .await
            .unwrap();
        let found = store
            .find_node(NodeLabel::File, row(&[("path", json!("src/lib.rs"))]))
            .await
            .unwrap();
        assert_eq!(found.unwrap().property("size"), Some(&json!(10)));

        let missing = store
            .find_node(NodeLabel::File, row(&[("path", json!("missing.rs"))]))
            .await
            .unwrap();
        assert!(missing.is_none());
    }

    #[tokio::test]
    async fn vector_search_ranks_by_cosine_similarity() {
        let store = InMemoryGraphStore::new();
        store
            .upsert_nodes(
                NodeLabel::Summary,
                vec![
                    row(&[
                        ("entity_key", json!("a")),
                        ("embedding", json!([1.0, 0.0])),
                    ]),
                    row(&[
                        ("entity_key", json!("b")),
                        ("embedding", json!([0.0, 1.0])),
                    ]),
                ],
            )
            .await
            .unwrap();
        let results = store
            .vector_search(NodeLabel::Summary, "embedding", &[1.0, 0.0], 1, None)
            .await
            .unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].0.property("entity_key"), Some(&json!("a")));
        assert!((results[0].1 - 1.0).abs() < 1e-6);
    }

    #[tokio::test]
    async fn vector_search_rejects_non_indexed_labels() {
        let store = InMemoryGraphStore::new();
        let result = store
            .vector_search(NodeLabel::Function, "embedding", &[1.0], 1, None)
            .await;
        assert!(matches!(result, Err(GraphError::Schema(_))));
    }

    #[tokio::test]
    async fn vector_search_filters_below_min_similarity() {
        let store = InMemoryGraphStore::new();
        store
            .upsert_nodes(
                NodeLabel::Summary,
                vec![row(&[
                    ("entity_key", json!("a")),
                    ("embedding", json!([1.0, 0.0])),
                ])],
            )
            .await
            .unwrap();
        let results = store
            .vector_search(NodeLabel::Summary, "embedding", &[0.0, 1.0], 5, Some(0.5))
            .await
            .unwrap();
        assert!(results.is_empty());
    }
}
