// SPDX-License-Identifier: MIT

//! `neo4rs`-backed `GraphStore`.
//!
//! Queries are built with parameterized Cypher; the only string
//! interpolation is label/property names, which only ever come from the
//! closed `NodeLabel`/`EdgeLabel` enums, never from step input.

use crate::entity::{Node, NodeLabel, PropertyBag, RowSet, Statement};
use crate::store::{with_transaction, EdgeSpec, GraphError, GraphStore, Row};
use async_trait::async_trait;
use codestory_core::RetryPolicy;
use neo4rs::{BoltType, Graph, Query};
use serde_json::Value;
use std::collections::HashMap;

/// Connection settings for the real graph backend.
#[derive(Debug, Clone)]
pub struct Neo4jConfig {
    pub uri: String,
    pub user: String,
    pub password: String,
    pub database: Option<String>,
    pub retry: RetryPolicy,
}

pub struct Neo4jGraphStore {
    graph: Graph,
    retry: RetryPolicy,
}

impl Neo4jGraphStore {
    pub async fn connect(config: Neo4jConfig) -> Result<Self, GraphError> {
        let graph = Graph::new(&config.uri, &config.user, &config.password)
            .await
            .map_err(|e| GraphError::Connection(e.to_string()))?;
        Ok(Self {
            graph,
            retry: config.retry,
        })
    }

    fn query_with_params(cypher: &str, params: &PropertyBag) -> Query {
        let mut query = Query::new(cypher.to_string());
        for (key, value) in params {
            query = query.param(key, to_bolt(value));
        }
        query
    }

    async fn run_batch(
        &self,
        statements: &[Statement],
    ) -> Result<Vec<RowSet>, neo4rs::Error> {
        let mut txn = self.graph.start_txn().await?;
        let mut out = Vec::with_capacity(statements.len());
        for stmt in statements {
            let query = Self::query_with_params(&stmt.query, &stmt.params);
            let mut result = txn.execute(query).await?;
            let mut rows = Vec::new();
            while let Ok(Some(row)) = result.next(txn.handle()).await {
                rows.push(row_to_bag(&row));
            }
            out.push(RowSet { rows });
        }
        txn.commit().await?;
        Ok(out)
    }
}

fn to_bolt(value: &Value) -> BoltType {
    match value {
        Value::Null => BoltType::Null(neo4rs::BoltNull),
        Value::Bool(b) => BoltType::Boolean(neo4rs::BoltBoolean::new(*b)),
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                BoltType::Integer(neo4rs::BoltInteger::new(i))
            } else {
                BoltType::Float(neo4rs::BoltFloat::new(n.as_f64().unwrap_or_default()))
            }
        }
        Value::String(s) => BoltType::String(neo4rs::BoltString::new(s)),
        Value::Array(items) => {
            let list: Vec<BoltType> = items.iter().map(to_bolt).collect();
            BoltType::List(neo4rs::BoltList::from(list))
        }
        Value::Object(map) => {
            let mut bolt_map = neo4rs::BoltMap::new();
            for (k, v) in map {
                bolt_map.put(neo4rs::BoltString::new(k), to_bolt(v));
            }
            BoltType::Map(bolt_map)
        }
    }
}

fn row_to_bag(row: &neo4rs::Row) -> PropertyBag {
    // neo4rs exposes column access by name via `Row::get`; we reconstruct a
    // JSON-ish bag by round-tripping through its own `to::<serde_json::Value>`
    // support where available, falling back to an empty bag otherwise.
    row.to::<HashMap<String, Value>>().unwrap_or_default()
}

fn classify(err: neo4rs::Error) -> GraphError {
    let message = err.to_string();
    let lowered = message.to_lowercase();
    if lowered.contains("connection")
        || lowered.contains("reset")
        || lowered.contains("timed out")
        || lowered.contains("leader")
    {
        GraphError::Transient(message)
    } else {
        GraphError::Query {
            query: String::new(),
            cause: message,
        }
    }
}

#[async_trait]
impl GraphStore for Neo4jGraphStore {
    async fn initialize_schema(&self, force: bool) -> Result<(), GraphError> {
        let statements = schema_statements(force);
        with_transaction(self.retry, || async {
            self.run_batch(&statements).await.map(|_| ()).map_err(classify)
        })
        .await
    }

    async fn execute_read(&self, query: &str, params: PropertyBag) -> Result<RowSet, GraphError> {
        with_transaction(self.retry, || async {
            let stmt = Statement::new(query, params.clone());
            let mut rows = self
                .run_batch(std::slice::from_ref(&stmt))
                .await
                .map_err(classify)?;
            Ok(rows.pop().unwrap_or_default())
        })
        .await
    }

    async fn execute_write(&self, query: &str, params: PropertyBag) -> Result<RowSet, GraphError> {
        self.execute_read(query, params).await
    }

    async fn execute_batch(
        &self,
        statements: Vec<Statement>,
        _write: bool,
    ) -> Result<Vec<RowSet>, GraphError> {
        with_transaction(self.retry, || async {
            self.run_batch(&statements).await.map_err(classify)
        })
        .await
    }

    async fn upsert_nodes(&self, label: NodeLabel, rows: Vec<Row>) -> Result<usize, GraphError> {
        let keys = label.identity_keys();
        let match_clause = keys
            .iter()
            .map(|k| format!("{k}: row.{k}"))
            .collect::<Vec<_>>()
            .join(", ");
        let cypher = format!(
            "UNWIND $rows AS row MERGE (n:{label} {{ {match_clause} }}) SET n += row",
            label = label.as_str(),
        );
        let mut params = PropertyBag::new();
        params.insert("rows".to_string(), Value::Array(rows.into_iter().map(|m| Value::Object(m.into_iter().collect())).map(|v| match v {
            Value::Object(m) => Value::Object(m),
            other => other,
        }).collect()));
        let count = {
            let Value::Array(arr) = params.get("rows").cloned().unwrap_or(Value::Array(vec![])) else { unreachable!() };
            arr.len()
        };
        with_transaction(self.retry, || async {
            let stmt = Statement::new(cypher.clone(), params.clone());
            self.run_batch(std::slice::from_ref(&stmt))
                .await
                .map(|_| ())
                .map_err(classify)
        })
        .await?;
        Ok(count)
    }

    async fn find_node(
        &self,
        label: NodeLabel,
        identity: PropertyBag,
    ) -> Result<Option<Node>, GraphError> {
        let match_clause = label
            .identity_keys()
            .iter()
            .map(|k| format!("{k}: ${k}"))
            .collect::<Vec<_>>()
            .join(", ");
        let cypher = format!(
            "MATCH (n:{label} {{ {match_clause} }}) RETURN n",
            label = label.as_str(),
        );
        let rowset = with_transaction(self.retry, || async {
            let stmt = Statement::new(cypher.clone(), identity.clone());
            let mut rows = self
                .run_batch(std::slice::from_ref(&stmt))
                .await
                .map_err(classify)?;
            Ok(rows.pop().unwrap_or_default())
        })
        .await?;
        Ok(rowset.rows.into_iter().next().map(|properties| Node {
            label: label.as_str().to_string(),
            properties,
        }))
    }

    async fn upsert_edges(&self, edge: EdgeSpec, rows: Vec<Row>) -> Result<usize, GraphError> {
        let merge_endpoint = |verb: &str| {
            if edge.label.may_create_missing_endpoints() {
                "MERGE".to_string()
            } else {
                verb.to_string()
            }
        };
        let from_match = edge
            .from_label
            .identity_keys()
            .iter()
            .map(|k| format!("{k}: row.from.{k}"))
            .collect::<Vec<_>>()
            .join(", ");
        let to_match = edge
            .to_label
            .identity_keys()
            .iter()
            .map(|k| format!("{k}: row.to.{k}"))
            .collect::<Vec<_>>()
            .join(", ");
        let cypher = format!(
            "UNWIND $rows AS row {match_from} (a:{from_label} {{ {from_match} }}) {match_to} (b:{to_label} {{ {to_match} }}) MERGE (a)-[r:{edge_label}]->(b) SET r += row.props",
            match_from = merge_endpoint("MATCH"),
            from_label = edge.from_label.as_str(),
            match_to = merge_endpoint("MATCH"),
            to_label = edge.to_label.as_str(),
            edge_label = edge.label.as_str(),
        );
        let count = rows.len();
        let mut params = PropertyBag::new();
        params.insert(
            "rows".to_string(),
            Value::Array(rows.into_iter().map(|m| Value::Object(m.into_iter().collect())).collect()),
        );
        with_transaction(self.retry, || async {
            let stmt = Statement::new(cypher.clone(), params.clone());
            self.run_batch(std::slice::from_ref(&stmt))
                .await
                .map(|_| ())
                .map_err(classify)
        })
        .await?;
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
        let cypher = format!(
            "CALL db.index.vector.queryNodes('{index}', $k, $embedding) YIELD node, score \
             WHERE score >= $min_score RETURN node, score",
            index = vector_index_name(label, property),
        );
        let mut params = PropertyBag::new();
        params.insert("k".to_string(), Value::from(k as i64));
        params.insert(
            "embedding".to_string(),
            Value::Array(embedding.iter().map(|f| Value::from(*f as f64)).collect()),
        );
        params.insert(
            "min_score".to_string(),
            Value::from(min_similarity.unwrap_or(f32::MIN) as f64),
        );
        let rowset = with_transaction(self.retry, || async {
            let stmt = Statement::new(cypher.clone(), params.clone());
            let mut rows = self
                .run_batch(std::slice::from_ref(&stmt))
                .await
                .map_err(classify)?;
            Ok(rows.pop().unwrap_or_default())
        })
        .await?;

        let mut out = Vec::with_capacity(rowset.rows.len());
        for row in rowset.rows {
            let properties = row
                .get("node")
                .and_then(|v| v.as_object())
                .map(|m| m.clone().into_iter().collect::<PropertyBag>())
                .unwrap_or_default();
            let score = row.get("score").and_then(|v| v.as_f64()).unwrap_or(0.0) as f32;
            out.push((
                Node {
                    label: label.as_str().to_string(),
                    properties,
                },
                score,
            ));
        }
        Ok(out)
    }
}

fn vector_index_name(label: NodeLabel, property: &str) -> String {
    format!("{}_{}_vector", label.as_str().to_lowercase(), property)
}

/// Constraints and vector indexes for every entity label.
fn schema_statements(force: bool) -> Vec<Statement> {
    let labels = [
        NodeLabel::File,
        NodeLabel::Directory,
        NodeLabel::Module,
        NodeLabel::Class,
        NodeLabel::Function,
        NodeLabel::Summary,
        NodeLabel::Documentation,
        NodeLabel::DocumentationEntity,
    ];
    let mut statements = Vec::new();
    for label in labels {
        if force {
            statements.push(Statement::new(
                format!(
                    "DROP CONSTRAINT {label}_identity IF EXISTS",
                    label = label.as_str().to_lowercase()
                ),
                PropertyBag::new(),
            ));
        }
        let keys = label
            .identity_keys()
            .iter()
            .map(|k| format!("n.{k}"))
            .collect::<Vec<_>>()
            .join(", ");
        statements.push(Statement::new(
            format!(
                "CREATE CONSTRAINT {name}_identity IF NOT EXISTS FOR (n:{label}) REQUIRE ({keys}) IS UNIQUE",
                name = label.as_str().to_lowercase(),
                label = label.as_str(),
                keys = keys,
            ),
            PropertyBag::new(),
        ));
        if label.has_vector_index() {
            statements.push(Statement::new(
                format!(
                    "CREATE VECTOR INDEX {index} IF NOT EXISTS FOR (n:{label}) ON (n.embedding)",
                    index = vector_index_name(label, "embedding"),
                    label = label.as_str(),
                ),
                PropertyBag::new(),
            ));
        }
    }
    statements
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vector_index_name_is_stable_and_lowercase() {
        assert_eq!(
            vector_index_name(NodeLabel::Summary, "embedding"),
            "summary_embedding_vector"
        );
    }

    #[test]
    fn schema_statements_cover_every_entity_label() {
        let statements = schema_statements(false);
        // 8 labels, one constraint each, plus 2 vector indexes (Summary, Documentation)
        assert_eq!(statements.len(), 8 + 2);
    }

    #[test]
    fn to_bolt_round_trips_scalar_json_kinds() {
        assert!(matches!(to_bolt(&Value::from(true)), BoltType::Boolean(_)));
        assert!(matches!(to_bolt(&Value::from(42)), BoltType::Integer(_)));
        assert!(matches!(to_bolt(&Value::from("x")), BoltType::String(_)));
    }
}
