// SPDX-License-Identifier: MIT

//! Graph entity kinds written by steps.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

/// Node labels the ingestion pipeline writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NodeLabel {
    File,
    Directory,
    Module,
    Class,
    Function,
    Summary,
    Documentation,
    DocumentationEntity,
}

impl NodeLabel {
    pub fn as_str(&self) -> &'static str {
        match self {
            NodeLabel::File => "File",
            NodeLabel::Directory => "Directory",
            NodeLabel::Module => "Module",
            NodeLabel::Class => "Class",
            NodeLabel::Function => "Function",
            NodeLabel::Summary => "Summary",
            NodeLabel::Documentation => "Documentation",
            NodeLabel::DocumentationEntity => "DocumentationEntity",
        }
    }

    /// Property names that form the `MERGE` identity key for this label.
    pub fn identity_keys(&self) -> &'static [&'static str] {
        match self {
            NodeLabel::File | NodeLabel::Directory => &["path"],
            NodeLabel::Module => &["name"],
            NodeLabel::Class | NodeLabel::Function => &["name", "module"],
            NodeLabel::Summary => &["entity_key"],
            NodeLabel::Documentation => &["path"],
            NodeLabel::DocumentationEntity => &["source_path", "text_range"],
        }
    }

    /// Labels that carry a vector-searchable embedding.
    pub fn has_vector_index(&self) -> bool {
        matches!(self, NodeLabel::Summary | NodeLabel::Documentation)
    }
}

/// Edge kinds the ingestion pipeline writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EdgeLabel {
    Contains,
    Imports,
    Calls,
    InheritsFrom,
    Defines,
    DocumentedBy,
    SummarizedBy,
    References,
}

impl EdgeLabel {
    pub fn as_str(&self) -> &'static str {
        match self {
            EdgeLabel::Contains => "CONTAINS",
            EdgeLabel::Imports => "IMPORTS",
            EdgeLabel::Calls => "CALLS",
            EdgeLabel::InheritsFrom => "INHERITS_FROM",
            EdgeLabel::Defines => "DEFINES",
            EdgeLabel::DocumentedBy => "DOCUMENTED_BY",
            EdgeLabel::SummarizedBy => "SUMMARIZED_BY",
            EdgeLabel::References => "REFERENCES",
        }
    }

    /// Whether this step contract permits creating missing endpoint nodes
    /// implicitly. Only `DocumentedBy` and `References` may create
    /// `DocumentationEntity` stubs; all other edges require both
    /// endpoints to already exist.
    pub fn may_create_missing_endpoints(&self) -> bool {
        matches!(self, EdgeLabel::DocumentedBy | EdgeLabel::References)
    }
}

/// A property bag for a node or edge, keyed by property name.
pub type PropertyBag = HashMap<String, Value>;

/// A node read back from the graph store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    pub label: String,
    pub properties: PropertyBag,
}

impl Node {
    pub fn property(&self, key: &str) -> Option<&Value> {
        self.properties.get(key)
    }
}

/// A single parameterized statement for `execute_batch`.
#[derive(Debug, Clone)]
pub struct Statement {
    pub query: String,
    pub params: PropertyBag,
}

impl Statement {
    pub fn new(query: impl Into<String>, params: PropertyBag) -> Self {
        Self {
            query: query.into(),
            params,
        }
    }
}

/// Rows returned from a read or write query.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RowSet {
    pub rows: Vec<PropertyBag>,
}

impl RowSet {
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn node_label_identity_keys_cover_each_label() {
        assert_eq!(NodeLabel::File.identity_keys(), &["path"]);
        assert_eq!(NodeLabel::Class.identity_keys(), &["name", "module"]);
    }

    #[test]
    fn only_summary_and_documentation_are_vector_indexed() {
        assert!(NodeLabel::Summary.has_vector_index());
        assert!(NodeLabel::Documentation.has_vector_index());
        assert!(!NodeLabel::Function.has_vector_index());
    }

    #[test]
    fn only_documentation_edges_may_create_stub_endpoints() {
        assert!(EdgeLabel::DocumentedBy.may_create_missing_endpoints());
        assert!(EdgeLabel::References.may_create_missing_endpoints());
        assert!(!EdgeLabel::Calls.may_create_missing_endpoints());
    }
}
