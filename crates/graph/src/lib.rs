// SPDX-License-Identifier: MIT

#![cfg_attr(test, allow(clippy::panic))]
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! codestory-graph: the `GraphStore` adapter and the entity set steps
//! write.
//!
//! - `entity`: `NodeLabel`, `EdgeLabel`, and the wire row/statement types.
//! - `store`: the `GraphStore` trait and the transient-error retry wrapper.
//! - `neo4j`: the real `neo4rs`-backed implementation.
//! - `memory` (feature `test-support`): an in-process fake for tests.

pub mod entity;
pub mod neo4j;
pub mod store;

#[cfg(any(test, feature = "test-support"))]
pub mod memory;

pub use entity::{EdgeLabel, Node, NodeLabel, PropertyBag, RowSet, Statement};
pub use neo4j::{Neo4jConfig, Neo4jGraphStore};
pub use store::{
    edge_row, module_identity, named_in_module, path_identity, with_transaction, EdgeSpec,
    GraphError, GraphStore, Row,
};

#[cfg(any(test, feature = "test-support"))]
pub use memory::InMemoryGraphStore;
