// SPDX-License-Identifier: MIT

//! Shared `GraphError` -> `ErrorRecord` classification so every step
//! reports failures through the same taxonomy instead of inventing its
//! own mapping.

use codestory_core::{ErrorKind, ErrorRecord};
use codestory_graph::GraphError;

pub(crate) fn classify_graph_error(step_name: &str, err: GraphError) -> ErrorRecord {
    let (kind, message) = match &err {
        GraphError::Transient(msg) => (ErrorKind::TransientGraphError, msg.clone()),
        GraphError::Query { query, cause } => {
            (ErrorKind::QueryError, format!("{cause} (query: {})", codestory_core::redact(query)))
        }
        GraphError::Schema(msg) => (ErrorKind::SchemaError, msg.clone()),
        GraphError::Connection(msg) => (ErrorKind::ConnectionError, codestory_core::redact(msg)),
    };
    ErrorRecord::new(kind, message).with_step(step_name)
}
