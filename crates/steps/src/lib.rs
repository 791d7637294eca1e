// SPDX-License-Identifier: MIT

// Allow panic!/unwrap/expect in test code
#![cfg_attr(test, allow(clippy::panic))]
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! codestory-steps: the four reference ingestion steps and the adapters
//! they depend on.
//!
//! - `filesystem`: walks the checked-out repository into `File`/
//!   `Directory` nodes.
//! - `ast_extract`: runs a containerized parser and turns its output into
//!   `Module`/`Class`/`Function` nodes and relationship edges.
//! - `summarizer`: asks an `LlmClient` to summarize each code entity in
//!   dependency order.
//! - `docgrapher`: parses documentation and links it to the entities it
//!   mentions.

mod ast_extract;
mod docgrapher;
mod errors;
mod filesystem;
mod hashing;
mod summarizer;

pub use ast_extract::{AstOutput, AstRecord, AstTool, ASTExtractStep, DockerAstTool};
pub use docgrapher::DocGrapherStep;
pub use filesystem::FilesystemStep;
pub use summarizer::llm::{HttpLlmClient, LlmClient, LlmConfig, SummaryPrompt, SummaryResult};
pub use summarizer::SummarizerStep;

#[cfg(any(test, feature = "test-support"))]
pub use ast_extract::FakeAstTool;
#[cfg(any(test, feature = "test-support"))]
pub use summarizer::llm::FakeLlmClient;

use std::sync::Arc;

/// Registers the four reference steps under the names other pipeline
/// configuration refers to them by: `filesystem`, `ast`, `summarizer`,
/// `docgrapher`.
pub fn register_default_steps(
    builder: codestory_engine::StepRegistryBuilder,
    ast_tool: Arc<dyn AstTool>,
    llm: Arc<dyn LlmClient>,
) -> codestory_engine::StepRegistryBuilder {
    let summarizer_llm = llm.clone();
    let docgrapher_llm = llm;
    builder
        .register("filesystem", || Box::new(FilesystemStep) as Box<dyn codestory_engine::Step>)
        .register("ast", move || {
            Box::new(ASTExtractStep::new(ast_tool.clone())) as Box<dyn codestory_engine::Step>
        })
        .register("summarizer", move || {
            Box::new(SummarizerStep::new(summarizer_llm.clone())) as Box<dyn codestory_engine::Step>
        })
        .register("docgrapher", move || {
            Box::new(DocGrapherStep::new(docgrapher_llm.clone())) as Box<dyn codestory_engine::Step>
        })
}
