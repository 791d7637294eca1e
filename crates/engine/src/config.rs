// SPDX-License-Identifier: MIT

//! Pipeline configuration file format. Steps are declared in HCL
//! `steps { ... }` blocks with a nested `params` block; the simpler
//! `graph.*` connection section is TOML, mirroring this codebase's mixed
//! use of `hcl-rs` for structured blocks and `toml` for flatter metadata
//! files.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("HCL parse error: {0}")]
    Hcl(#[from] hcl::Error),
    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),
    #[error("invalid pipeline config: {0}")]
    Invalid(String),
}

/// One `steps { name = "..." ... }` entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StepConfig {
    pub name: String,
    pub concurrency: Option<usize>,
    pub max_retries: Option<u32>,
    pub back_off_seconds: Option<f64>,
    pub timeout_seconds: Option<u64>,
    #[serde(default)]
    pub params: HashMap<String, Value>,
}

/// Global retry defaults.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RetryConfig {
    pub max_retries: Option<u32>,
    pub back_off_seconds: Option<f64>,
    /// Whether any step failure fails the job outright; a configured
    /// policy, default `true`.
    #[serde(default = "default_fail_fast")]
    pub fail_fast: bool,
}

fn default_fail_fast() -> bool {
    true
}

/// GraphStore connection section.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct GraphConfig {
    pub uri: String,
    pub user: String,
    pub password: String,
    pub database: Option<String>,
    #[serde(default = "default_pool_size")]
    pub pool_size: u32,
    #[serde(default = "default_connection_timeout")]
    pub connection_timeout_seconds: u64,
    #[serde(default = "default_max_retry_time")]
    pub max_retry_time_seconds: u64,
}

fn default_pool_size() -> u32 {
    10
}
fn default_connection_timeout() -> u64 {
    10
}
fn default_max_retry_time() -> u64 {
    30
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
struct StepsDocument {
    #[serde(default)]
    steps: Vec<StepConfig>,
    #[serde(default)]
    retry: RetryConfig,
}

/// A fully parsed pipeline configuration.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub steps: Vec<StepConfig>,
    pub retry: RetryConfig,
    pub graph: GraphConfig,
}

impl PipelineConfig {
    /// Parse the `steps { ... }` / `retry { ... }` portion from HCL.
    pub fn parse_steps_hcl(content: &str) -> Result<(Vec<StepConfig>, RetryConfig), ConfigError> {
        let doc: StepsDocument = hcl::from_str(content)?;
        validate_step_names(&doc.steps)?;
        Ok((doc.steps, doc.retry))
    }

    /// Parse the `[graph]` section from TOML.
    pub fn parse_graph_toml(content: &str) -> Result<GraphConfig, ConfigError> {
        #[derive(Deserialize)]
        struct Wrapper {
            graph: GraphConfig,
        }
        let wrapper: Wrapper = toml::from_str(content)?;
        Ok(wrapper.graph)
    }

    /// Assemble a full config from its two source documents: the file
    /// format mixes step declarations and connection settings parsed
    /// independently, then merged here.
    pub fn assemble(hcl_content: &str, toml_content: &str) -> Result<Self, ConfigError> {
        let (steps, retry) = Self::parse_steps_hcl(hcl_content)?;
        let graph = Self::parse_graph_toml(toml_content)?;
        Ok(Self { steps, retry, graph })
    }

    pub fn step(&self, name: &str) -> Option<&StepConfig> {
        self.steps.iter().find(|s| s.name == name)
    }
}

fn validate_step_names(steps: &[StepConfig]) -> Result<(), ConfigError> {
    let mut seen = std::collections::HashSet::new();
    for step in steps {
        if step.name.is_empty() {
            return Err(ConfigError::Invalid("step name must not be empty".to_string()));
        }
        if !seen.insert(step.name.as_str()) {
            return Err(ConfigError::Invalid(format!(
                "duplicate step declaration: {}",
                step.name
            )));
        }
    }
    Ok(())
}
