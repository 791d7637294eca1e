// SPDX-License-Identifier: MIT

//! `codestoryd`: the daemon binary. Reads pipeline configuration from the
//! paths given on the command line (or the defaults below), binds the
//! Unix-domain socket, and serves submit/query/list/cancel/subscribe
//! requests until killed.

use codestory_daemon::{bootstrap, DaemonConfig};
use codestory_engine::PipelineConfig;
use codestory_steps::LlmConfig;
use std::path::PathBuf;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

fn default_socket_path() -> PathBuf {
    std::env::var_os("CODESTORY_SOCKET")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("/tmp/codestory.sock"))
}

fn default_data_dir() -> PathBuf {
    std::env::var_os("CODESTORY_DATA_DIR")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("/var/lib/codestory"))
}

fn read_or_exit(path: &std::path::Path, what: &str) -> String {
    match std::fs::read_to_string(path) {
        Ok(content) => content,
        Err(e) => {
            eprintln!("failed to read {what} at {}: {e}", path.display());
            std::process::exit(1);
        }
    }
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let mut args = std::env::args().skip(1);
    let steps_path = args
        .next()
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("codestory.hcl"));
    let graph_path = args
        .next()
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("codestory.graph.toml"));

    let hcl_content = read_or_exit(&steps_path, "pipeline step configuration");
    let toml_content = read_or_exit(&graph_path, "graph connection configuration");
    let pipeline = match PipelineConfig::assemble(&hcl_content, &toml_content) {
        Ok(pipeline) => pipeline,
        Err(e) => {
            eprintln!("invalid pipeline configuration: {e}");
            std::process::exit(1);
        }
    };

    let config = DaemonConfig {
        socket_path: default_socket_path(),
        data_dir: default_data_dir(),
        pipeline,
        llm: LlmConfig {
            base_url: std::env::var("CODESTORY_LLM_URL")
                .unwrap_or_else(|_| "http://localhost:8081".to_string()),
            api_key: std::env::var("CODESTORY_LLM_API_KEY").unwrap_or_default(),
            model: std::env::var("CODESTORY_LLM_MODEL").unwrap_or_else(|_| "codestory-summarizer".to_string()),
            timeout: Duration::from_secs(60),
        },
        progress_bus_capacity: 256,
        event_log_ttl: Duration::from_secs(3600),
    };

    let listener = match bootstrap(config).await {
        Ok(listener) => listener,
        Err(e) => {
            eprintln!("failed to start codestoryd: {e}");
            std::process::exit(1);
        }
    };

    tracing::info!("codestoryd listening");
    listener.run().await;
}
