// SPDX-License-Identifier: MIT

//! `codestory`: thin client for `codestoryd` — submit, status, list,
//! cancel, and watch ingestion jobs from the command line.

mod client;

use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use client::DaemonClient;
use codestory_core::JobState;
use codestory_daemon::protocol::{Request, RequestedStep, Response};
use codestory_engine::StepParams;
use std::path::PathBuf;

fn default_socket_path() -> PathBuf {
    std::env::var_os("CODESTORY_SOCKET")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("/tmp/codestory.sock"))
}

#[derive(Parser)]
#[command(name = "codestory", version, about = "Client for the codestory ingestion daemon")]
struct Cli {
    /// Path to the daemon's Unix-domain socket. Defaults to
    /// `$CODESTORY_SOCKET`, falling back to `/tmp/codestory.sock`.
    #[arg(long, global = true)]
    socket: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Submit a new ingestion job.
    Submit {
        repo_path: String,
        /// One step to run, `name` or `name:{"param":"value"}`; repeat for
        /// multiple steps.
        #[arg(long = "step", required = true)]
        steps: Vec<String>,
        #[arg(long)]
        job_id: Option<String>,
    },
    /// Show the current state of a job.
    Status { job_id: String },
    /// List known jobs.
    List {
        #[arg(long)]
        state: Option<String>,
        #[arg(long)]
        repo_path_prefix: Option<String>,
        #[arg(long, default_value_t = 0)]
        offset: usize,
        #[arg(long, default_value_t = 100)]
        limit: usize,
    },
    /// Request cancellation of a running job.
    Cancel { job_id: String },
    /// Stream progress events for a job until it ends or you Ctrl-C.
    Watch {
        job_id: String,
        #[arg(long)]
        since_sequence: Option<u64>,
    },
}

fn parse_step(raw: &str) -> Result<RequestedStep> {
    match raw.split_once(':') {
        Some((name, params_json)) => {
            let params: StepParams = serde_json::from_str(params_json)
                .with_context(|| format!("invalid params JSON for step '{name}'"))?;
            Ok(RequestedStep { name: name.to_string(), params })
        }
        None => Ok(RequestedStep { name: raw.to_string(), params: StepParams::new() }),
    }
}

fn parse_state(raw: &str) -> Result<JobState> {
    match raw {
        "pending" => Ok(JobState::Pending),
        "running" => Ok(JobState::Running),
        "succeeded" => Ok(JobState::Succeeded),
        "failed" => Ok(JobState::Failed),
        "cancelled" => Ok(JobState::Cancelled),
        other => Err(anyhow!("unknown job state '{other}'")),
    }
}

fn print_response(response: &Response) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(response)?);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let client = DaemonClient::new(cli.socket.unwrap_or_else(default_socket_path));

    match cli.command {
        Command::Submit { repo_path, steps, job_id } => {
            let steps = steps.iter().map(|s| parse_step(s)).collect::<Result<Vec<_>>>()?;
            let response = client.call(&Request::Submit { repo_path, steps, job_id }).await?;
            print_response(&response)?;
        }
        Command::Status { job_id } => {
            let response = client.call(&Request::Query { job_id }).await?;
            print_response(&response)?;
        }
        Command::List { state, repo_path_prefix, offset, limit } => {
            let state = state.map(|s| parse_state(&s)).transpose()?;
            let response = client
                .call(&Request::List {
                    state,
                    repo_path_prefix,
                    since_ms: None,
                    until_ms: None,
                    offset,
                    limit,
                })
                .await?;
            print_response(&response)?;
        }
        Command::Cancel { job_id } => {
            let response = client.call(&Request::Cancel { job_id }).await?;
            print_response(&response)?;
        }
        Command::Watch { job_id, since_sequence } => {
            client
                .subscribe(job_id, since_sequence, |event| {
                    if let Err(e) = print_response(&event) {
                        eprintln!("failed to print event: {e}");
                    }
                })
                .await?;
        }
    }
    Ok(())
}
