// SPDX-License-Identifier: MIT

//! Unix-domain-socket accept loop and per-connection request dispatch:
//! one task per connection, all sharing a `ListenCtx` behind an `Arc`,
//! adapted from the daemon's own listener (`ListenCtx` + `Listener::run`
//! + a flat `match` dispatching to small handler functions), narrowed to
//! the five-operation submit/query/list/cancel/subscribe surface.

use crate::progress_bus::ProgressBus;
use crate::protocol::{self, ProtocolError, Request, RequestError, Response};
use crate::Orchestrator;
use codestory_core::{JobId, JobState};
use codestory_engine::StepParams;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use thiserror::Error;
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::broadcast;
use tracing::{error, warn};

pub struct ListenCtx {
    pub orchestrator: Orchestrator,
    pub progress_bus: Arc<ProgressBus>,
}

#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),
}

pub struct Listener {
    socket: UnixListener,
    ctx: Arc<ListenCtx>,
}

impl Listener {
    pub fn bind(path: &Path, ctx: Arc<ListenCtx>) -> std::io::Result<Self> {
        if path.exists() {
            std::fs::remove_file(path)?;
        }
        let socket = UnixListener::bind(path)?;
        Ok(Self { socket, ctx })
    }

    pub async fn run(self) {
        loop {
            match self.socket.accept().await {
                Ok((stream, _addr)) => {
                    let ctx = self.ctx.clone();
                    tokio::spawn(async move {
                        if let Err(e) = handle_connection(stream, ctx).await {
                            warn!(error = %e, "connection ended with an error");
                        }
                    });
                }
                Err(e) => error!(error = %e, "accept failed"),
            }
        }
    }
}

async fn handle_connection(stream: UnixStream, ctx: Arc<ListenCtx>) -> Result<(), ConnectionError> {
    let (mut reader, mut writer) = stream.into_split();
    let request = protocol::read_request(&mut reader, protocol::DEFAULT_TIMEOUT).await?;
    match request {
        Request::Submit { repo_path, steps, job_id } => {
            let response = handle_submit(&ctx, repo_path, steps, job_id);
            protocol::write_response(&mut writer, &response).await?;
        }
        Request::Query { job_id } => {
            let response = handle_query(&ctx, &job_id);
            protocol::write_response(&mut writer, &response).await?;
        }
        Request::List { state, repo_path_prefix, since_ms, until_ms, offset, limit } => {
            let response = handle_list(&ctx, state, repo_path_prefix, since_ms, until_ms, offset, limit);
            protocol::write_response(&mut writer, &response).await?;
        }
        Request::Cancel { job_id } => {
            let response = handle_cancel(&ctx, &job_id);
            protocol::write_response(&mut writer, &response).await?;
        }
        Request::Subscribe { job_id, since_sequence } => {
            handle_subscribe(&mut writer, &ctx, &job_id, since_sequence).await?;
        }
    }
    Ok(())
}

fn handle_submit(
    ctx: &ListenCtx,
    repo_path: String,
    steps: Vec<protocol::RequestedStep>,
    _job_id: Option<String>,
) -> Response {
    let requested: Vec<(String, StepParams)> =
        steps.into_iter().map(|s| (s.name, s.params)).collect();
    match ctx.orchestrator.submit(repo_path, requested) {
        Ok(job_id) => {
            let state = ctx
                .orchestrator
                .get_job(&job_id)
                .map(|j| j.state)
                .unwrap_or(JobState::Pending);
            Response::Submitted { job_id: job_id.to_string(), state }
        }
        Err(e) => Response::Error { error: e.into() },
    }
}

fn handle_query(ctx: &ListenCtx, job_id: &str) -> Response {
    let job_id = JobId::new(job_id);
    match ctx.orchestrator.get_job(&job_id) {
        Some(job) => Response::Job { job },
        None => Response::Error {
            error: RequestError::NotFound {
                message: format!("no such job: {job_id}"),
            },
        },
    }
}

#[allow(clippy::too_many_arguments)]
fn handle_list(
    ctx: &ListenCtx,
    state: Option<JobState>,
    repo_path_prefix: Option<String>,
    since_ms: Option<u64>,
    until_ms: Option<u64>,
    offset: usize,
    limit: usize,
) -> Response {
    let mut jobs = ctx.orchestrator.list_jobs();
    jobs.sort_by(|a, b| b.created_at_ms.cmp(&a.created_at_ms).then_with(|| a.id.as_str().cmp(b.id.as_str())));

    jobs.retain(|job| {
        state.map_or(true, |s| job.state == s)
            && repo_path_prefix.as_deref().map_or(true, |p| job.repo_path.starts_with(p))
            && since_ms.map_or(true, |t| job.created_at_ms >= t)
            && until_ms.map_or(true, |t| job.created_at_ms <= t)
    });

    let total = jobs.len();
    let page = jobs.into_iter().skip(offset).take(limit).collect();
    Response::Jobs { jobs: page, total }
}

fn handle_cancel(ctx: &ListenCtx, job_id: &str) -> Response {
    let job_id = JobId::new(job_id);
    match ctx.orchestrator.cancel(&job_id) {
        Ok(()) => Response::Cancelled,
        // Cancelling an already-terminal job is a documented no-op success
        // (external "Cancel job" is idempotent), not a client-facing error.
        Err(codestory_core::CoreError::AlreadyTerminal(_)) => Response::Cancelled,
        Err(e) => Response::Error { error: e.into() },
    }
}

async fn handle_subscribe<W>(
    writer: &mut W,
    ctx: &ListenCtx,
    job_id: &str,
    since_sequence: Option<u64>,
) -> Result<(), ConnectionError>
where
    W: tokio::io::AsyncWrite + Unpin,
{
    let job_id = JobId::new(job_id);
    if ctx.orchestrator.get_job(&job_id).is_none() {
        let response = Response::Error {
            error: RequestError::NotFound {
                message: format!("no such job: {job_id}"),
            },
        };
        protocol::write_response(writer, &response).await?;
        return Ok(());
    }

    let mut receiver = ctx.progress_bus.subscribe(&job_id);
    let mut last_sent: HashMap<Option<String>, u64> = HashMap::new();

    for event in ctx.orchestrator.replay_events(&job_id, since_sequence.unwrap_or(0)) {
        last_sent.insert(event.step_name.clone(), event.sequence);
        if protocol::write_response(writer, &Response::Event { event }).await.is_err() {
            return Ok(());
        }
    }

    loop {
        match receiver.recv().await {
            Ok(event) => {
                let already_sent = last_sent.get(&event.step_name).is_some_and(|&s| s >= event.sequence);
                if already_sent {
                    continue;
                }
                last_sent.insert(event.step_name.clone(), event.sequence);
                if protocol::write_response(writer, &Response::Event { event }).await.is_err() {
                    return Ok(());
                }
            }
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!(job = %job_id, skipped, "subscriber lagged behind progress events, resuming from the oldest retained one");
            }
            Err(broadcast::error::RecvError::Closed) => {
                let _ = protocol::write_response(writer, &Response::SubscriptionEnded).await;
                return Ok(());
            }
        }
    }
}
