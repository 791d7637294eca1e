// SPDX-License-Identifier: MIT

//! Minimal daemon client: connect, send one request, read one response (or,
//! for `Subscribe`, keep reading framed `Response::Event`s until the
//! daemon ends the stream).

use codestory_daemon::protocol::{self, ProtocolError, Request, Response};
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;
use tokio::net::UnixStream;

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("could not connect to codestoryd at {path}: {source}")]
    Connect { path: PathBuf, source: std::io::Error },
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),
}

pub struct DaemonClient {
    socket_path: PathBuf,
    timeout: Duration,
}

impl DaemonClient {
    pub fn new(socket_path: PathBuf) -> Self {
        Self { socket_path, timeout: Duration::from_secs(30) }
    }

    async fn connect(&self) -> Result<UnixStream, ClientError> {
        UnixStream::connect(&self.socket_path)
            .await
            .map_err(|source| ClientError::Connect { path: self.socket_path.clone(), source })
    }

    /// Send a single request and return its single response. Must not be
    /// used for `Request::Subscribe`; use `subscribe` instead.
    pub async fn call(&self, request: &Request) -> Result<Response, ClientError> {
        let mut stream = self.connect().await?;
        protocol::write_request(&mut stream, request).await?;
        let response = protocol::read_response(&mut stream, self.timeout).await?;
        Ok(response)
    }

    /// Send a `Subscribe` request and invoke `on_event` for every event
    /// the daemon streams back, until the subscription ends or the
    /// connection is closed.
    pub async fn subscribe(
        &self,
        job_id: String,
        since_sequence: Option<u64>,
        mut on_event: impl FnMut(Response),
    ) -> Result<(), ClientError> {
        let mut stream = self.connect().await?;
        protocol::write_request(&mut stream, &Request::Subscribe { job_id, since_sequence }).await?;
        loop {
            match protocol::read_response(&mut stream, self.timeout).await {
                Ok(response @ Response::Event { .. }) => on_event(response),
                Ok(response @ Response::Error { .. }) => {
                    on_event(response);
                    return Ok(());
                }
                Ok(Response::SubscriptionEnded) | Err(ProtocolError::ConnectionClosed) => {
                    return Ok(())
                }
                Ok(other) => {
                    on_event(other);
                    return Ok(());
                }
                Err(e) => return Err(e.into()),
            }
        }
    }
}
