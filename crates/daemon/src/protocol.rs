// SPDX-License-Identifier: MIT

//! Length-prefixed JSON wire protocol between `codestoryd` and its
//! clients (the CLI, or any other caller of the submit/query/list/cancel/
//! subscribe surface), adapted from the daemon's own request/response
//! framing: a 4-byte big-endian length prefix followed by a JSON body,
//! with a single tagged enum per direction.

use codestory_core::{CoreError, Job, JobState, ProgressEvent};
use codestory_engine::StepParams;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Generous but bounded: a `List` response carrying thousands of jobs
/// should never approach this, and a truncated/garbled length prefix is
/// caught long before it tries to allocate.
pub const MAX_MESSAGE_SIZE: usize = 64 * 1024 * 1024;
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("message of {size} bytes exceeds the {max} byte limit")]
    MessageTooLarge { size: usize, max: usize },
    #[error("connection closed before a full message was received")]
    ConnectionClosed,
    #[error("timed out waiting for a message")]
    Timeout,
}

/// One step entry within a `Submit` request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestedStep {
    pub name: String,
    #[serde(default)]
    pub params: StepParams,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Request {
    Submit {
        repo_path: String,
        steps: Vec<RequestedStep>,
        #[serde(default)]
        job_id: Option<String>,
    },
    Query {
        job_id: String,
    },
    List {
        #[serde(default)]
        state: Option<JobState>,
        #[serde(default)]
        repo_path_prefix: Option<String>,
        #[serde(default)]
        since_ms: Option<u64>,
        #[serde(default)]
        until_ms: Option<u64>,
        #[serde(default)]
        offset: usize,
        #[serde(default = "default_list_limit")]
        limit: usize,
    },
    Cancel {
        job_id: String,
    },
    Subscribe {
        job_id: String,
        #[serde(default)]
        since_sequence: Option<u64>,
    },
}

fn default_list_limit() -> usize {
    100
}

/// Wire shape of a submit/query/cancel failure, distinguished by `code`
/// rather than by parsing `message` so callers can dispatch on it.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "code", rename_all = "snake_case")]
pub enum RequestError {
    InvalidPipeline { message: String },
    RepoNotAccessible { message: String },
    NotFound { message: String },
    Internal { message: String },
}

impl From<CoreError> for RequestError {
    fn from(err: CoreError) -> Self {
        match err {
            CoreError::InvalidPipeline(message) => RequestError::InvalidPipeline { message },
            CoreError::RepoNotAccessible(message) => RequestError::RepoNotAccessible { message },
            CoreError::NotFound(message) => RequestError::NotFound { message },
            CoreError::AlreadyTerminal(message) => RequestError::Internal { message },
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Response {
    Submitted { job_id: String, state: JobState },
    Job { job: Job },
    Jobs { jobs: Vec<Job>, total: usize },
    Cancelled,
    Event { event: ProgressEvent },
    SubscriptionEnded,
    Error { error: RequestError },
}

pub fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>, ProtocolError> {
    let body = serde_json::to_vec(value)?;
    if body.len() > MAX_MESSAGE_SIZE {
        return Err(ProtocolError::MessageTooLarge {
            size: body.len(),
            max: MAX_MESSAGE_SIZE,
        });
    }
    let mut framed = Vec::with_capacity(4 + body.len());
    framed.extend_from_slice(&(body.len() as u32).to_be_bytes());
    framed.extend_from_slice(&body);
    Ok(framed)
}

pub fn decode<T: DeserializeOwned>(body: &[u8]) -> Result<T, ProtocolError> {
    Ok(serde_json::from_slice(body)?)
}

pub async fn write_message<W, T>(writer: &mut W, value: &T) -> Result<(), ProtocolError>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let framed = encode(value)?;
    writer.write_all(&framed).await?;
    writer.flush().await?;
    Ok(())
}

pub async fn read_message<R, T>(reader: &mut R, timeout: Duration) -> Result<T, ProtocolError>
where
    R: AsyncRead + Unpin,
    T: DeserializeOwned,
{
    tokio::time::timeout(timeout, read_message_inner(reader))
        .await
        .map_err(|_| ProtocolError::Timeout)?
}

async fn read_message_inner<R, T>(reader: &mut R) -> Result<T, ProtocolError>
where
    R: AsyncRead + Unpin,
    T: DeserializeOwned,
{
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
            return Err(ProtocolError::ConnectionClosed)
        }
        Err(e) => return Err(e.into()),
    }
    let len = u32::from_be_bytes(len_buf) as usize;
    if len > MAX_MESSAGE_SIZE {
        return Err(ProtocolError::MessageTooLarge {
            size: len,
            max: MAX_MESSAGE_SIZE,
        });
    }
    let mut body = vec![0u8; len];
    reader.read_exact(&mut body).await?;
    decode(&body)
}

pub async fn read_request<R: AsyncRead + Unpin>(
    reader: &mut R,
    timeout: Duration,
) -> Result<Request, ProtocolError> {
    read_message(reader, timeout).await
}

pub async fn write_request<W: AsyncWrite + Unpin>(
    writer: &mut W,
    request: &Request,
) -> Result<(), ProtocolError> {
    write_message(writer, request).await
}

pub async fn read_response<R: AsyncRead + Unpin>(
    reader: &mut R,
    timeout: Duration,
) -> Result<Response, ProtocolError> {
    read_message(reader, timeout).await
}

pub async fn write_response<W: AsyncWrite + Unpin>(
    writer: &mut W,
    response: &Response,
) -> Result<(), ProtocolError> {
    write_message(writer, response).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[tokio::test]
    async fn request_round_trips_through_the_wire_format() {
        let request = Request::Submit {
            repo_path: "/repo".to_string(),
            steps: vec![RequestedStep {
                name: "filesystem".to_string(),
                params: StepParams::new(),
            }],
            job_id: None,
        };
        let framed = encode(&request).unwrap();
        let mut cursor = Cursor::new(framed);
        let decoded: Request = read_message(&mut cursor, DEFAULT_TIMEOUT).await.unwrap();
        assert!(matches!(decoded, Request::Submit { repo_path, .. } if repo_path == "/repo"));
    }

    #[tokio::test]
    async fn oversized_length_prefix_is_rejected_before_allocating() {
        let mut framed = Vec::new();
        framed.extend_from_slice(&((MAX_MESSAGE_SIZE + 1) as u32).to_be_bytes());
        let mut cursor = Cursor::new(framed);
        let err = read_message::<_, Request>(&mut cursor, DEFAULT_TIMEOUT)
            .await
            .unwrap_err();
        assert!(matches!(err, ProtocolError::MessageTooLarge { .. }));
    }

    #[tokio::test]
    async fn truncated_stream_reports_connection_closed() {
        let mut cursor = Cursor::new(vec![0u8; 2]);
        let err = read_message::<_, Request>(&mut cursor, DEFAULT_TIMEOUT)
            .await
            .unwrap_err();
        assert!(matches!(err, ProtocolError::ConnectionClosed));
    }

    #[test]
    fn core_error_maps_to_a_tagged_request_error() {
        let err: RequestError = CoreError::NotFound("job-1".to_string()).into();
        assert!(matches!(err, RequestError::NotFound { .. }));
    }
}
