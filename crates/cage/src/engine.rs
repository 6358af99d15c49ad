//! RPC transport to the engine daemon.
//!
//! One connection per call, exactly one in-flight call per connection.
//! Requests and responses are newline-delimited JSON envelopes correlated by
//! `id` over a unix-domain socket, or the same envelope POSTed to an HTTP
//! endpoint. No pooling, no retries; callers decide whether to retry.

use std::path::{Path, PathBuf};

use log::{debug, warn};
use serde_json::{Value, json};
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixStream;

use cage_protocol::{LaunchRequest, RpcRequest, RpcResponse, TtyEndpoints, methods};

/// Result type for engine calls.
pub type EngineResult<T> = Result<T, EngineError>;

/// Errors that can occur while talking to the engine.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Connection or socket IO failure before any verdict was received.
    #[error("engine transport error: {0}")]
    Io(#[from] std::io::Error),

    /// HTTP transport failure.
    #[error("engine transport error: {0}")]
    Http(#[from] reqwest::Error),

    /// The channel ended without a response settling the call.
    #[error("connection closed before a matching response")]
    Disconnected,

    /// The engine returned a structured error payload, surfaced verbatim.
    #[error("engine error: {0}")]
    Remote(Value),

    /// The engine's 404-equivalent, e.g. stopping an unknown container.
    #[error("container \"{0}\" not found")]
    NotFound(String),

    /// A response that was not a valid envelope.
    #[error("malformed engine response: {0}")]
    Protocol(#[from] serde_json::Error),
}

/// How the engine is reached.
#[derive(Debug, Clone)]
pub enum EngineTransport {
    /// Connection-oriented local channel.
    Unix(PathBuf),
    /// HTTP POST of the envelope to a fixed endpoint path.
    Http(String),
}

/// Client for the engine's correlation-id RPC protocol.
#[derive(Debug, Clone)]
pub struct EngineClient {
    transport: EngineTransport,
}

impl EngineClient {
    pub fn new(transport: EngineTransport) -> Self {
        Self { transport }
    }

    /// Invoke a remote operation and wait for its verdict.
    pub async fn call(&self, method: &str, body: Value) -> EngineResult<Value> {
        let request = RpcRequest::new(method, body);
        debug!("engine call {} (id {})", method, request.id);
        match &self.transport {
            EngineTransport::Unix(path) => self.call_unix(path, &request).await,
            EngineTransport::Http(url) => self.call_http(url, &request).await,
        }
    }

    async fn call_unix(&self, path: &Path, request: &RpcRequest) -> EngineResult<Value> {
        let mut stream = UnixStream::connect(path).await?;

        let mut line = serde_json::to_string(request)?;
        line.push('\n');
        stream.write_all(line.as_bytes()).await?;

        let mut lines = BufReader::new(stream).lines();
        while let Some(line) = lines.next_line().await? {
            if line.trim().is_empty() {
                continue;
            }
            let response: RpcResponse = serde_json::from_str(&line)?;
            if let Some(verdict) = settle(&request.id, response) {
                return verdict;
            }
        }
        Err(EngineError::Disconnected)
    }

    async fn call_http(&self, url: &str, request: &RpcRequest) -> EngineResult<Value> {
        let client = reqwest::Client::new();
        let http_response = client.post(url).json(request).send().await?;
        if http_response.status() == reqwest::StatusCode::NOT_FOUND {
            return Err(EngineError::NotFound(String::new()));
        }
        let response: RpcResponse = http_response.json().await?;
        settle(&request.id, response).unwrap_or(Err(EngineError::Disconnected))
    }

    /// Start a container. An error here aborts the launch.
    pub async fn run_container(&self, body: &LaunchRequest) -> EngineResult<Value> {
        self.call(methods::RUN_CONTAINER, serde_json::to_value(body)?)
            .await
    }

    /// Stop a running container. An unknown name is reported as not-found
    /// rather than a generic failure.
    pub async fn stop_container(&self, name: &str) -> EngineResult<Value> {
        self.call(methods::STOP_CONTAINER, json!({ "name": name }))
            .await
            .map_err(|err| match err {
                EngineError::NotFound(_) => EngineError::NotFound(name.to_string()),
                other => other,
            })
    }

    /// Suspend until the named container exits. Typically spawned in the
    /// background so the invoking process can finish promptly once the
    /// container terminates.
    pub async fn wait_container(&self, name: &str) -> EngineResult<Value> {
        self.call(methods::WAIT_CONTAINER, json!({ "name": name }))
            .await
    }

    /// Allocate an interactive terminal for a running container.
    pub async fn get_tty(&self, name: &str) -> EngineResult<TtyEndpoints> {
        let result = self.call(methods::GET_TTY, json!({ "name": name })).await?;
        Ok(serde_json::from_value(result)?)
    }
}

/// Verdict for one response envelope, if it settles the call.
///
/// A response carrying an `error` fails the call even when its `id` does not
/// match. That relaxed check is deliberate and safe here because each
/// connection carries a single in-flight call; keep that constraint if this
/// client ever grows multiplexing. A result for a foreign `id` is ignored
/// and reading continues.
fn settle(id: &str, response: RpcResponse) -> Option<EngineResult<Value>> {
    if let Some(error) = response.error {
        return Some(Err(remote_error(error)));
    }
    if response.id.as_deref() == Some(id) {
        return Some(Ok(response.result.unwrap_or(Value::Null)));
    }
    warn!(
        "ignoring response for foreign id {:?} (expected {})",
        response.id, id
    );
    None
}

/// Map an engine error payload; a `code` of 404 is the engine's not-found.
fn remote_error(error: Value) -> EngineError {
    match error.get("code").and_then(Value::as_i64) {
        Some(404) => EngineError::NotFound(
            error
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
        ),
        _ => EngineError::Remote(error),
    }
}
