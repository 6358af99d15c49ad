//! Shared helpers for integration tests: an in-memory dataset layer and an
//! in-process fake engine speaking the line-JSON RPC protocol.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream, UnixListener};

use cage::dataset::{DatasetError, DatasetResult, Datasets};
use cage_protocol::RpcRequest;

/// Dataset layer backed by plain directories under a temp root. Records
/// every create call so tests can assert idempotence.
pub struct MemDatasets {
    root: PathBuf,
    existing: Mutex<HashSet<String>>,
    creates: Mutex<Vec<String>>,
}

impl MemDatasets {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            existing: Mutex::new(HashSet::new()),
            creates: Mutex::new(Vec::new()),
        }
    }

    /// Pre-register an existing dataset (directory is created too).
    pub fn register(&self, name: &str) -> PathBuf {
        let mountpoint = self.root.join(name);
        std::fs::create_dir_all(&mountpoint).unwrap();
        self.existing.lock().unwrap().insert(name.to_string());
        mountpoint
    }

    pub fn create_calls(&self) -> Vec<String> {
        self.creates.lock().unwrap().clone()
    }
}

#[async_trait]
impl Datasets for MemDatasets {
    async fn exists(&self, name: &str) -> DatasetResult<bool> {
        Ok(self.existing.lock().unwrap().contains(name))
    }

    async fn create(&self, name: &str) -> DatasetResult<()> {
        std::fs::create_dir_all(self.root.join(name))?;
        self.existing.lock().unwrap().insert(name.to_string());
        self.creates.lock().unwrap().push(name.to_string());
        Ok(())
    }

    async fn mountpoint(&self, name: &str) -> DatasetResult<PathBuf> {
        if !self.existing.lock().unwrap().contains(name) {
            return Err(DatasetError::CommandFailed {
                dataset: name.to_string(),
                stderr: "dataset does not exist".to_string(),
            });
        }
        Ok(self.root.join(name))
    }
}

/// Serve scripted responses on a unix socket. Each connection carries one
/// request; the handler returns the raw response lines to write back.
pub fn spawn_engine<F>(socket: &Path, handler: F)
where
    F: Fn(RpcRequest) -> Vec<String> + Send + Sync + 'static,
{
    let listener = UnixListener::bind(socket).expect("bind engine socket");
    let handler = Arc::new(handler);
    tokio::spawn(async move {
        loop {
            let Ok((stream, _)) = listener.accept().await else {
                break;
            };
            let handler = Arc::clone(&handler);
            tokio::spawn(async move {
                let (read, mut write) = stream.into_split();
                let mut lines = BufReader::new(read).lines();
                if let Ok(Some(line)) = lines.next_line().await {
                    let request: RpcRequest =
                        serde_json::from_str(&line).expect("well-formed request");
                    for mut response in handler(request) {
                        response.push('\n');
                        let _ = write.write_all(response.as_bytes()).await;
                    }
                }
            });
        }
    });
}

/// Serve scripted responses over HTTP for the POST transport. The handler
/// maps each request to a status code and response body; one request per
/// connection. Returns the endpoint URL.
pub async fn spawn_http_engine<F>(handler: F) -> String
where
    F: Fn(RpcRequest) -> (u16, String) + Send + Sync + 'static,
{
    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind http engine");
    let url = format!("http://{}/rpc", listener.local_addr().unwrap());
    let handler = Arc::new(handler);
    tokio::spawn(async move {
        loop {
            let Ok((mut stream, _)) = listener.accept().await else {
                break;
            };
            let handler = Arc::clone(&handler);
            tokio::spawn(async move {
                let request = read_http_request(&mut stream).await;
                let (status, body) = handler(request);
                let reason = if status == 404 { "Not Found" } else { "OK" };
                let response = format!(
                    "HTTP/1.1 {status} {reason}\r\n\
                     content-type: application/json\r\n\
                     content-length: {}\r\n\
                     connection: close\r\n\r\n{body}",
                    body.len()
                );
                let _ = stream.write_all(response.as_bytes()).await;
            });
        }
    });
    url
}

/// Minimal HTTP/1.1 request reader: headers, then a content-length body
/// carrying the JSON envelope.
async fn read_http_request(stream: &mut TcpStream) -> RpcRequest {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 1024];
    let header_end = loop {
        if let Some(pos) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
            break pos + 4;
        }
        let n = stream.read(&mut chunk).await.expect("read request head");
        assert!(n > 0, "connection closed mid-request");
        buf.extend_from_slice(&chunk[..n]);
    };
    let head = String::from_utf8_lossy(&buf[..header_end]).to_string();
    let length: usize = head
        .lines()
        .find_map(|line| {
            let (name, value) = line.split_once(':')?;
            if name.eq_ignore_ascii_case("content-length") {
                value.trim().parse().ok()
            } else {
                None
            }
        })
        .expect("content-length header");
    while buf.len() < header_end + length {
        let n = stream.read(&mut chunk).await.expect("read request body");
        assert!(n > 0, "connection closed mid-body");
        buf.extend_from_slice(&chunk[..n]);
    }
    serde_json::from_slice(&buf[header_end..header_end + length]).expect("well-formed request")
}

/// Records every request the fake engine receives.
#[derive(Clone, Default)]
pub struct RequestLog(Arc<Mutex<Vec<RpcRequest>>>);

impl RequestLog {
    pub fn push(&self, request: RpcRequest) {
        self.0.lock().unwrap().push(request);
    }

    pub fn method(&self, method: &str) -> Option<RpcRequest> {
        self.0
            .lock()
            .unwrap()
            .iter()
            .find(|r| r.method == method)
            .cloned()
    }
}
