//! Upstream tool-provider client.
//!
//! The bridge proxies authenticated tool calls to a single external
//! protocol endpoint: a child process spoken to over newline-delimited
//! JSON-RPC on stdio. [`ToolProvider`] is the seam the server depends on,
//! so tests can substitute a scripted provider.

use async_trait::async_trait;
use serde_json::{json, Value};
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::Mutex;
use tracing::{debug, error, warn};

use tabbridge_core::protocol::{codes, JsonRpcRequest, JsonRpcResponse, RequestId};
use tabbridge_core::{Error, Result};
use tabbridge_transport::PendingRequests;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

#[async_trait]
pub trait ToolProvider: Send + Sync {
    /// Establish the upstream connection. No-op when already connected.
    async fn connect(&self) -> Result<()>;

    async fn connected(&self) -> bool;

    /// Forward a tool-call envelope. The reply is always a well-formed
    /// response tagged with the original request id.
    async fn call_tool(&self, request: &JsonRpcRequest) -> JsonRpcResponse;

    /// Forward a list request, tagged with the caller's id.
    async fn list_tools(&self, id: Option<RequestId>) -> JsonRpcResponse;

    /// Best-effort teardown; close-time errors are swallowed.
    async fn disconnect(&self);
}

struct UpstreamConn {
    stdin: Arc<Mutex<ChildStdin>>,
    child: Child,
    reader: tokio::task::JoinHandle<()>,
}

pub struct UpstreamClient {
    command: String,
    args: Vec<String>,
    next_id: AtomicU64,
    pending: PendingRequests<u64>,
    conn: Mutex<Option<UpstreamConn>>,
}

impl UpstreamClient {
    pub fn new(command: &str, args: &[String]) -> Self {
        Self {
            command: command.to_string(),
            args: args.to_vec(),
            next_id: AtomicU64::new(1),
            pending: PendingRequests::new(),
            conn: Mutex::new(None),
        }
    }

    /// Send one JSON-RPC request and await the correlated response.
    async fn request(&self, method: &str, params: Option<Value>) -> Result<Value> {
        let stdin = {
            let conn = self.conn.lock().await;
            let conn = conn
                .as_ref()
                .ok_or_else(|| Error::Transport("upstream not connected".to_string()))?;
            conn.stdin.clone()
        };

        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let req = JsonRpcRequest::new(id, method, params);
        let line = serde_json::to_string(&req)?;
        debug!(id, method, "upstream → request");

        let rx = self.pending.register(id).await;
        {
            let mut stdin = stdin.lock().await;
            let write = async {
                stdin.write_all(line.as_bytes()).await?;
                stdin.write_all(b"\n").await?;
                stdin.flush().await
            };
            if let Err(e) = write.await {
                self.pending
                    .complete(&id, Err(Error::Transport("write failed".to_string())))
                    .await;
                return Err(Error::Transport(format!("upstream write error: {}", e)));
            }
        }

        self.pending.wait(&id, rx, REQUEST_TIMEOUT).await
    }

    /// Reader task: dispatches newline-delimited responses to waiters.
    async fn reader_task(stdout: ChildStdout, pending: PendingRequests<u64>) {
        let reader = BufReader::new(stdout);
        let mut lines = reader.lines();

        loop {
            match lines.next_line().await {
                Ok(Some(line)) if !line.trim().is_empty() => {
                    let value: Value = match serde_json::from_str(&line) {
                        Ok(v) => v,
                        Err(e) => {
                            warn!(error = %e, "upstream: unparseable line");
                            continue;
                        }
                    };
                    let Some(id) = value.get("id").and_then(|v| v.as_u64()) else {
                        // notifications have no id
                        continue;
                    };
                    let outcome = if let Some(err) = value.get("error") {
                        let code = err.get("code").and_then(|c| c.as_i64()).unwrap_or(0);
                        let message = err
                            .get("message")
                            .and_then(|m| m.as_str())
                            .unwrap_or("upstream error");
                        Err(Error::Transport(format!(
                            "upstream error {}: {}",
                            code, message
                        )))
                    } else {
                        Ok(value.get("result").cloned().unwrap_or(Value::Null))
                    };
                    pending.complete(&id, outcome).await;
                }
                Ok(Some(_)) => {} // blank line
                Ok(None) => {
                    error!("upstream: stdout closed");
                    pending
                        .fail_all(|| Error::Transport("upstream closed".to_string()))
                        .await;
                    break;
                }
                Err(e) => {
                    error!(error = %e, "upstream: read error");
                    break;
                }
            }
        }
    }

    /// Protocol handshake: initialize plus the initialized notification.
    async fn initialize(&self) -> Result<()> {
        let params = json!({
            "protocolVersion": "2024-11-05",
            "capabilities": {},
            "clientInfo": {
                "name": "tabbridge",
                "version": env!("CARGO_PKG_VERSION"),
            }
        });
        let result = self.request("initialize", Some(params)).await?;
        debug!(?result, "upstream initialized");

        let notif = json!({"jsonrpc": "2.0", "method": "notifications/initialized"});
        let stdin = {
            let conn = self.conn.lock().await;
            match conn.as_ref() {
                Some(c) => c.stdin.clone(),
                None => return Ok(()),
            }
        };
        let mut stdin = stdin.lock().await;
        let _ = stdin.write_all(notif.to_string().as_bytes()).await;
        let _ = stdin.write_all(b"\n").await;
        let _ = stdin.flush().await;
        Ok(())
    }
}

#[async_trait]
impl ToolProvider for UpstreamClient {
    async fn connect(&self) -> Result<()> {
        {
            let conn = self.conn.lock().await;
            if conn.is_some() {
                return Ok(());
            }
        }
        if self.command.trim().is_empty() {
            return Err(Error::Config(
                "upstream command is not configured".to_string(),
            ));
        }

        let mut child = Command::new(&self.command)
            .args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                Error::Transport(format!("failed to spawn '{}': {}", self.command, e))
            })?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| Error::Transport("upstream has no stdin".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| Error::Transport("upstream has no stdout".to_string()))?;

        let reader = tokio::spawn(Self::reader_task(stdout, self.pending.clone()));
        {
            let mut conn = self.conn.lock().await;
            *conn = Some(UpstreamConn {
                stdin: Arc::new(Mutex::new(stdin)),
                child,
                reader,
            });
        }

        self.initialize().await
    }

    async fn connected(&self) -> bool {
        self.conn.lock().await.is_some()
    }

    async fn call_tool(&self, request: &JsonRpcRequest) -> JsonRpcResponse {
        let id = request.id.clone();
        let params = match request.params.as_ref().and_then(|p| p.get("name")) {
            Some(Value::String(_)) => request.params.clone().unwrap(),
            _ => {
                return JsonRpcResponse::failure(
                    id,
                    codes::INVALID_REQUEST,
                    "tool call requires params with a tool name",
                );
            }
        };

        match self.request("tools/call", Some(params)).await {
            Ok(result) => JsonRpcResponse::success(id, result),
            Err(e) => JsonRpcResponse::failure(id, codes::EXECUTION_ERROR, e.to_string()),
        }
    }

    async fn list_tools(&self, id: Option<RequestId>) -> JsonRpcResponse {
        match self.request("tools/list", None).await {
            Ok(result) => JsonRpcResponse::success(id, result),
            Err(e) => JsonRpcResponse::failure(id, codes::EXECUTION_ERROR, e.to_string()),
        }
    }

    async fn disconnect(&self) {
        let conn = self.conn.lock().await.take();
        if let Some(mut conn) = conn {
            conn.reader.abort();
            let _ = conn.child.kill().await;
        }
        self.pending
            .fail_all(|| Error::Transport("upstream disconnected".to_string()))
            .await;
    }
}
