//! WebSocket bridge server.
//!
//! Terminates many inbound connections, authenticates each into a
//! [`Session`], rate-limits it, and proxies tool-call envelopes to the
//! upstream [`ToolProvider`]. A periodic sweep expires idle sessions.

use axum::extract::ws::{CloseFrame, Message as WsMessage, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Json;
use futures::{SinkExt, StreamExt};
use serde_json::{json, Value};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, Mutex};
use tower_http::cors::CorsLayer;
use tracing::{debug, info, warn};

use crate::auth::ApiKeyValidator;
use crate::session::{RateLimitConfig, Session, SessionCommand, SessionTable};
use crate::upstream::ToolProvider;
use tabbridge_core::protocol::{
    codes, ClientMessage, JsonRpcResponse, ServerMessage, CLOSE_NORMAL, CLOSE_POLICY_VIOLATION,
};
use tabbridge_core::{now_ms, BridgeConfig, Error, Result};

const SESSION_BUFFER: usize = 64;

pub struct BridgeServer {
    config: BridgeConfig,
    upstream: Arc<dyn ToolProvider>,
    validator: ApiKeyValidator,
    sessions: SessionTable,
    started_at: Instant,
    serve_task: Mutex<Option<tokio::task::JoinHandle<()>>>,
    sweep_task: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

#[derive(Clone)]
struct AppState {
    server: Arc<BridgeServer>,
}

impl BridgeServer {
    /// Validates the configuration up front; a bad port or empty key list
    /// never reaches the serving path.
    pub fn new(config: BridgeConfig, upstream: Arc<dyn ToolProvider>) -> Result<Arc<Self>> {
        config.validate()?;
        let validator = ApiKeyValidator::new(config.api_keys.clone())?;
        Ok(Arc::new(Self {
            config,
            upstream,
            validator,
            sessions: SessionTable::new(),
            started_at: Instant::now(),
            serve_task: Mutex::new(None),
            sweep_task: Mutex::new(None),
        }))
    }

    /// Bind, start serving and start the idle sweep. Returns the bound
    /// address.
    pub async fn start(self: &Arc<Self>) -> Result<SocketAddr> {
        let app = axum::Router::new()
            .route("/health", get(handle_health))
            .route("/", get(handle_ws_upgrade))
            .layer(CorsLayer::permissive())
            .with_state(AppState {
                server: self.clone(),
            });

        let bind = format!("{}:{}", self.config.host, self.config.port);
        let listener = tokio::net::TcpListener::bind(&bind)
            .await
            .map_err(|e| Error::Transport(format!("failed to bind {}: {}", bind, e)))?;
        let local = listener
            .local_addr()
            .map_err(|e| Error::Transport(e.to_string()))?;

        let handle = tokio::spawn(async move {
            if let Err(e) = axum::serve(listener, app).await {
                warn!(error = %e, "bridge serve loop ended");
            }
        });
        *self.serve_task.lock().await = Some(handle);
        self.start_sweep().await;

        info!(addr = %local, "bridge listening");
        Ok(local)
    }

    /// Ordered teardown: sweep first, then sessions, then the listener,
    /// then the upstream connection, so no new work is accepted while
    /// teardown is in flight.
    pub async fn shutdown(&self) {
        if let Some(handle) = self.sweep_task.lock().await.take() {
            handle.abort();
        }
        for session in self.sessions.drain().await {
            let _ = session
                .outbound
                .send(SessionCommand::Close {
                    code: CLOSE_NORMAL,
                    reason: "Server shutting down".to_string(),
                })
                .await;
        }
        if let Some(handle) = self.serve_task.lock().await.take() {
            handle.abort();
        }
        self.upstream.disconnect().await;
        info!("bridge shut down");
    }

    pub async fn session_count(&self) -> usize {
        self.sessions.len().await
    }

    pub async fn health_payload(&self) -> Value {
        json!({
            "status": "healthy",
            "uptime": self.started_at.elapsed().as_secs(),
            "connections": self.sessions.len().await,
            "mcpConnected": self.upstream.connected().await,
            "timestamp": now_ms(),
        })
    }

    async fn start_sweep(self: &Arc<Self>) {
        let interval = Duration::from_millis(self.config.sweep_interval_ms);
        let server = self.clone();
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let expired = server
                    .sessions
                    .sweep_idle(now_ms(), server.config.session_timeout_ms)
                    .await;
                for session in expired {
                    info!(session = %session.id, "closing idle session");
                    let _ = session
                        .outbound
                        .send(SessionCommand::Close {
                            code: CLOSE_NORMAL,
                            reason: "Session timeout".to_string(),
                        })
                        .await;
                }
            }
        });
        // one sweep at a time
        let old = self.sweep_task.lock().await.replace(handle);
        if let Some(old) = old {
            old.abort();
        }
    }

    async fn sender_for(&self, session_id: &str) -> Option<mpsc::Sender<SessionCommand>> {
        self.sessions
            .with_session(session_id, |s| s.outbound.clone())
            .await
    }

    async fn send_text(&self, session_id: &str, text: String) -> bool {
        match self.sender_for(session_id).await {
            Some(tx) => tx.send(SessionCommand::Send(text)).await.is_ok(),
            None => false,
        }
    }

    async fn send_json(&self, session_id: &str, value: &impl serde::Serialize) -> bool {
        match serde_json::to_string(value) {
            Ok(text) => self.send_text(session_id, text).await,
            Err(_) => false,
        }
    }

    /// Error reply then a forced close; the session leaves the table.
    async fn reject_and_close(&self, session_id: &str, reply: &impl serde::Serialize, reason: &str) {
        let sender = self.sender_for(session_id).await;
        self.sessions.remove(session_id).await;
        if let Some(tx) = sender {
            if let Ok(text) = serde_json::to_string(reply) {
                let _ = tx.send(SessionCommand::Send(text)).await;
            }
            let _ = tx
                .send(SessionCommand::Close {
                    code: CLOSE_POLICY_VIOLATION,
                    reason: reason.to_string(),
                })
                .await;
        }
    }

    /// The per-message pipeline. Returns false once the connection is
    /// done (force-closed or session gone).
    async fn handle_message(&self, session_id: &str, text: &str) -> bool {
        let now = now_ms();
        if self
            .sessions
            .with_session(session_id, |s| s.touch(now))
            .await
            .is_none()
        {
            // swept or closed concurrently
            return false;
        }

        let value: Value = match serde_json::from_str(text) {
            Ok(v) => v,
            Err(_) => {
                let reply =
                    JsonRpcResponse::failure(None, codes::PARSE_ERROR, "Invalid JSON message");
                return self.send_json(session_id, &reply).await;
            }
        };

        match ClientMessage::classify(value) {
            // keep-alive bypasses auth and rate limiting entirely
            ClientMessage::Ping => {
                self.send_json(session_id, &ServerMessage::Pong { timestamp: now })
                    .await
            }
            ClientMessage::Auth { api_key } => {
                if self.validator.validate(&api_key) {
                    self.sessions
                        .with_session(session_id, |s| s.authenticated = true)
                        .await;
                    info!(session = %session_id, "session authenticated");
                    self.send_json(
                        session_id,
                        &ServerMessage::AuthSuccess {
                            session_id: session_id.to_string(),
                            message: "Authenticated".to_string(),
                        },
                    )
                    .await
                } else {
                    warn!(session = %session_id, "invalid API key");
                    self.reject_and_close(
                        session_id,
                        &ServerMessage::AuthError {
                            message: "Invalid API key".to_string(),
                        },
                        "Invalid API key",
                    )
                    .await;
                    false
                }
            }
            ClientMessage::Rpc(request) => {
                let authenticated = self
                    .sessions
                    .with_session(session_id, |s| s.authenticated)
                    .await
                    .unwrap_or(false);
                if !authenticated {
                    let reply = JsonRpcResponse::failure(
                        request.id.clone(),
                        codes::NOT_AUTHENTICATED,
                        "Not authenticated",
                    );
                    self.reject_and_close(session_id, &reply, "Not authenticated")
                        .await;
                    return false;
                }

                let limit = RateLimitConfig {
                    window_ms: self.config.rate_limit_window_ms,
                    max_requests: self.config.rate_limit_max_requests,
                };
                let allowed = self
                    .sessions
                    .with_session(session_id, |s| s.check_rate_limit(now, &limit))
                    .await
                    .unwrap_or(false);
                if !allowed {
                    debug!(session = %session_id, "rate limit exceeded");
                    let reply = JsonRpcResponse::failure(
                        request.id.clone(),
                        codes::RATE_LIMITED,
                        "Rate limit exceeded",
                    );
                    return self.send_json(session_id, &reply).await;
                }

                let response = match request.method.as_str() {
                    "tools/list" => self.upstream.list_tools(request.id.clone()).await,
                    _ => self.upstream.call_tool(&request).await,
                };
                self.send_json(session_id, &response).await
            }
            ClientMessage::Other(_) => {
                let reply = JsonRpcResponse::failure(
                    None,
                    codes::INVALID_REQUEST,
                    "Unrecognized message",
                );
                self.send_json(session_id, &reply).await
            }
        }
    }
}

async fn handle_health(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.server.health_payload().await)
}

async fn handle_ws_upgrade(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Response {
    let origin = headers
        .get(header::ORIGIN)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    let allowed = match &origin {
        None => false,
        Some(o) => state
            .server
            .config
            .allowed_origins
            .iter()
            .any(|a| a == "*" || a == o),
    };
    if !allowed {
        warn!(?origin, "rejected connection: origin not allowed");
        return (StatusCode::FORBIDDEN, "Origin not allowed").into_response();
    }

    ws.on_upgrade(move |socket| handle_connection(socket, state.server))
        .into_response()
}

async fn handle_connection(socket: WebSocket, server: Arc<BridgeServer>) {
    let (outbound_tx, mut outbound_rx) = mpsc::channel::<SessionCommand>(SESSION_BUFFER);
    let session = Session::new(
        outbound_tx,
        now_ms(),
        server.config.rate_limit_window_ms,
    );
    let session_id = session.id.clone();
    server.sessions.insert(session).await;
    info!(session = %session_id, "client connected");

    let (mut sink, mut stream) = socket.split();

    // writer task owns the sink; Close drains it and ends the task. It
    // exits on its own once every command sender is gone.
    let _writer = tokio::spawn(async move {
        while let Some(cmd) = outbound_rx.recv().await {
            match cmd {
                SessionCommand::Send(text) => {
                    if sink.send(WsMessage::Text(text)).await.is_err() {
                        break;
                    }
                }
                SessionCommand::Close { code, reason } => {
                    let _ = sink
                        .send(WsMessage::Close(Some(CloseFrame {
                            code,
                            reason: reason.into(),
                        })))
                        .await;
                    break;
                }
            }
        }
    });

    while let Some(msg) = stream.next().await {
        let msg = match msg {
            Ok(m) => m,
            Err(e) => {
                debug!(session = %session_id, error = %e, "socket error");
                break;
            }
        };
        match msg {
            WsMessage::Text(text) => {
                if !server.handle_message(&session_id, &text).await {
                    break;
                }
            }
            WsMessage::Close(_) => break,
            _ => {}
        }
    }

    server.sessions.remove(&session_id).await;
    info!(session = %session_id, "client disconnected");
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use futures::{SinkExt, StreamExt};
    use tabbridge_core::protocol::{JsonRpcRequest, RequestId};
    use tokio_tungstenite::tungstenite::client::IntoClientRequest;
    use tokio_tungstenite::tungstenite::Message;

    struct MockProvider;

    #[async_trait]
    impl ToolProvider for MockProvider {
        async fn connect(&self) -> Result<()> {
            Ok(())
        }

        async fn connected(&self) -> bool {
            true
        }

        async fn call_tool(&self, request: &JsonRpcRequest) -> JsonRpcResponse {
            let params = request.params.clone().unwrap_or(json!({}));
            let name = params.get("name").and_then(|n| n.as_str()).unwrap_or("");
            match name {
                "navigate" => {
                    let url = params
                        .pointer("/arguments/url")
                        .and_then(|u| u.as_str())
                        .unwrap_or("");
                    JsonRpcResponse::success(
                        request.id.clone(),
                        json!({
                            "content": [{"type": "text", "text": format!("Navigated to {}", url)}],
                        }),
                    )
                }
                "explode" => JsonRpcResponse::failure(
                    request.id.clone(),
                    codes::EXECUTION_ERROR,
                    "handler exploded",
                ),
                other => JsonRpcResponse::success(
                    request.id.clone(),
                    json!({"content": [{"type": "text", "text": format!("ran {}", other)}]}),
                ),
            }
        }

        async fn list_tools(&self, id: Option<RequestId>) -> JsonRpcResponse {
            JsonRpcResponse::success(
                id,
                json!({"tools": [{"name": "navigate", "description": "go", "inputSchema": {"type": "object"}}]}),
            )
        }

        async fn disconnect(&self) {}
    }

    fn free_port() -> u16 {
        std::net::TcpListener::bind("127.0.0.1:0")
            .unwrap()
            .local_addr()
            .unwrap()
            .port()
    }

    fn test_config(max_requests: u32, origins: Vec<String>) -> BridgeConfig {
        BridgeConfig {
            host: "127.0.0.1".to_string(),
            port: free_port(),
            api_keys: vec!["test-key".to_string()],
            allowed_origins: origins,
            rate_limit_window_ms: 60_000,
            rate_limit_max_requests: max_requests,
            session_timeout_ms: 300_000,
            sweep_interval_ms: 60_000,
        }
    }

    async fn start_server(max_requests: u32) -> (Arc<BridgeServer>, SocketAddr) {
        let config = test_config(max_requests, vec!["*".to_string()]);
        let server = BridgeServer::new(config, Arc::new(MockProvider)).unwrap();
        let addr = server.start().await.unwrap();
        (server, addr)
    }

    type Client = tokio_tungstenite::WebSocketStream<
        tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
    >;

    async fn client_with_origin(addr: SocketAddr, origin: &str) -> Client {
        let mut req = format!("ws://{}/", addr).into_client_request().unwrap();
        req.headers_mut().insert("Origin", origin.parse().unwrap());
        let (ws, _) = tokio_tungstenite::connect_async(req).await.unwrap();
        ws
    }

    async fn send(ws: &mut Client, value: Value) {
        ws.send(Message::Text(value.to_string())).await.unwrap();
    }

    async fn recv_json(ws: &mut Client) -> Value {
        loop {
            let msg = tokio::time::timeout(Duration::from_secs(2), ws.next())
                .await
                .expect("timed out waiting for reply")
                .expect("socket closed")
                .expect("socket error");
            if let Message::Text(text) = msg {
                return serde_json::from_str(&text).unwrap();
            }
        }
    }

    async fn recv_close_code(ws: &mut Client) -> u16 {
        loop {
            match tokio::time::timeout(Duration::from_secs(2), ws.next())
                .await
                .expect("timed out waiting for close")
            {
                Some(Ok(Message::Close(Some(frame)))) => return frame.code.into(),
                Some(Ok(Message::Close(None))) | None => return CLOSE_NORMAL,
                Some(Ok(_)) => continue,
                Some(Err(_)) => return CLOSE_NORMAL,
            }
        }
    }

    async fn authenticate(ws: &mut Client) -> String {
        send(ws, json!({"type": "auth", "apiKey": "test-key"})).await;
        let reply = recv_json(ws).await;
        assert_eq!(reply["type"], "auth_success");
        reply["sessionId"].as_str().unwrap().to_string()
    }

    #[test]
    fn construction_rejects_bad_config() {
        let mut config = test_config(10, vec!["*".to_string()]);
        config.api_keys.clear();
        assert!(BridgeServer::new(config, Arc::new(MockProvider)).is_err());
    }

    #[tokio::test]
    async fn auth_failure_then_success_then_tool_call() {
        let (server, addr) = start_server(100).await;

        // bad key: auth_error, then a 1008 close
        let mut ws = client_with_origin(addr, "http://localhost").await;
        send(&mut ws, json!({"type": "auth", "apiKey": "bad"})).await;
        let reply = recv_json(&mut ws).await;
        assert_eq!(reply["type"], "auth_error");
        assert_eq!(recv_close_code(&mut ws).await, CLOSE_POLICY_VIOLATION);

        // fresh connection, valid key, fresh session id
        let mut ws = client_with_origin(addr, "http://localhost").await;
        let session_id = authenticate(&mut ws).await;
        assert!(!session_id.is_empty());

        send(
            &mut ws,
            json!({
                "id": "1",
                "jsonrpc": "2.0",
                "method": "tools/call",
                "params": {"name": "navigate", "arguments": {"url": "https://example.com"}},
            }),
        )
        .await;
        let reply = recv_json(&mut ws).await;
        assert_eq!(reply["id"], "1");
        assert_eq!(
            reply["result"]["content"][0]["text"],
            "Navigated to https://example.com"
        );

        server.shutdown().await;
    }

    #[tokio::test]
    async fn unauthenticated_rpc_is_rejected_and_closed() {
        let (server, addr) = start_server(100).await;
        let mut ws = client_with_origin(addr, "http://localhost").await;

        send(
            &mut ws,
            json!({"id": "5", "jsonrpc": "2.0", "method": "tools/call", "params": {"name": "navigate"}}),
        )
        .await;
        let reply = recv_json(&mut ws).await;
        assert_eq!(reply["error"]["code"], codes::NOT_AUTHENTICATED);
        assert_eq!(reply["id"], "5");
        assert_eq!(recv_close_code(&mut ws).await, CLOSE_POLICY_VIOLATION);
        assert_eq!(server.session_count().await, 0);

        server.shutdown().await;
    }

    #[tokio::test]
    async fn ping_bypasses_auth_and_rate_limit() {
        let (server, addr) = start_server(1).await;
        let mut ws = client_with_origin(addr, "http://localhost").await;

        // never authenticated, pings still answered
        for _ in 0..3 {
            send(&mut ws, json!({"type": "ping"})).await;
            let reply = recv_json(&mut ws).await;
            assert_eq!(reply["type"], "pong");
            assert!(reply["timestamp"].as_i64().unwrap() > 0);
        }

        server.shutdown().await;
    }

    #[tokio::test]
    async fn invalid_json_gets_parse_error_and_session_survives() {
        let (server, addr) = start_server(100).await;
        let mut ws = client_with_origin(addr, "http://localhost").await;

        ws.send(Message::Text("{not json".to_string())).await.unwrap();
        let reply = recv_json(&mut ws).await;
        assert_eq!(reply["error"]["code"], codes::PARSE_ERROR);

        send(&mut ws, json!({"type": "ping"})).await;
        assert_eq!(recv_json(&mut ws).await["type"], "pong");

        server.shutdown().await;
    }

    #[tokio::test]
    async fn unrecognized_message_gets_invalid_request() {
        let (server, addr) = start_server(100).await;
        let mut ws = client_with_origin(addr, "http://localhost").await;
        let _ = authenticate(&mut ws).await;

        send(&mut ws, json!({"hello": "world"})).await;
        let reply = recv_json(&mut ws).await;
        assert_eq!(reply["error"]["code"], codes::INVALID_REQUEST);

        server.shutdown().await;
    }

    #[tokio::test]
    async fn rate_limit_rejects_excess_without_closing() {
        let (server, addr) = start_server(2).await;
        let mut ws = client_with_origin(addr, "http://localhost").await;
        let _ = authenticate(&mut ws).await;

        for i in 0..2 {
            send(
                &mut ws,
                json!({"id": format!("{}", i), "jsonrpc": "2.0", "method": "tools/call", "params": {"name": "noop"}}),
            )
            .await;
            let reply = recv_json(&mut ws).await;
            assert!(reply.get("result").is_some(), "call {} should pass", i);
        }

        send(
            &mut ws,
            json!({"id": "2", "jsonrpc": "2.0", "method": "tools/call", "params": {"name": "noop"}}),
        )
        .await;
        let reply = recv_json(&mut ws).await;
        assert_eq!(reply["error"]["code"], codes::RATE_LIMITED);

        // socket stays open
        send(&mut ws, json!({"type": "ping"})).await;
        assert_eq!(recv_json(&mut ws).await["type"], "pong");

        server.shutdown().await;
    }

    #[tokio::test]
    async fn upstream_errors_are_relayed_with_the_original_id() {
        let (server, addr) = start_server(100).await;
        let mut ws = client_with_origin(addr, "http://localhost").await;
        let _ = authenticate(&mut ws).await;

        send(
            &mut ws,
            json!({"id": "err-1", "jsonrpc": "2.0", "method": "tools/call", "params": {"name": "explode"}}),
        )
        .await;
        let reply = recv_json(&mut ws).await;
        assert_eq!(reply["id"], "err-1");
        assert_eq!(reply["error"]["code"], codes::EXECUTION_ERROR);

        server.shutdown().await;
    }

    #[tokio::test]
    async fn list_tools_is_relayed() {
        let (server, addr) = start_server(100).await;
        let mut ws = client_with_origin(addr, "http://localhost").await;
        let _ = authenticate(&mut ws).await;

        send(
            &mut ws,
            json!({"id": "l1", "jsonrpc": "2.0", "method": "tools/list"}),
        )
        .await;
        let reply = recv_json(&mut ws).await;
        assert_eq!(reply["id"], "l1");
        assert_eq!(reply["result"]["tools"][0]["name"], "navigate");

        server.shutdown().await;
    }

    #[tokio::test]
    async fn origin_allow_list_is_enforced() {
        let config = test_config(100, vec!["http://app.test".to_string()]);
        let server = BridgeServer::new(config, Arc::new(MockProvider)).unwrap();
        let addr = server.start().await.unwrap();

        // wrong origin: handshake rejected
        let mut req = format!("ws://{}/", addr).into_client_request().unwrap();
        req.headers_mut()
            .insert("Origin", "http://other.test".parse().unwrap());
        assert!(tokio_tungstenite::connect_async(req).await.is_err());

        // missing origin: always rejected
        let req = format!("ws://{}/", addr).into_client_request().unwrap();
        assert!(tokio_tungstenite::connect_async(req).await.is_err());

        // listed origin: accepted
        let mut ws = client_with_origin(addr, "http://app.test").await;
        let _ = authenticate(&mut ws).await;

        server.shutdown().await;
    }

    #[tokio::test]
    async fn shutdown_closes_live_sessions() {
        let (server, addr) = start_server(100).await;
        let mut ws = client_with_origin(addr, "http://localhost").await;
        let _ = authenticate(&mut ws).await;
        assert_eq!(server.session_count().await, 1);

        server.shutdown().await;
        assert_eq!(server.session_count().await, 0);
        assert_eq!(recv_close_code(&mut ws).await, CLOSE_NORMAL);
    }

    #[tokio::test]
    async fn health_payload_reports_state() {
        let (server, _addr) = start_server(100).await;
        let health = server.health_payload().await;
        assert_eq!(health["status"], "healthy");
        assert_eq!(health["connections"], 0);
        assert_eq!(health["mcpConnected"], true);
        assert!(health["timestamp"].as_i64().unwrap() > 0);
        server.shutdown().await;
    }

    #[tokio::test]
    async fn ws_transport_end_to_end() {
        use tabbridge_transport::{WsConfig, WsTransport};

        let (server, addr) = start_server(100).await;
        let mut cfg = WsConfig::new(&format!("ws://{}", addr))
            .with_api_key("test-key")
            .with_origin("http://localhost");
        cfg.reconnect = false;
        let transport = WsTransport::new(cfg);
        transport.connect().await.unwrap();

        let result = transport
            .send_message(json!({
                "method": "tools/call",
                "params": {"name": "navigate", "arguments": {"url": "https://example.com"}},
            }))
            .await
            .unwrap();
        assert_eq!(result["content"][0]["text"], "Navigated to https://example.com");

        transport.disconnect().await;
        server.shutdown().await;
    }
}
