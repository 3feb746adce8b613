//! WebSocket client transport.
//!
//! Maintains one outbound connection to a bridge: explicit connection state
//! machine, optional auth handshake before the transport counts as
//! connected, a 30s heartbeat, id-correlated request/response with
//! timeouts, and bounded exponential-backoff reconnection.

use futures::stream::SplitStream;
use futures::{SinkExt, StreamExt};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::pending::PendingRequests;
use tabbridge_core::protocol::{AuthRequest, JSONRPC_VERSION};
use tabbridge_core::{Error, Result};

type WsRead = SplitStream<WebSocketStream<MaybeTlsStream<TcpStream>>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    Error,
}

#[derive(Debug, Clone)]
pub struct WsConfig {
    pub url: String,
    pub api_key: Option<String>,
    /// Origin header for the handshake; bridges reject origin-less
    /// connections.
    pub origin: Option<String>,
    pub reconnect: bool,
    pub max_reconnect_attempts: u32,
    pub heartbeat_interval: Duration,
    pub request_timeout: Duration,
    pub backoff_floor: Duration,
    pub backoff_ceiling: Duration,
}

impl WsConfig {
    pub fn new(url: &str) -> Self {
        Self {
            url: url.to_string(),
            api_key: None,
            origin: None,
            reconnect: true,
            max_reconnect_attempts: 5,
            heartbeat_interval: Duration::from_secs(30),
            request_timeout: Duration::from_secs(30),
            backoff_floor: Duration::from_millis(1000),
            backoff_ceiling: Duration::from_millis(30_000),
        }
    }

    pub fn with_api_key(mut self, key: &str) -> Self {
        self.api_key = Some(key.to_string());
        self
    }

    pub fn with_origin(mut self, origin: &str) -> Self {
        self.origin = Some(origin.to_string());
        self
    }
}

/// Delay before reconnect attempt `attempt` (0-based): doubles from the
/// floor, capped at the ceiling.
pub fn backoff_delay(attempt: u32, floor: Duration, ceiling: Duration) -> Duration {
    let factor = 2u64.saturating_pow(attempt.min(31));
    let delay = floor.as_millis() as u64 * factor;
    Duration::from_millis(delay.min(ceiling.as_millis() as u64))
}

type StateCallback = Arc<dyn Fn(ConnectionState) + Send + Sync>;
type ErrorCallback = Arc<dyn Fn(&Error) + Send + Sync>;

struct WsInner {
    config: WsConfig,
    state: StdMutex<ConnectionState>,
    writer: StdMutex<Option<mpsc::Sender<Message>>>,
    pending: PendingRequests<String>,
    authenticated: AtomicBool,
    reconnect_enabled: AtomicBool,
    reconnect_attempts: AtomicU32,
    heartbeat_task: StdMutex<Option<tokio::task::JoinHandle<()>>>,
    reconnect_task: StdMutex<Option<tokio::task::JoinHandle<()>>>,
    reader_task: StdMutex<Option<tokio::task::JoinHandle<()>>>,
    on_state: StdMutex<Option<StateCallback>>,
    on_error: StdMutex<Option<ErrorCallback>>,
}

#[derive(Clone)]
pub struct WsTransport {
    inner: Arc<WsInner>,
}

impl WsTransport {
    pub fn new(config: WsConfig) -> Self {
        let reconnect = config.reconnect;
        Self {
            inner: Arc::new(WsInner {
                config,
                state: StdMutex::new(ConnectionState::Disconnected),
                writer: StdMutex::new(None),
                pending: PendingRequests::new(),
                authenticated: AtomicBool::new(false),
                reconnect_enabled: AtomicBool::new(reconnect),
                reconnect_attempts: AtomicU32::new(0),
                heartbeat_task: StdMutex::new(None),
                reconnect_task: StdMutex::new(None),
                reader_task: StdMutex::new(None),
                on_state: StdMutex::new(None),
                on_error: StdMutex::new(None),
            }),
        }
    }

    pub fn state(&self) -> ConnectionState {
        *self.inner.state.lock().unwrap()
    }

    pub fn on_state_change(&self, cb: impl Fn(ConnectionState) + Send + Sync + 'static) {
        *self.inner.on_state.lock().unwrap() = Some(Arc::new(cb));
    }

    pub fn on_error(&self, cb: impl Fn(&Error) + Send + Sync + 'static) {
        *self.inner.on_error.lock().unwrap() = Some(Arc::new(cb));
    }

    /// Open the connection. No-op when already connected or connecting;
    /// two concurrent calls open one socket.
    pub async fn connect(&self) -> Result<()> {
        if !self.inner.try_begin_connect() {
            return Ok(());
        }
        self.inner.notify_state(ConnectionState::Connecting);

        let request = match self.inner.build_request() {
            Ok(req) => req,
            Err(e) => {
                self.inner.report_error(&e);
                self.inner.set_state(ConnectionState::Error);
                self.inner.clone().after_connection_loss();
                return Err(e);
            }
        };
        let (stream, _) = match connect_async(request).await {
            Ok(ok) => ok,
            Err(e) => {
                let err = Error::Transport(format!("connect failed: {}", e));
                self.inner.report_error(&err);
                self.inner.set_state(ConnectionState::Error);
                self.inner.clone().after_connection_loss();
                return Err(err);
            }
        };

        let (mut sink, mut read) = stream.split();

        // writer task owns the sink; everything outbound goes through it
        let (writer_tx, mut writer_rx) = mpsc::channel::<Message>(64);
        tokio::spawn(async move {
            while let Some(msg) = writer_rx.recv().await {
                if let Err(e) = sink.send(msg).await {
                    debug!(error = %e, "websocket write failed");
                    break;
                }
            }
        });
        *self.inner.writer.lock().unwrap() = Some(writer_tx.clone());

        if let Some(api_key) = self.inner.config.api_key.clone() {
            if let Err(e) = self.inner.authenticate(&writer_tx, &mut read, &api_key).await {
                self.inner.report_error(&e);
                *self.inner.writer.lock().unwrap() = None;
                self.inner.set_state(ConnectionState::Error);
                self.inner.clone().after_connection_loss();
                return Err(e);
            }
        }

        self.inner.reconnect_attempts.store(0, Ordering::SeqCst);
        self.inner.authenticated.store(true, Ordering::SeqCst);
        self.inner.set_state(ConnectionState::Connected);
        self.inner.clone().spawn_reader(read);
        self.inner.clone().start_heartbeat();
        Ok(())
    }

    /// Correlated request/response. Requires an authenticated, open socket.
    /// Assigns a fresh id, tags the protocol version, and bounds the wait
    /// with the configured timeout.
    pub async fn send_message(&self, request: Value) -> Result<Value> {
        if !self.inner.authenticated.load(Ordering::SeqCst) {
            return Err(Error::Transport("not connected".to_string()));
        }
        let writer = self
            .inner
            .writer
            .lock()
            .unwrap()
            .clone()
            .ok_or_else(|| Error::Transport("not connected".to_string()))?;

        if !request.is_object() {
            return Err(Error::Protocol("request must be a JSON object".to_string()));
        }
        let id = Uuid::new_v4().to_string();
        let mut request = request;
        request["id"] = json!(id);
        request["jsonrpc"] = json!(JSONRPC_VERSION);

        let rx = self.inner.pending.register(id.clone()).await;
        if writer
            .send(Message::Text(request.to_string()))
            .await
            .is_err()
        {
            self.inner
                .pending
                .complete(&id, Err(Error::Transport("send failed".to_string())))
                .await;
            return Err(Error::Transport("socket closed while sending".to_string()));
        }

        self.inner
            .pending
            .wait(&id, rx, self.inner.config.request_timeout)
            .await
    }

    /// Explicit teardown: disables reconnection, stops the heartbeat,
    /// closes the socket and rejects every in-flight request. The only
    /// path that fails pending requests instead of letting them time out.
    pub async fn disconnect(&self) {
        self.inner.reconnect_enabled.store(false, Ordering::SeqCst);
        self.inner.cancel_reconnect_timer();
        self.inner.stop_heartbeat();

        let writer = self.inner.writer.lock().unwrap().take();
        if let Some(writer) = writer {
            let _ = writer.send(Message::Close(None)).await;
        }
        if let Some(handle) = self.inner.reader_task.lock().unwrap().take() {
            handle.abort();
        }

        self.inner.authenticated.store(false, Ordering::SeqCst);
        self.inner
            .pending
            .fail_all(|| Error::Transport("connection closed".to_string()))
            .await;
        self.inner.set_state(ConnectionState::Disconnected);
    }

    pub async fn pending_count(&self) -> usize {
        self.inner.pending.len().await
    }
}

impl WsInner {
    /// Handshake request with the configured Origin header attached.
    fn build_request(&self) -> Result<tokio_tungstenite::tungstenite::handshake::client::Request> {
        use tokio_tungstenite::tungstenite::client::IntoClientRequest;
        let mut request = self
            .config
            .url
            .as_str()
            .into_client_request()
            .map_err(|e| Error::Transport(format!("invalid url: {}", e)))?;
        if let Some(origin) = &self.config.origin {
            let value = origin
                .parse()
                .map_err(|_| Error::Transport(format!("invalid origin: {}", origin)))?;
            request.headers_mut().insert("Origin", value);
        }
        Ok(request)
    }

    /// Atomically claim the Connecting state. Returns false when a connect
    /// is already in flight or established.
    fn try_begin_connect(&self) -> bool {
        let mut state = self.state.lock().unwrap();
        match *state {
            ConnectionState::Connected | ConnectionState::Connecting => false,
            _ => {
                *state = ConnectionState::Connecting;
                true
            }
        }
    }

    fn set_state(&self, new: ConnectionState) {
        {
            let mut state = self.state.lock().unwrap();
            if *state == new {
                return;
            }
            *state = new;
        }
        self.notify_state(new);
    }

    fn notify_state(&self, state: ConnectionState) {
        debug!(?state, "transport state");
        let cb = self.on_state.lock().unwrap().clone();
        if let Some(cb) = cb {
            cb(state);
        }
    }

    fn report_error(&self, err: &Error) {
        warn!(error = %err, "transport error");
        let cb = self.on_error.lock().unwrap().clone();
        if let Some(cb) = cb {
            cb(err);
        }
    }

    /// Auth handshake: send the key, wait for the matching reply before
    /// the transport counts as connected.
    async fn authenticate(
        &self,
        writer: &mpsc::Sender<Message>,
        read: &mut WsRead,
        api_key: &str,
    ) -> Result<()> {
        let auth = serde_json::to_string(&AuthRequest::new(api_key))?;
        writer
            .send(Message::Text(auth))
            .await
            .map_err(|_| Error::Transport("socket closed before auth".to_string()))?;

        let deadline = tokio::time::sleep(self.config.request_timeout);
        tokio::pin!(deadline);
        loop {
            tokio::select! {
                _ = &mut deadline => {
                    return Err(Error::Timeout("no auth reply".to_string()));
                }
                msg = read.next() => {
                    let msg = match msg {
                        Some(Ok(Message::Text(text))) => text,
                        Some(Ok(_)) => continue,
                        Some(Err(e)) => return Err(Error::Transport(format!("socket error during auth: {}", e))),
                        None => return Err(Error::Transport("socket closed during auth".to_string())),
                    };
                    let value: Value = match serde_json::from_str(&msg) {
                        Ok(v) => v,
                        Err(_) => continue,
                    };
                    match value.get("type").and_then(|t| t.as_str()) {
                        Some("auth_success") => return Ok(()),
                        Some("auth_error") => {
                            let message = value
                                .get("message")
                                .or_else(|| value.get("error").and_then(|e| e.get("message")))
                                .and_then(|m| m.as_str())
                                .unwrap_or("authentication failed");
                            return Err(Error::Auth(message.to_string()));
                        }
                        // anything else before the auth reply is dropped
                        _ => continue,
                    }
                }
            }
        }
    }

    fn spawn_reader(self: Arc<Self>, mut read: WsRead) {
        let inner = self.clone();
        let handle = tokio::spawn(async move {
            while let Some(msg) = read.next().await {
                match msg {
                    Ok(Message::Text(text)) => inner.route_inbound(&text).await,
                    Ok(Message::Close(_)) => break,
                    Ok(_) => {}
                    Err(e) => {
                        inner.report_error(&Error::Transport(format!("socket error: {}", e)));
                        break;
                    }
                }
            }
            inner.on_socket_closed();
        });
        let old = self.reader_task.lock().unwrap().replace(handle);
        if let Some(old) = old {
            old.abort();
        }
    }

    /// Inbound dispatch: pongs are dropped, everything with a matching id
    /// resolves or rejects its pending entry, the rest is unroutable.
    async fn route_inbound(&self, text: &str) {
        let value: Value = match serde_json::from_str(text) {
            Ok(v) => v,
            Err(e) => {
                debug!(error = %e, "dropping unparseable message");
                return;
            }
        };
        if value.get("type").and_then(|t| t.as_str()) == Some("pong") {
            return;
        }
        let id = match value.get("id") {
            Some(Value::String(s)) => s.clone(),
            Some(Value::Number(n)) => n.to_string(),
            _ => {
                debug!("dropping unroutable message without id");
                return;
            }
        };
        let outcome = if let Some(err) = value.get("error") {
            let message = err
                .get("message")
                .and_then(|m| m.as_str())
                .unwrap_or("request failed");
            Err(Error::Transport(message.to_string()))
        } else {
            Ok(value.get("result").cloned().unwrap_or(value.clone()))
        };
        if !self.pending.complete(&id, outcome).await {
            debug!(%id, "dropping reply with no pending request");
        }
    }

    /// Socket went away without an explicit disconnect. In-flight requests
    /// are left to their timeouts; only reconnection policy runs here.
    fn on_socket_closed(self: &Arc<Self>) {
        self.authenticated.store(false, Ordering::SeqCst);
        *self.writer.lock().unwrap() = None;
        self.stop_heartbeat();

        if self.reconnect_enabled.load(Ordering::SeqCst) {
            self.clone().after_connection_loss();
        } else {
            self.set_state(ConnectionState::Disconnected);
        }
    }

    /// Schedule the next reconnect attempt, or go terminally disconnected
    /// once the budget is spent.
    fn after_connection_loss(self: Arc<Self>) {
        if !self.reconnect_enabled.load(Ordering::SeqCst) {
            self.set_state(ConnectionState::Disconnected);
            return;
        }
        let attempt = self.reconnect_attempts.load(Ordering::SeqCst);
        if attempt >= self.config.max_reconnect_attempts {
            self.set_state(ConnectionState::Disconnected);
            return;
        }
        self.reconnect_attempts.store(attempt + 1, Ordering::SeqCst);
        let delay = backoff_delay(attempt, self.config.backoff_floor, self.config.backoff_ceiling);
        debug!(attempt = attempt + 1, ?delay, "scheduling reconnect");
        self.set_state(ConnectionState::Reconnecting);

        let inner = self.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if !inner.reconnect_enabled.load(Ordering::SeqCst) {
                return;
            }
            let transport = WsTransport {
                inner: inner.clone(),
            };
            let _ = transport.connect().await;
        });
        // one reconnect timer at a time
        let old = self.reconnect_task.lock().unwrap().replace(handle);
        if let Some(old) = old {
            old.abort();
        }
    }

    fn cancel_reconnect_timer(&self) {
        if let Some(handle) = self.reconnect_task.lock().unwrap().take() {
            handle.abort();
        }
    }

    fn start_heartbeat(self: Arc<Self>) {
        let interval = self.config.heartbeat_interval;
        let inner = self.clone();
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await; // first tick fires immediately; skip it
            loop {
                ticker.tick().await;
                let writer = inner.writer.lock().unwrap().clone();
                let Some(writer) = writer else { break };
                if writer
                    .send(Message::Text(json!({"type": "ping"}).to_string()))
                    .await
                    .is_err()
                {
                    break;
                }
            }
        });
        // entering connected always replaces any previous heartbeat
        let old = self.heartbeat_task.lock().unwrap().replace(handle);
        if let Some(old) = old {
            old.abort();
        }
    }

    fn stop_heartbeat(&self) {
        if let Some(handle) = self.heartbeat_task.lock().unwrap().take() {
            handle.abort();
        }
    }
}
