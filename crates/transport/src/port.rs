//! In-process port transport.
//!
//! One side binds a named endpoint on a [`PortHub`] and any number of peers
//! connect to it, each getting an independent duplex [`Port`]. The
//! [`PortTransport`] binds a [`Router`] to such an endpoint: every inbound
//! frame is routed and the response sent back on the same port.
//!
//! Frames are JSON text, so the parse-failure branch exists here exactly as
//! it does on the socket transports.

use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, warn};

use tabbridge_core::{Error, Result};
use tabbridge_router::Router;

/// Generic error code sent back when an inbound frame cannot be routed.
const ROUTER_ERROR: &str = "ROUTER_ERROR";

const PORT_BUFFER: usize = 64;

/// One end of a duplex in-process channel.
pub struct Port {
    tx: mpsc::Sender<String>,
    rx: Mutex<mpsc::Receiver<String>>,
}

impl Port {
    fn pair() -> (Port, Port) {
        let (a_tx, a_rx) = mpsc::channel(PORT_BUFFER);
        let (b_tx, b_rx) = mpsc::channel(PORT_BUFFER);
        (
            Port {
                tx: a_tx,
                rx: Mutex::new(b_rx),
            },
            Port {
                tx: b_tx,
                rx: Mutex::new(a_rx),
            },
        )
    }

    pub async fn send(&self, frame: String) -> Result<()> {
        self.tx
            .send(frame)
            .await
            .map_err(|_| Error::Transport("port peer disconnected".to_string()))
    }

    pub async fn send_json(&self, value: &Value) -> Result<()> {
        self.send(value.to_string()).await
    }

    /// Next inbound frame, or `None` once the peer has disconnected.
    pub async fn recv(&self) -> Option<String> {
        self.rx.lock().await.recv().await
    }

    fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Named-endpoint registry: the in-process equivalent of a runtime's
/// connect/onConnect pair.
pub struct PortHub {
    endpoints: Mutex<HashMap<String, mpsc::Sender<Port>>>,
}

impl PortHub {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            endpoints: Mutex::new(HashMap::new()),
        })
    }

    /// Bind a channel name and receive one [`Port`] per connecting peer.
    pub async fn listen(&self, channel: &str) -> Result<mpsc::Receiver<Port>> {
        let mut endpoints = self.endpoints.lock().await;
        if let Some(existing) = endpoints.get(channel) {
            if !existing.is_closed() {
                return Err(Error::Transport(format!(
                    "channel '{}' already has a listener",
                    channel
                )));
            }
        }
        let (tx, rx) = mpsc::channel(PORT_BUFFER);
        endpoints.insert(channel.to_string(), tx);
        Ok(rx)
    }

    /// Connect to a bound channel, returning the caller's end of the port.
    pub async fn connect(&self, channel: &str) -> Result<Port> {
        let acceptor = {
            let endpoints = self.endpoints.lock().await;
            endpoints
                .get(channel)
                .cloned()
                .ok_or_else(|| Error::Transport(format!("no listener on channel '{}'", channel)))?
        };
        let (local, remote) = Port::pair();
        acceptor
            .send(remote)
            .await
            .map_err(|_| Error::Transport(format!("listener on '{}' is gone", channel)))?;
        Ok(local)
    }

    pub async fn unbind(&self, channel: &str) {
        self.endpoints.lock().await.remove(channel);
    }
}

pub type ErrorCallback = Arc<dyn Fn(&Error) + Send + Sync>;

/// Binds a [`Router`] to a hub endpoint and serves every connecting peer.
pub struct PortTransport {
    hub: Arc<PortHub>,
    channel: String,
    router: Arc<Router>,
    connections: Arc<Mutex<HashMap<u64, Arc<Port>>>>,
    next_conn_id: AtomicU64,
    on_error: Option<ErrorCallback>,
    accept_task: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl PortTransport {
    pub fn new(hub: Arc<PortHub>, channel: &str, router: Arc<Router>) -> Self {
        Self {
            hub,
            channel: channel.to_string(),
            router,
            connections: Arc::new(Mutex::new(HashMap::new())),
            next_conn_id: AtomicU64::new(1),
            on_error: None,
            accept_task: Mutex::new(None),
        }
    }

    pub fn with_error_callback(mut self, cb: ErrorCallback) -> Self {
        self.on_error = Some(cb);
        self
    }

    /// Start accepting peers. Each connection is served independently:
    /// a failure on one never disturbs the others.
    pub async fn listen(&self) -> Result<()> {
        let mut acceptor = self.hub.listen(&self.channel).await?;
        let router = self.router.clone();
        let connections = self.connections.clone();
        let on_error = self.on_error.clone();
        let channel = self.channel.clone();
        let counter = Arc::new(AtomicU64::new(self.next_conn_id.load(Ordering::SeqCst)));

        let handle = tokio::spawn(async move {
            while let Some(port) = acceptor.recv().await {
                let conn_id = counter.fetch_add(1, Ordering::SeqCst);
                let port = Arc::new(port);
                connections.lock().await.insert(conn_id, port.clone());
                debug!(channel = %channel, conn_id, "port connected");

                let router = router.clone();
                let connections = connections.clone();
                let on_error = on_error.clone();
                let channel = channel.clone();
                tokio::spawn(async move {
                    while let Some(frame) = port.recv().await {
                        let reply = match serde_json::from_str::<Value>(&frame) {
                            Ok(message) => router.handle(message, None).await,
                            Err(e) => {
                                let err = Error::Protocol(format!("invalid message: {}", e));
                                if let Some(cb) = &on_error {
                                    cb(&err);
                                }
                                json!({
                                    "error": { "code": ROUTER_ERROR, "message": err.to_string() }
                                })
                            }
                        };
                        if let Err(e) = port.send_json(&reply).await {
                            if let Some(cb) = &on_error {
                                cb(&e);
                            }
                            break;
                        }
                    }
                    connections.lock().await.remove(&conn_id);
                    debug!(channel = %channel, conn_id, "port disconnected");
                });
            }
        });
        *self.accept_task.lock().await = Some(handle);
        Ok(())
    }

    /// Open an outbound connection to this transport's channel.
    pub async fn connect(&self) -> Result<Port> {
        self.hub.connect(&self.channel).await
    }

    /// Best-effort push to every live connection; one dead peer never
    /// blocks delivery to the rest.
    pub async fn broadcast(&self, message: &Value) {
        let frame = message.to_string();
        let ports: Vec<(u64, Arc<Port>)> = {
            let conns = self.connections.lock().await;
            conns.iter().map(|(id, p)| (*id, p.clone())).collect()
        };
        for (conn_id, port) in ports {
            if let Err(e) = port.send(frame.clone()).await {
                warn!(conn_id, error = %e, "broadcast skipped dead port");
            }
        }
    }

    /// Close every tracked connection and stop accepting.
    pub async fn disconnect(&self) {
        if let Some(handle) = self.accept_task.lock().await.take() {
            handle.abort();
        }
        self.hub.unbind(&self.channel).await;
        self.connections.lock().await.clear();
    }

    pub async fn connection_count(&self) -> usize {
        let conns = self.connections.lock().await;
        conns.values().filter(|p| !p.is_closed()).count()
    }

    /// One request, one reply: sends the frame and treats the next inbound
    /// message on the port as the response. Callers must not pipeline two
    /// requests on the same port.
    pub async fn request(port: &Port, message: &Value, deadline: Duration) -> Result<Value> {
        port.send_json(message).await?;
        let frame = tokio::time::timeout(deadline, port.recv())
            .await
            .map_err(|_| {
                Error::Timeout(format!("no reply within {}ms", deadline.as_millis()))
            })?
            .ok_or_else(|| Error::Transport("port closed before reply".to_string()))?;
        serde_json::from_str(&frame).map_err(Error::from)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::collections::HashMap as StdHashMap;
    use std::sync::atomic::AtomicUsize;
    use tabbridge_core::protocol::{ToolDefinition, ToolResult};
    use tabbridge_router::{HandlerMap, RouterContext, ToolHandler};

    struct UpperTool;

    #[async_trait]
    impl ToolHandler for UpperTool {
        async fn call(&self, args: Value, _ctx: &RouterContext) -> tabbridge_core::Result<ToolResult> {
            let s = args.get("s").and_then(|v| v.as_str()).unwrap_or_default();
            Ok(ToolResult::text(s.to_uppercase()))
        }
    }

    fn test_router() -> Arc<Router> {
        let defs = vec![ToolDefinition::new(
            "upper",
            "uppercase a string",
            json!({"type": "object", "properties": {"s": {"type": "string"}}}),
        )];
        let mut handlers: HandlerMap = StdHashMap::new();
        handlers.insert("upper".to_string(), Arc::new(UpperTool));
        Arc::new(Router::new(defs, handlers, RouterContext::new()).unwrap())
    }

    #[tokio::test]
    async fn round_trip_through_router() {
        let hub = PortHub::new();
        let transport = PortTransport::new(hub.clone(), "tabbridge", test_router());
        transport.listen().await.unwrap();

        let port = transport.connect().await.unwrap();
        let reply = PortTransport::request(
            &port,
            &json!({"method": "tools/call", "params": {"name": "upper", "arguments": {"s": "hi"}}}),
            Duration::from_secs(1),
        )
        .await
        .unwrap();
        assert_eq!(reply["content"][0]["text"], "HI");
    }

    #[tokio::test]
    async fn invalid_frame_gets_generic_error_and_callback() {
        let hub = PortHub::new();
        let errors = Arc::new(AtomicUsize::new(0));
        let errors_seen = errors.clone();
        let transport = PortTransport::new(hub.clone(), "tabbridge", test_router())
            .with_error_callback(Arc::new(move |_| {
                errors_seen.fetch_add(1, Ordering::SeqCst);
            }));
        transport.listen().await.unwrap();

        let port = transport.connect().await.unwrap();
        port.send("{not json".to_string()).await.unwrap();
        let frame = tokio::time::timeout(Duration::from_secs(1), port.recv())
            .await
            .unwrap()
            .unwrap();
        let reply: Value = serde_json::from_str(&frame).unwrap();
        assert_eq!(reply["error"]["code"], ROUTER_ERROR);
        assert_eq!(errors.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn peers_are_independent() {
        let hub = PortHub::new();
        let transport = PortTransport::new(hub.clone(), "tabbridge", test_router());
        transport.listen().await.unwrap();

        let first = transport.connect().await.unwrap();
        let second = transport.connect().await.unwrap();
        drop(first);

        // the surviving peer still gets service
        let reply = PortTransport::request(
            &second,
            &json!({"method": "tools/list"}),
            Duration::from_secs(1),
        )
        .await
        .unwrap();
        assert_eq!(reply["tools"][0]["name"], "upper");
    }

    #[tokio::test]
    async fn broadcast_reaches_live_ports() {
        let hub = PortHub::new();
        let transport = PortTransport::new(hub.clone(), "tabbridge", test_router());
        transport.listen().await.unwrap();

        let a = transport.connect().await.unwrap();
        let b = transport.connect().await.unwrap();
        // give the accept loop a chance to register both
        tokio::time::sleep(Duration::from_millis(20)).await;

        transport.broadcast(&json!({"event": "hello"})).await;
        for port in [&a, &b] {
            let frame = tokio::time::timeout(Duration::from_secs(1), port.recv())
                .await
                .unwrap()
                .unwrap();
            let msg: Value = serde_json::from_str(&frame).unwrap();
            assert_eq!(msg["event"], "hello");
        }
    }

    #[tokio::test]
    async fn disconnect_clears_connections_and_unbinds() {
        let hub = PortHub::new();
        let transport = PortTransport::new(hub.clone(), "tabbridge", test_router());
        transport.listen().await.unwrap();

        let _port = transport.connect().await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        transport.disconnect().await;

        assert_eq!(transport.connection_count().await, 0);
        assert!(hub.connect("tabbridge").await.is_err());
    }

    #[tokio::test]
    async fn request_times_out_without_reply() {
        let (local, _remote) = Port::pair();
        let err = PortTransport::request(&local, &json!({}), Duration::from_millis(20))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Timeout(_)));
    }

    #[tokio::test]
    async fn second_listener_is_rejected() {
        let hub = PortHub::new();
        let _rx = hub.listen("chan").await.unwrap();
        assert!(hub.listen("chan").await.is_err());
    }
}
