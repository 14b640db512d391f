//! Socket transport: the long-lived client connection and its
//! session-scoped endpoints.
//!
//! Each accepted WebSocket is owned by a [`SocketConnection`]. After
//! the identity handshake the connection is registered in the
//! ConnectorCenter as a FACTORY: every inbound tool session mints its
//! own [`SocketServerEndpoint`] scoped to the session id, and all of
//! them share the one socket. Outbound request ids are rewritten with
//! the scope prefix; inbound envelopes are fanned out to every scope
//! and each one keeps only its own traffic.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};

use async_trait::async_trait;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{accept_async, WebSocketStream};
use tracing::{debug, error, info, warn};

use mooring_core::endpoint::{Endpoint, EndpointEvent, EventSink};
use mooring_core::envelope::{self, Envelope};
use mooring_core::error::{MooringError, MooringResult};
use mooring_core::scope::{scope_request_id, unscope_response_id, validate_server_id};

use crate::center::{generate_client_id, ClientEntry, ConnectorCenter};

type WsSink = SplitSink<WebSocketStream<TcpStream>, Message>;
type WsStream = SplitStream<WebSocketStream<TcpStream>>;

/// Maximum accepted frame size (1 MiB).
const MAX_FRAME_SIZE: usize = 1_048_576;

/// One physical client connection, shared by its scoped endpoints.
pub struct SocketConnection {
    client_id: String,
    sink: Mutex<WsSink>,
    subscribers: StdMutex<HashMap<u64, Subscriber>>,
    next_subscriber: AtomicU64,
    closed: AtomicBool,
}

#[derive(Clone)]
struct Subscriber {
    scope: Option<String>,
    events: EventSink<EndpointEvent>,
}

impl SocketConnection {
    fn new(client_id: String, sink: WsSink) -> Self {
        Self {
            client_id,
            sink: Mutex::new(sink),
            subscribers: StdMutex::new(HashMap::new()),
            next_subscriber: AtomicU64::new(1),
            closed: AtomicBool::new(false),
        }
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Write one envelope frame to the socket.
    pub async fn send_envelope(&self, envelope: &Envelope) -> MooringResult<()> {
        if self.is_closed() {
            return Err(MooringError::Closed);
        }
        let text = envelope::encode(envelope)?;
        self.sink
            .lock()
            .await
            .send(Message::Text(text))
            .await
            .map_err(|e| MooringError::Transport(format!("socket send failed: {e}")))
    }

    /// Close the physical socket. The read loop finishes the cleanup.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let _ = self.sink.lock().await.send(Message::Close(None)).await;
    }

    fn subscribe(&self, scope: Option<String>, events: EventSink<EndpointEvent>) -> u64 {
        let id = self.next_subscriber.fetch_add(1, Ordering::SeqCst);
        if let Ok(mut subscribers) = self.subscribers.lock() {
            subscribers.insert(id, Subscriber { scope, events });
        }
        id
    }

    fn unsubscribe(&self, id: u64) {
        if let Ok(mut subscribers) = self.subscribers.lock() {
            subscribers.remove(&id);
        }
    }

    fn snapshot(&self) -> Vec<Subscriber> {
        self.subscribers
            .lock()
            .map(|subscribers| subscribers.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Route one inbound envelope to every live scope. A scoped
    /// subscriber only sees traffic whose id carries its prefix;
    /// everything else belongs to a sibling session and is dropped
    /// silently.
    fn fan_out(&self, envelope: &Envelope) {
        if envelope.is_initialize() {
            debug!(client_id = %self.client_id, "late initialize ignored");
            return;
        }
        for subscriber in self.snapshot() {
            match &subscriber.scope {
                Some(server_id) => {
                    let mut scoped = envelope.clone();
                    if unscope_response_id(&mut scoped, server_id) {
                        subscriber.events.emit(EndpointEvent::Message(scoped));
                    }
                }
                None => {
                    subscriber.events.emit(EndpointEvent::Message(envelope.clone()));
                }
            }
        }
    }

    fn broadcast_error(&self, error: &MooringError) {
        for subscriber in self.snapshot() {
            subscriber.events.emit(EndpointEvent::Error(replicate(error)));
        }
    }

    fn mark_closed(&self) {
        self.closed.store(true, Ordering::SeqCst);
        let subscribers = self.snapshot();
        if let Ok(mut map) = self.subscribers.lock() {
            map.clear();
        }
        for subscriber in subscribers {
            subscriber.events.emit(EndpointEvent::Closed);
        }
    }
}

/// Event payloads are moved, not shared, so errors are re-materialized
/// per subscriber.
fn replicate(error: &MooringError) -> MooringError {
    match error {
        MooringError::InvalidMessage(msg) => MooringError::InvalidMessage(msg.clone()),
        MooringError::Transport(msg) => MooringError::Transport(msg.clone()),
        other => MooringError::Transport(other.to_string()),
    }
}

/// Server-side endpoint over a shared socket connection.
///
/// In scoped mode it rewrites ids both ways and filters inbound traffic
/// to its own session; in unscoped mode it is a passthrough bound to
/// the whole connection.
pub struct SocketServerEndpoint {
    conn: Arc<SocketConnection>,
    scope: Option<String>,
    events: EventSink<EndpointEvent>,
    subscription: u64,
    closed: AtomicBool,
}

impl SocketServerEndpoint {
    /// A session-scoped endpoint. The scope id is validated here so a
    /// delimiter collision can never break sibling isolation.
    pub fn scoped(conn: Arc<SocketConnection>, server_id: &str) -> MooringResult<Self> {
        validate_server_id(server_id)?;
        let events = EventSink::new();
        let subscription = conn.subscribe(Some(server_id.to_string()), events.clone());
        Ok(Self {
            conn,
            scope: Some(server_id.to_string()),
            events,
            subscription,
            closed: AtomicBool::new(false),
        })
    }

    /// A passthrough endpoint owning the whole connection.
    pub fn unscoped(conn: Arc<SocketConnection>) -> Self {
        let events = EventSink::new();
        let subscription = conn.subscribe(None, events.clone());
        Self {
            conn,
            scope: None,
            events,
            subscription,
            closed: AtomicBool::new(false),
        }
    }

    pub fn server_id(&self) -> Option<&str> {
        self.scope.as_deref()
    }
}

#[async_trait]
impl Endpoint for SocketServerEndpoint {
    async fn start(&self) -> MooringResult<()> {
        // Identity was established when the connection was accepted;
        // only the transport needs to still be up.
        if self.conn.is_closed() {
            return Err(MooringError::Closed);
        }
        Ok(())
    }

    async fn send(&self, mut envelope: Envelope) -> MooringResult<()> {
        if let Some(server_id) = &self.scope {
            scope_request_id(&mut envelope, server_id);
        }
        self.conn.send_envelope(&envelope).await
    }

    async fn close(&self) -> MooringResult<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.conn.unsubscribe(self.subscription);
        if self.scope.is_none() {
            // Single-session mode owns the physical connection.
            self.conn.close().await;
        }
        self.events.emit(EndpointEvent::Closed);
        Ok(())
    }

    fn client_id(&self) -> Option<String> {
        Some(self.conn.client_id.clone())
    }

    fn events(&self) -> &EventSink<EndpointEvent> {
        &self.events
    }
}

impl Drop for SocketServerEndpoint {
    fn drop(&mut self) {
        // Scoped endpoints are ephemeral wrappers; dropping the last
        // reference must release the connection subscription.
        self.conn.unsubscribe(self.subscription);
    }
}

/// How accepted connections are registered in the ConnectorCenter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SessionMode {
    /// Factory registration: every inbound tool session mints its own
    /// scoped endpoint over the shared socket.
    #[default]
    Shared,
    /// Direct registration: the whole connection is one session and the
    /// endpoint passes ids through untouched.
    Single,
}

/// Start the socket listener in shared (multiplexed) mode.
pub async fn start_listener(
    bind_addr: SocketAddr,
    center: Arc<ConnectorCenter>,
) -> MooringResult<(SocketAddr, JoinHandle<()>)> {
    start_listener_with_mode(bind_addr, center, SessionMode::Shared).await
}

/// Start the socket listener. Returns the bound address and the accept
/// task handle.
pub async fn start_listener_with_mode(
    bind_addr: SocketAddr,
    center: Arc<ConnectorCenter>,
    mode: SessionMode,
) -> MooringResult<(SocketAddr, JoinHandle<()>)> {
    let listener = TcpListener::bind(bind_addr)
        .await
        .map_err(|e| MooringError::Transport(format!("socket bind failed: {e}")))?;
    let local_addr = listener.local_addr().map_err(MooringError::Io)?;
    info!(addr = %local_addr, "socket listener started");

    let handle = tokio::spawn(async move {
        loop {
            match listener.accept().await {
                Ok((stream, peer)) => {
                    let center = center.clone();
                    tokio::spawn(async move {
                        if let Err(e) = serve_connection(stream, peer, center, mode).await {
                            warn!(remote = %peer, error = %e, "connection ended with error");
                        }
                    });
                }
                Err(e) => {
                    error!(error = %e, "tcp accept failed");
                }
            }
        }
    });

    Ok((local_addr, handle))
}

/// Accept one client: handshake, register, pump until the socket dies.
async fn serve_connection(
    stream: TcpStream,
    peer: SocketAddr,
    center: Arc<ConnectorCenter>,
    mode: SessionMode,
) -> MooringResult<()> {
    let ws = accept_async(stream)
        .await
        .map_err(|e| MooringError::Transport(format!("websocket handshake failed: {e}")))?;
    debug!(remote = %peer, "socket connection accepted");

    let (sink, mut read) = ws.split();
    let client_id = generate_client_id();
    let conn = Arc::new(SocketConnection::new(client_id.clone(), sink));

    // Identity handshake: the first envelope must be the initialize
    // request.
    let first = match read_envelope(&mut read, &conn).await? {
        Some(envelope) => envelope,
        None => return Ok(()), // went away before the handshake
    };
    if !first.is_initialize() {
        return Err(MooringError::Handshake(
            "expected initialize as first message".to_string(),
        ));
    }

    // Register before replying: the peer may act on its identity the
    // moment the reply lands.
    let entry = match mode {
        SessionMode::Shared => {
            let factory_conn = conn.clone();
            ClientEntry::Factory(Box::new(move |session_id| {
                let endpoint = SocketServerEndpoint::scoped(factory_conn.clone(), session_id)?;
                Ok(Arc::new(endpoint) as Arc<dyn Endpoint>)
            }))
        }
        SessionMode::Single => {
            ClientEntry::Direct(Arc::new(SocketServerEndpoint::unscoped(conn.clone())))
        }
    };
    center.set_client(&client_id, entry).await;

    if let Err(e) = conn
        .send_envelope(&Envelope::initialize_reply(&client_id))
        .await
    {
        center.remove_client(&client_id).await;
        return Err(e);
    }
    info!(remote = %peer, client_id = %client_id, "client moored");

    read_loop(&conn, read).await;

    center.remove_client(&client_id).await;
    conn.mark_closed();
    info!(client_id = %client_id, "client unmoored");
    Ok(())
}

/// Read the next envelope, answering pings along the way.
async fn read_envelope(read: &mut WsStream, conn: &SocketConnection) -> MooringResult<Option<Envelope>> {
    while let Some(msg) = read.next().await {
        match msg {
            Ok(Message::Text(text)) => return envelope::decode(&text).map(Some),
            Ok(Message::Ping(payload)) => {
                let _ = conn.sink.lock().await.send(Message::Pong(payload)).await;
            }
            Ok(Message::Close(_)) => return Ok(None),
            Ok(_) => continue,
            Err(e) => {
                return Err(MooringError::Transport(format!("socket read failed: {e}")));
            }
        }
    }
    Ok(None)
}

/// Pump inbound frames into the scope fan-out until the socket closes.
async fn read_loop(conn: &Arc<SocketConnection>, mut read: WsStream) {
    while let Some(msg) = read.next().await {
        match msg {
            Ok(Message::Text(text)) => {
                if text.len() > MAX_FRAME_SIZE {
                    conn.broadcast_error(&MooringError::InvalidMessage(format!(
                        "frame too large: {} bytes (max {MAX_FRAME_SIZE})",
                        text.len()
                    )));
                    break;
                }
                match envelope::decode(&text) {
                    Ok(envelope) => conn.fan_out(&envelope),
                    Err(e) => {
                        conn.broadcast_error(&e);
                        break;
                    }
                }
            }
            Ok(Message::Ping(payload)) => {
                let _ = conn.sink.lock().await.send(Message::Pong(payload)).await;
            }
            Ok(Message::Close(_)) => {
                debug!(client_id = %conn.client_id, "socket close frame received");
                break;
            }
            Ok(_) => continue,
            Err(e) => {
                conn.broadcast_error(&MooringError::Transport(format!(
                    "socket read failed: {e}"
                )));
                break;
            }
        }
    }
}
