//! WebSocket endpoint for the client process.
//!
//! Opens the long-lived connection to the rendezvous server, runs the
//! identity handshake, and pumps JSON envelope frames. The server end
//! multiplexes many logical sessions over this one socket; from this
//! side that is invisible — scoped ids arrive as opaque strings and go
//! back out unchanged.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

use mooring_core::endpoint::{Endpoint, EndpointEvent, EventSink, OnceSlot};
use mooring_core::envelope::{self, Envelope};
use mooring_core::error::{MooringError, MooringResult};

type WsSink = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, Message>;
type WsStream = SplitStream<WebSocketStream<MaybeTlsStream<TcpStream>>>;

/// Configuration for mooring to a server over WebSocket.
#[derive(Debug, Clone)]
pub struct ConnectConfig {
    /// Server URL (`ws://` or `wss://`).
    pub url: String,
    /// Handshake timeout in seconds.
    pub handshake_timeout_secs: u64,
}

impl Default for ConnectConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            handshake_timeout_secs: 10,
        }
    }
}

/// Client-side socket endpoint.
pub struct SocketClientEndpoint {
    config: ConnectConfig,
    identity: OnceSlot,
    events: EventSink<EndpointEvent>,
    sink: Arc<Mutex<Option<WsSink>>>,
    reader: StdMutex<Option<JoinHandle<()>>>,
    closed: Arc<AtomicBool>,
}

impl SocketClientEndpoint {
    pub fn new(config: ConnectConfig) -> Self {
        Self {
            config,
            identity: OnceSlot::new(),
            events: EventSink::new(),
            sink: Arc::new(Mutex::new(None)),
            reader: StdMutex::new(None),
            closed: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Write an envelope without waiting for identity.
    async fn send_raw(&self, envelope: &Envelope) -> MooringResult<()> {
        let text = envelope::encode(envelope)?;
        let mut sink = self.sink.lock().await;
        match sink.as_mut() {
            Some(sink) => sink
                .send(Message::Text(text))
                .await
                .map_err(|e| MooringError::Transport(format!("socket send failed: {e}"))),
            None => Err(MooringError::Closed),
        }
    }
}

#[async_trait]
impl Endpoint for SocketClientEndpoint {
    async fn start(&self) -> MooringResult<()> {
        let (ws, _response) = connect_async(self.config.url.as_str())
            .await
            .map_err(|e| MooringError::Transport(format!("socket connect failed: {e}")))?;
        info!(url = %self.config.url, "socket transport connected");

        let (sink, stream) = ws.split();
        *self.sink.lock().await = Some(sink);

        let handle = tokio::spawn(read_loop(
            stream,
            self.sink.clone(),
            self.identity.clone(),
            self.events.clone(),
            self.closed.clone(),
        ));
        if let Ok(mut reader) = self.reader.lock() {
            *reader = Some(handle);
        }

        // Identity handshake: the initialize request is the only frame
        // allowed out before the client id is known.
        self.send_raw(&Envelope::initialize()).await?;

        let timeout = Duration::from_secs(self.config.handshake_timeout_secs);
        match time::timeout(timeout, self.identity.wait()).await {
            Ok(Ok(client_id)) => {
                debug!(client_id = %client_id, "handshake complete");
                Ok(())
            }
            Ok(Err(e)) => Err(e),
            Err(_) => Err(MooringError::Timeout),
        }
    }

    async fn send(&self, envelope: Envelope) -> MooringResult<()> {
        if !envelope.is_initialize() {
            self.identity.wait().await?;
        }
        self.send_raw(&envelope).await
    }

    async fn close(&self) -> MooringResult<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        if let Some(mut sink) = self.sink.lock().await.take() {
            let _ = sink.send(Message::Close(None)).await;
        }
        if let Ok(mut reader) = self.reader.lock() {
            if let Some(handle) = reader.take() {
                handle.abort();
            }
        }
        self.events.emit(EndpointEvent::Closed);
        Ok(())
    }

    fn client_id(&self) -> Option<String> {
        self.identity.get()
    }

    fn events(&self) -> &EventSink<EndpointEvent> {
        &self.events
    }
}

impl Drop for SocketClientEndpoint {
    fn drop(&mut self) {
        if let Ok(mut reader) = self.reader.lock() {
            if let Some(handle) = reader.take() {
                handle.abort();
            }
        }
    }
}

/// Dispatch loop routing inbound frames.
async fn read_loop(
    mut stream: WsStream,
    sink: Arc<Mutex<Option<WsSink>>>,
    identity: OnceSlot,
    events: EventSink<EndpointEvent>,
    closed: Arc<AtomicBool>,
) {
    while let Some(msg) = stream.next().await {
        match msg {
            Ok(Message::Text(text)) => match envelope::decode(&text) {
                Ok(env) => {
                    if env.is_initialize() {
                        match env.handshake_client_id() {
                            Some(id) => {
                                identity.resolve(id);
                            }
                            None => warn!("initialize reply without clientId"),
                        }
                    } else {
                        events.emit(EndpointEvent::Message(env));
                    }
                }
                Err(e) => {
                    // Malformed traffic: surface the error, then stop
                    // rather than continue in an undefined state.
                    events.emit(EndpointEvent::Error(e));
                    break;
                }
            },
            Ok(Message::Ping(payload)) => {
                let mut sink = sink.lock().await;
                if let Some(sink) = sink.as_mut() {
                    let _ = sink.send(Message::Pong(payload)).await;
                }
            }
            Ok(Message::Close(_)) => {
                debug!("socket close frame received");
                break;
            }
            Ok(_) => continue,
            Err(e) => {
                events.emit(EndpointEvent::Error(MooringError::Transport(format!(
                    "socket read failed: {e}"
                ))));
                break;
            }
        }
    }

    if !closed.swap(true, Ordering::SeqCst) {
        events.emit(EndpointEvent::Closed);
    }
}
