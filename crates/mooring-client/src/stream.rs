//! Stream endpoint for the client process: SSE receive + POST send.
//!
//! The per-session fallback when a WebSocket cannot be held open. The
//! server pushes envelopes over a persistent one-way event stream; the
//! client sends by POSTing envelopes to the message URL announced in
//! the stream's first event.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::StreamExt;
use tokio::task::JoinHandle;
use tokio::time;
use tracing::{debug, info, warn};

use mooring_core::endpoint::{Endpoint, EndpointEvent, EventSink, OnceSlot};
use mooring_core::envelope::{self, Envelope};
use mooring_core::error::{MooringError, MooringResult};

/// Timeout applied to each message POST.
const POST_TIMEOUT_SECS: u64 = 30;

/// Configuration for mooring over the stream transport.
#[derive(Debug, Clone)]
pub struct StreamConfig {
    /// URL of the event-stream endpoint.
    pub sse_url: String,
    /// Handshake timeout in seconds.
    pub handshake_timeout_secs: u64,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            sse_url: String::new(),
            handshake_timeout_secs: 10,
        }
    }
}

/// Client-side stream endpoint.
pub struct StreamClientEndpoint {
    config: StreamConfig,
    http: reqwest::Client,
    identity: OnceSlot,
    post_url: OnceSlot,
    events: EventSink<EndpointEvent>,
    reader: StdMutex<Option<JoinHandle<()>>>,
    closed: Arc<AtomicBool>,
}

impl StreamClientEndpoint {
    pub fn new(config: StreamConfig) -> Self {
        Self {
            config,
            // No client-wide timeout: it would sever the event stream.
            // POSTs get a per-request timeout instead.
            http: reqwest::Client::new(),
            identity: OnceSlot::new(),
            post_url: OnceSlot::new(),
            events: EventSink::new(),
            reader: StdMutex::new(None),
            closed: Arc::new(AtomicBool::new(false)),
        }
    }

    async fn post_raw(&self, url: &str, envelope: &Envelope) -> MooringResult<()> {
        let body = envelope::encode(envelope)?;
        let response = self
            .http
            .post(url)
            .header("Content-Type", "application/json")
            .body(body)
            .timeout(Duration::from_secs(POST_TIMEOUT_SECS))
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    MooringError::Timeout
                } else {
                    MooringError::Transport(format!("message post failed: {e}"))
                }
            })?;

        if !response.status().is_success() {
            return Err(MooringError::Transport(format!(
                "message post rejected: {}",
                response.status()
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl Endpoint for StreamClientEndpoint {
    async fn start(&self) -> MooringResult<()> {
        let response = self
            .http
            .get(&self.config.sse_url)
            .header("Accept", "text/event-stream")
            .send()
            .await
            .map_err(|e| MooringError::Transport(format!("event stream connect failed: {e}")))?;

        if !response.status().is_success() {
            return Err(MooringError::Transport(format!(
                "event stream rejected: {}",
                response.status()
            )));
        }
        info!(url = %self.config.sse_url, "stream transport connected");

        let base_url = self.config.sse_url.clone();
        let handle = tokio::spawn(stream_loop(
            response,
            base_url,
            self.post_url.clone(),
            self.identity.clone(),
            self.events.clone(),
            self.closed.clone(),
        ));
        if let Ok(mut reader) = self.reader.lock() {
            *reader = Some(handle);
        }

        // The first stream event announces where to POST; only then can
        // the initialize request go out.
        let timeout = Duration::from_secs(self.config.handshake_timeout_secs);
        let post_url = match time::timeout(timeout, self.post_url.wait()).await {
            Ok(Ok(url)) => url,
            Ok(Err(e)) => return Err(e),
            Err(_) => return Err(MooringError::Timeout),
        };

        self.post_raw(&post_url, &Envelope::initialize()).await?;

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
        let url = self.post_url.wait().await?;
        self.post_raw(&url, &envelope).await
    }

    async fn close(&self) -> MooringResult<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        // Dropping the response body ends the push stream.
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

impl Drop for StreamClientEndpoint {
    fn drop(&mut self) {
        if let Ok(mut reader) = self.reader.lock() {
            if let Some(handle) = reader.take() {
                handle.abort();
            }
        }
    }
}

/// Read the event stream until it ends or the endpoint closes.
async fn stream_loop(
    response: reqwest::Response,
    base_url: String,
    post_url: OnceSlot,
    identity: OnceSlot,
    events: EventSink<EndpointEvent>,
    closed: Arc<AtomicBool>,
) {
    let mut stream = response.bytes_stream();
    let mut parser = SseParser::new();

    'outer: while let Some(chunk) = stream.next().await {
        let chunk = match chunk {
            Ok(chunk) => chunk,
            Err(e) => {
                events.emit(EndpointEvent::Error(MooringError::Transport(format!(
                    "event stream read failed: {e}"
                ))));
                break;
            }
        };

        for event in parser.feed(&String::from_utf8_lossy(&chunk)) {
            match event.name.as_str() {
                "endpoint" => {
                    post_url.resolve(join_url(&base_url, &event.data));
                }
                "message" => match envelope::decode(&event.data) {
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
                        events.emit(EndpointEvent::Error(e));
                        break 'outer;
                    }
                },
                other => debug!(event = %other, "ignoring unknown stream event"),
            }
        }
    }

    if !closed.swap(true, Ordering::SeqCst) {
        events.emit(EndpointEvent::Closed);
    }
}

/// One parsed server-sent event.
#[derive(Debug, Clone, PartialEq, Eq)]
struct SseEvent {
    name: String,
    data: String,
}

/// Incremental server-sent-event parser.
///
/// Feeds arbitrary chunk boundaries and yields complete events
/// (terminated by a blank line). Comment lines and unknown fields are
/// skipped; multiple `data:` lines are joined with newlines.
#[derive(Debug, Default)]
struct SseParser {
    buffer: String,
    name: Option<String>,
    data: Vec<String>,
}

impl SseParser {
    fn new() -> Self {
        Self::default()
    }

    fn feed(&mut self, chunk: &str) -> Vec<SseEvent> {
        self.buffer.push_str(chunk);
        let mut events = Vec::new();

        while let Some(newline) = self.buffer.find('\n') {
            let line: String = self.buffer.drain(..=newline).collect();
            let line = line.trim_end_matches(['\n', '\r']);

            if line.is_empty() {
                if !self.data.is_empty() {
                    events.push(SseEvent {
                        name: self.name.take().unwrap_or_else(|| "message".to_string()),
                        data: self.data.join("\n"),
                    });
                }
                self.name = None;
                self.data.clear();
            } else if let Some(rest) = line.strip_prefix("event:") {
                self.name = Some(rest.trim_start().to_string());
            } else if let Some(rest) = line.strip_prefix("data:") {
                self.data.push(rest.trim_start().to_string());
            }
            // Comments (":...") and other fields are ignored.
        }

        events
    }
}

/// Resolve an announced message URL against the stream URL.
fn join_url(base: &str, target: &str) -> String {
    if target.starts_with("http://") || target.starts_with("https://") {
        return target.to_string();
    }

    // Origin: scheme://host[:port]
    let origin = match base.find("://") {
        Some(scheme_end) => match base[scheme_end + 3..].find('/') {
            Some(path_start) => &base[..scheme_end + 3 + path_start],
            None => base,
        },
        None => base,
    };

    if target.starts_with('/') {
        format!("{origin}{target}")
    } else {
        format!("{origin}/{target}")
    }
}
