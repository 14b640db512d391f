//! HTTP front door.
//!
//! Two surfaces share one axum router:
//!
//! - `/moor/*` — the client-process side of the stream transport. A
//!   `GET /moor/sse` mints a stream endpoint and registers it in the
//!   ConnectorCenter; envelopes are POSTed to `/moor/message`.
//! - `/mcp/*` — the control-plane side. A `GET /mcp/sse` resolves the
//!   target client from the `connector-client-id` header, builds a
//!   proxy over an SSE-backed inbound channel, and streams responses;
//!   requests are POSTed to `/mcp/message`.
//!
//! The session table lives here: the core only ever sees the channel
//! contract, never a request object.

use std::collections::HashMap;
use std::convert::Infallible;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use async_trait::async_trait;
use axum::{
    extract::{Query, State},
    http::{HeaderMap, StatusCode},
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Json, Response,
    },
    routing::{get, post},
    Router,
};
use futures_util::stream::Stream;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::sync::{mpsc, RwLock};
use tower_http::cors::{Any, CorsLayer};
use tracing::{info, warn};

use mooring_core::endpoint::{Channel, ChannelEvent, Endpoint, EventSink};
use mooring_core::envelope::{self, Envelope};
use mooring_core::error::{MooringError, MooringResult};

use crate::center::{generate_client_id, generate_session_id, ClientEntry, ConnectorCenter};
use crate::proxy::ProxyServer;
use crate::stream::StreamServerEndpoint;

/// Interval between SSE keep-alive comments.
const KEEP_ALIVE_SECS: u64 = 15;

/// Shared front-door state.
#[derive(Clone)]
pub struct FrontDoorState {
    center: Arc<ConnectorCenter>,
    /// Stream-moored clients, for routing their POSTed envelopes.
    moorings: Arc<RwLock<HashMap<String, Arc<StreamServerEndpoint>>>>,
    /// Inbound tool sessions, keyed by session id.
    sessions: Arc<RwLock<HashMap<String, InboundSession>>>,
}

#[derive(Clone)]
struct InboundSession {
    channel: Arc<SseChannel>,
    proxy: Arc<ProxyServer>,
}

impl FrontDoorState {
    pub fn new(center: Arc<ConnectorCenter>) -> Self {
        Self {
            center,
            moorings: Arc::new(RwLock::new(HashMap::new())),
            sessions: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    pub fn center(&self) -> &Arc<ConnectorCenter> {
        &self.center
    }

    /// Moor a client over the stream transport.
    pub async fn open_mooring(
        &self,
    ) -> (String, Arc<StreamServerEndpoint>, mpsc::UnboundedReceiver<Envelope>) {
        let client_id = generate_client_id();
        let (endpoint, rx) = StreamServerEndpoint::new(&client_id);
        self.center
            .set_client(&client_id, ClientEntry::Direct(endpoint.clone()))
            .await;
        self.moorings
            .write()
            .await
            .insert(client_id.clone(), endpoint.clone());
        (client_id, endpoint, rx)
    }

    /// The stream connection went away: unregister and close.
    pub async fn end_mooring(&self, client_id: &str) {
        let endpoint = self.moorings.write().await.remove(client_id);
        self.center.remove_client(client_id).await;
        if let Some(endpoint) = endpoint {
            let _ = endpoint.close().await;
            info!(client_id = %client_id, "client unmoored");
        }
    }

    /// Route one POSTed envelope to a stream-moored client.
    pub async fn deliver_mooring(&self, client_id: &str, envelope: Envelope) -> bool {
        match self.moorings.read().await.get(client_id) {
            Some(endpoint) => {
                endpoint.deliver(envelope);
                true
            }
            None => false,
        }
    }

    /// Open an inbound tool session against a moored client.
    pub async fn open_session(
        &self,
        client_id: &str,
        session_id: Option<&str>,
        verify_code: Option<&str>,
    ) -> MooringResult<(String, mpsc::UnboundedReceiver<Value>)> {
        let session_id = match session_id {
            Some(id) => id.to_string(),
            None => generate_session_id(),
        };
        let endpoint = self
            .center
            .get_client(client_id, Some(&session_id))
            .await
            .ok_or_else(|| MooringError::UnknownClient(client_id.to_string()))?;

        let (channel, rx) = SseChannel::new();
        let proxy = Arc::new(ProxyServer::new());
        proxy.set_endpoint(endpoint).await;
        if let Some(code) = verify_code {
            proxy.set_verify_code(code).await;
        }
        proxy.connect(channel.clone() as Arc<dyn Channel>).await?;

        self.sessions
            .write()
            .await
            .insert(session_id.clone(), InboundSession { channel, proxy });
        info!(client_id = %client_id, session_id = %session_id, "inbound session opened");
        Ok((session_id, rx))
    }

    /// The inbound stream went away: close the bridge.
    pub async fn end_session(&self, session_id: &str) {
        let session = self.sessions.write().await.remove(session_id);
        if let Some(session) = session {
            let _ = session.proxy.close().await;
            info!(session_id = %session_id, "inbound session closed");
        }
    }

    /// Route one POSTed request into an inbound session.
    pub async fn deliver_session(&self, session_id: &str, message: Value) -> bool {
        match self.sessions.read().await.get(session_id) {
            Some(session) => {
                session.channel.deliver(message);
                true
            }
            None => false,
        }
    }

    /// Number of live inbound sessions.
    pub async fn session_count(&self) -> usize {
        self.sessions.read().await.len()
    }
}

/// Inbound channel backed by the session's SSE response stream.
pub struct SseChannel {
    outgoing: StdMutex<Option<mpsc::UnboundedSender<Value>>>,
    events: EventSink<ChannelEvent>,
    closed: AtomicBool,
}

impl SseChannel {
    fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<Value>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let channel = Arc::new(Self {
            outgoing: StdMutex::new(Some(tx)),
            events: EventSink::new(),
            closed: AtomicBool::new(false),
        });
        (channel, rx)
    }

    /// Feed one POSTed request into the bridge.
    fn deliver(&self, data: Value) {
        self.events.emit(ChannelEvent::Message { data, extra: None });
    }
}

#[async_trait]
impl Channel for SseChannel {
    async fn start(&self) -> MooringResult<()> {
        Ok(())
    }

    async fn send(&self, message: Value) -> MooringResult<()> {
        let outgoing = self.outgoing.lock().map_err(|_| MooringError::Closed)?;
        match outgoing.as_ref() {
            Some(tx) => tx.send(message).map_err(|_| MooringError::Closed),
            None => Err(MooringError::Closed),
        }
    }

    async fn close(&self) -> MooringResult<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        if let Ok(mut outgoing) = self.outgoing.lock() {
            outgoing.take();
        }
        self.events.emit(ChannelEvent::Closed);
        Ok(())
    }

    fn events(&self) -> &EventSink<ChannelEvent> {
        &self.events
    }
}

/// Build the front-door router.
pub fn router(state: FrontDoorState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/moor/sse", get(moor_sse))
        .route("/moor/message", post(moor_message))
        .route("/mcp/sse", get(mcp_sse))
        .route("/mcp/message", post(mcp_message))
        .layer(cors)
        .with_state(state)
}

fn keep_alive() -> KeepAlive {
    KeepAlive::new()
        .interval(Duration::from_secs(KEEP_ALIVE_SECS))
        .text("ping")
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|value| value.to_str().ok())
}

/// Cleans up a mooring when its stream is dropped.
struct MooringGuard {
    state: FrontDoorState,
    client_id: String,
}

impl Drop for MooringGuard {
    fn drop(&mut self) {
        let state = self.state.clone();
        let client_id = std::mem::take(&mut self.client_id);
        tokio::spawn(async move {
            state.end_mooring(&client_id).await;
        });
    }
}

/// Cleans up an inbound session when its stream is dropped.
struct SessionGuard {
    state: FrontDoorState,
    session_id: String,
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        let state = self.state.clone();
        let session_id = std::mem::take(&mut self.session_id);
        tokio::spawn(async move {
            state.end_session(&session_id).await;
        });
    }
}

/// Client-process side: establish the stream transport.
async fn moor_sse(
    State(state): State<FrontDoorState>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let (client_id, _endpoint, mut rx) = state.open_mooring().await;
    let message_url = format!("/moor/message?clientId={client_id}");
    info!(client_id = %client_id, "mooring stream established");

    let guard = MooringGuard {
        state: state.clone(),
        client_id,
    };
    let stream = async_stream::stream! {
        let _guard = guard;
        yield Ok(Event::default().event("endpoint").data(message_url));
        while let Some(envelope) = rx.recv().await {
            match envelope::encode(&envelope) {
                Ok(data) => yield Ok(Event::default().event("message").data(data)),
                Err(e) => warn!(error = %e, "could not encode envelope"),
            }
        }
    };

    Sse::new(stream).keep_alive(keep_alive())
}

#[derive(Deserialize)]
struct MoorQuery {
    #[serde(rename = "clientId")]
    client_id: String,
}

/// Client-process side: envelope POSTs.
async fn moor_message(
    State(state): State<FrontDoorState>,
    Query(query): Query<MoorQuery>,
    Json(envelope): Json<Envelope>,
) -> impl IntoResponse {
    if state.deliver_mooring(&query.client_id, envelope).await {
        (StatusCode::ACCEPTED, Json(json!({ "status": "ok" })))
    } else {
        (
            StatusCode::NOT_FOUND,
            Json(json!({ "error": "unknown client" })),
        )
    }
}

/// Control-plane side: open a proxied tool session.
async fn mcp_sse(State(state): State<FrontDoorState>, headers: HeaderMap) -> Response {
    let Some(client_id) = header_str(&headers, "connector-client-id") else {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({ "error": "missing connector-client-id header" })),
        )
            .into_response();
    };
    let session_id = header_str(&headers, "mcp-session-id");
    let verify_code = header_str(&headers, "mcp-verify-code");

    match state.open_session(client_id, session_id, verify_code).await {
        Ok((session_id, mut rx)) => {
            let message_url = format!("/mcp/message?sessionId={session_id}");
            let guard = SessionGuard {
                state: state.clone(),
                session_id,
            };
            let stream = async_stream::stream! {
                let _guard = guard;
                yield Ok::<_, Infallible>(Event::default().event("endpoint").data(message_url));
                while let Some(message) = rx.recv().await {
                    match serde_json::to_string(&message) {
                        Ok(data) => yield Ok(Event::default().event("message").data(data)),
                        Err(e) => warn!(error = %e, "could not encode message"),
                    }
                }
            };
            Sse::new(stream).keep_alive(keep_alive()).into_response()
        }
        Err(MooringError::UnknownClient(id)) => {
            warn!(client_id = %id, "inbound session for unknown client");
            (
                StatusCode::NOT_FOUND,
                Json(json!({ "error": format!("no such client: {id}") })),
            )
                .into_response()
        }
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({ "error": e.to_string() })),
        )
            .into_response(),
    }
}

#[derive(Deserialize)]
struct SessionQuery {
    #[serde(rename = "sessionId")]
    session_id: String,
}

/// Control-plane side: request POSTs.
async fn mcp_message(
    State(state): State<FrontDoorState>,
    Query(query): Query<SessionQuery>,
    Json(message): Json<Value>,
) -> impl IntoResponse {
    if state.deliver_session(&query.session_id, message).await {
        (StatusCode::ACCEPTED, Json(json!({ "status": "ok" })))
    } else {
        (
            StatusCode::NOT_FOUND,
            Json(json!({ "error": "unknown session" })),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MockEndpoint;
    use serde_json::json;
    use std::time::Duration;

    fn test_state() -> FrontDoorState {
        FrontDoorState::new(Arc::new(ConnectorCenter::new()))
    }

    #[test]
    fn router_builds() {
        let _router = router(test_state());
    }

    #[tokio::test]
    async fn mooring_lifecycle_registers_and_cleans_up() {
        let state = test_state();
        let (client_id, _endpoint, mut rx) = state.open_mooring().await;
        assert!(state.center().contains(&client_id).await);

        // Handshake over the stream transport.
        assert!(state
            .deliver_mooring(&client_id, Envelope::initialize())
            .await);
        let reply = rx.recv().await.unwrap();
        assert_eq!(reply.handshake_client_id(), Some(client_id.as_str()));

        state.end_mooring(&client_id).await;
        assert!(!state.center().contains(&client_id).await);
        assert!(!state.deliver_mooring(&client_id, Envelope::initialize()).await);
    }

    #[tokio::test]
    async fn open_session_for_unknown_client_fails_fast() {
        let state = test_state();
        let err = state.open_session("ghost", None, None).await.unwrap_err();
        assert!(matches!(err, MooringError::UnknownClient(_)));
    }

    #[tokio::test]
    async fn session_bridges_to_direct_endpoint_with_verify_code() {
        let state = test_state();
        let endpoint = MockEndpoint::new("c1");
        state
            .center()
            .set_client("c1", ClientEntry::Direct(endpoint.clone()))
            .await;

        let (session_id, mut rx) = state
            .open_session("c1", Some("fixed"), Some("tok"))
            .await
            .unwrap();
        assert_eq!(session_id, "fixed");
        assert_eq!(state.session_count().await, 1);

        // Request flows toward the client, decorated.
        assert!(state
            .deliver_session(&session_id, json!({"id": 1, "method": "doTask"}))
            .await);
        tokio::time::sleep(Duration::from_millis(20)).await;
        let sent = endpoint.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(
            sent[0].extra.as_ref().unwrap()["authInfo"]["extra"]["verifyCode"],
            "tok"
        );

        // Response flows back to the session stream, bare.
        endpoint.push(Envelope::message(json!({"id": 1, "result": "ok"}), None));
        let message = rx.recv().await.unwrap();
        assert_eq!(message, json!({"id": 1, "result": "ok"}));

        state.end_session(&session_id).await;
        assert_eq!(state.session_count().await, 0);
        assert!(!state.deliver_session(&session_id, json!({"id": 2})).await);
    }

    #[tokio::test]
    async fn ended_session_is_silent_even_if_endpoint_chatters() {
        let state = test_state();
        let endpoint = MockEndpoint::new("c1");
        state
            .center()
            .set_client("c1", ClientEntry::Direct(endpoint.clone()))
            .await;

        let (session_id, mut rx) = state.open_session("c1", None, None).await.unwrap();
        state.end_session(&session_id).await;

        endpoint.push(Envelope::message(json!({"id": 9, "result": "late"}), None));
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(rx.recv().await.is_none());
    }

    #[test]
    fn header_lookup_is_case_insensitive() {
        let mut headers = HeaderMap::new();
        headers.insert("connector-client-id", "c1".parse().unwrap());
        assert_eq!(header_str(&headers, "connector-client-id"), Some("c1"));
        assert_eq!(header_str(&headers, "mcp-verify-code"), None);
    }
}
