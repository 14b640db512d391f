//! Stream transport: the server half of the SSE + POST fallback.
//!
//! The endpoint holds the push side of one event-stream connection.
//! POSTed envelopes are routed in by the front door through
//! [`StreamServerEndpoint::deliver`]; `send` pushes envelopes onto the
//! stream. The client id is assigned locally at construction, so the
//! identity is resolved from the start — the initialize request just
//! gets its reply pushed back.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};

use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::debug;

use mooring_core::endpoint::{Endpoint, EndpointEvent, EventSink};
use mooring_core::envelope::Envelope;
use mooring_core::error::{MooringError, MooringResult};

/// Server-side stream endpoint, one per event-stream connection.
pub struct StreamServerEndpoint {
    client_id: String,
    outgoing: StdMutex<Option<mpsc::UnboundedSender<Envelope>>>,
    events: EventSink<EndpointEvent>,
    closed: AtomicBool,
}

impl StreamServerEndpoint {
    /// Build the endpoint and hand back the receiver feeding the
    /// event stream.
    pub fn new(client_id: &str) -> (Arc<Self>, mpsc::UnboundedReceiver<Envelope>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let endpoint = Arc::new(Self {
            client_id: client_id.to_string(),
            outgoing: StdMutex::new(Some(tx)),
            events: EventSink::new(),
            closed: AtomicBool::new(false),
        });
        (endpoint, rx)
    }

    /// Route one POSTed envelope into the endpoint.
    pub fn deliver(&self, envelope: Envelope) {
        if envelope.is_initialize() {
            // Handshake over the stream transport: push the identity
            // back on the event stream.
            debug!(client_id = %self.client_id, "stream handshake");
            self.push(Envelope::initialize_reply(&self.client_id));
        } else {
            self.events.emit(EndpointEvent::Message(envelope));
        }
    }

    fn push(&self, envelope: Envelope) {
        if let Ok(outgoing) = self.outgoing.lock() {
            if let Some(tx) = outgoing.as_ref() {
                let _ = tx.send(envelope);
            }
        }
    }
}

#[async_trait]
impl Endpoint for StreamServerEndpoint {
    async fn start(&self) -> MooringResult<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(MooringError::Closed);
        }
        Ok(())
    }

    async fn send(&self, envelope: Envelope) -> MooringResult<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(MooringError::Closed);
        }
        let outgoing = self
            .outgoing
            .lock()
            .map_err(|_| MooringError::Closed)?;
        match outgoing.as_ref() {
            Some(tx) => tx.send(envelope).map_err(|_| MooringError::Closed),
            None => Err(MooringError::Closed),
        }
    }

    async fn close(&self) -> MooringResult<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        // Dropping the sender ends the push stream.
        if let Ok(mut outgoing) = self.outgoing.lock() {
            outgoing.take();
        }
        self.events.emit(EndpointEvent::Closed);
        Ok(())
    }

    fn client_id(&self) -> Option<String> {
        Some(self.client_id.clone())
    }

    fn events(&self) -> &EventSink<EndpointEvent> {
        &self.events
    }
}
