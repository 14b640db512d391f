//! Test doubles for the endpoint and channel contracts.
//!
//! Used by the unit tests here and by the integration tests under
//! `tests/`. Both doubles record what was sent through them and let the
//! test feed inbound events by hand.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::Value;

use mooring_core::endpoint::{Channel, ChannelEvent, Endpoint, EndpointEvent, EventSink};
use mooring_core::envelope::Envelope;
use mooring_core::error::MooringResult;

/// Endpoint double: records sends, events fed by the test.
pub struct MockEndpoint {
    client_id: String,
    events: EventSink<EndpointEvent>,
    sent: Mutex<Vec<Envelope>>,
    started: AtomicBool,
    closed: AtomicBool,
}

impl MockEndpoint {
    pub fn new(client_id: &str) -> Arc<Self> {
        Arc::new(Self {
            client_id: client_id.to_string(),
            events: EventSink::new(),
            sent: Mutex::new(Vec::new()),
            started: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        })
    }

    /// Everything sent through this endpoint so far.
    pub fn sent(&self) -> Vec<Envelope> {
        self.sent.lock().map(|sent| sent.clone()).unwrap_or_default()
    }

    /// Feed an inbound envelope, as if the peer had sent it.
    pub fn push(&self, envelope: Envelope) {
        self.events.emit(EndpointEvent::Message(envelope));
    }

    /// Feed a peer-initiated close.
    pub fn push_closed(&self) {
        self.events.emit(EndpointEvent::Closed);
    }

    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::SeqCst)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Endpoint for MockEndpoint {
    async fn start(&self) -> MooringResult<()> {
        self.started.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn send(&self, envelope: Envelope) -> MooringResult<()> {
        if let Ok(mut sent) = self.sent.lock() {
            sent.push(envelope);
        }
        Ok(())
    }

    async fn close(&self) -> MooringResult<()> {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.events.emit(EndpointEvent::Closed);
        }
        Ok(())
    }

    fn client_id(&self) -> Option<String> {
        Some(self.client_id.clone())
    }

    fn events(&self) -> &EventSink<EndpointEvent> {
        &self.events
    }
}

/// Channel double: records sends, messages fed by the test.
pub struct MockChannel {
    events: EventSink<ChannelEvent>,
    sent: Mutex<Vec<Value>>,
    started: AtomicBool,
    closed: AtomicBool,
}

impl MockChannel {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            events: EventSink::new(),
            sent: Mutex::new(Vec::new()),
            started: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        })
    }

    pub fn sent(&self) -> Vec<Value> {
        self.sent.lock().map(|sent| sent.clone()).unwrap_or_default()
    }

    /// Feed an inbound application message, as the front door would.
    pub fn push_message(&self, data: Value, extra: Option<Value>) {
        self.events.emit(ChannelEvent::Message { data, extra });
    }

    /// Feed a peer-initiated close.
    pub fn push_closed(&self) {
        self.events.emit(ChannelEvent::Closed);
    }

    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::SeqCst)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Channel for MockChannel {
    async fn start(&self) -> MooringResult<()> {
        self.started.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn send(&self, message: Value) -> MooringResult<()> {
        if let Ok(mut sent) = self.sent.lock() {
            sent.push(message);
        }
        Ok(())
    }

    async fn close(&self) -> MooringResult<()> {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.events.emit(ChannelEvent::Closed);
        }
        Ok(())
    }

    fn events(&self) -> &EventSink<ChannelEvent> {
        &self.events
    }
}
