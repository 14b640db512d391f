//! Adapter exposing an [`Endpoint`] as a generic message [`Channel`].
//!
//! The tool-calling runtime on the initiating side wants to connect to
//! something shaped like `start/send/close` that speaks application
//! messages; the endpoint underneath speaks envelopes and has a
//! handshake. The adapter builds the endpoint eagerly (via a factory,
//! so callers can defer choosing the transport until construction) but
//! runs its handshake only when the owner calls `start()`.

use crate::endpoint::{Channel, ChannelEvent, Endpoint, EndpointEvent, EventSink};
use crate::envelope::Envelope;
use crate::error::MooringResult;
use async_trait::async_trait;
use serde_json::Value;
use std::sync::{Arc, Mutex};
use tokio::task::JoinHandle;

/// Wraps an endpoint behind the channel contract.
pub struct EndpointChannel {
    endpoint: Arc<dyn Endpoint>,
    events: EventSink<ChannelEvent>,
    pump: Mutex<Option<JoinHandle<()>>>,
}

impl EndpointChannel {
    /// Build the adapter. The factory runs immediately — the endpoint
    /// object exists from here on — but its handshake is deferred to
    /// [`Channel::start`].
    pub fn new<F>(factory: F) -> Self
    where
        F: FnOnce() -> Arc<dyn Endpoint>,
    {
        Self {
            endpoint: factory(),
            events: EventSink::new(),
            pump: Mutex::new(None),
        }
    }

    /// The wrapped endpoint.
    pub fn endpoint(&self) -> &Arc<dyn Endpoint> {
        &self.endpoint
    }
}

#[async_trait]
impl Channel for EndpointChannel {
    async fn start(&self) -> MooringResult<()> {
        let mut rx = self.endpoint.events().attach();
        let events = self.events.clone();
        let handle = tokio::spawn(async move {
            while let Some(ev) = rx.recv().await {
                match ev {
                    EndpointEvent::Message(envelope) => {
                        let Envelope { data, extra, .. } = envelope;
                        events.emit(ChannelEvent::Message {
                            data: data.unwrap_or(Value::Null),
                            extra,
                        });
                    }
                    EndpointEvent::Error(e) => {
                        events.emit(ChannelEvent::Error(e));
                    }
                    EndpointEvent::Closed => {
                        events.emit(ChannelEvent::Closed);
                        break;
                    }
                }
            }
        });
        if let Ok(mut pump) = self.pump.lock() {
            *pump = Some(handle);
        }

        self.endpoint.start().await
    }

    async fn send(&self, message: Value) -> MooringResult<()> {
        self.endpoint.send(Envelope::message(message, None)).await
    }

    async fn close(&self) -> MooringResult<()> {
        self.endpoint.close().await
    }

    fn events(&self) -> &EventSink<ChannelEvent> {
        &self.events
    }
}

impl Drop for EndpointChannel {
    fn drop(&mut self) {
        if let Ok(mut pump) = self.pump.lock() {
            if let Some(handle) = pump.take() {
                handle.abort();
            }
        }
    }
}
