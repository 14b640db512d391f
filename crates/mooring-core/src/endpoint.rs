//! The endpoint and channel contracts shared by every transport.
//!
//! An [`Endpoint`] is a bidirectional envelope channel with an identity
//! handshake; a [`Channel`] is the same shape one level up, carrying
//! unwrapped application messages. Both deliver inbound traffic through
//! an [`EventSink`] that the OWNER of the endpoint attaches a receiver
//! to — routing logic lives above the transport, and detaching the sink
//! is the explicit unsubscription used during teardown.

use crate::envelope::Envelope;
use crate::error::{MooringError, MooringResult};
use async_trait::async_trait;
use serde_json::Value;
use std::sync::{Arc, Mutex};
use tokio::sync::{mpsc, watch};

/// Events emitted by an endpoint to its owner.
#[derive(Debug)]
pub enum EndpointEvent {
    /// An inbound envelope (never the handshake — identity is consumed
    /// by the endpoint itself).
    Message(Envelope),
    /// A transport-level failure. The endpoint is expected to close
    /// afterwards rather than continue in an undefined state.
    Error(MooringError),
    /// The peer or the transport closed the connection. Terminal.
    Closed,
}

/// Events emitted by a channel to its owner.
#[derive(Debug)]
pub enum ChannelEvent {
    /// An inbound application message with its side-channel metadata.
    Message { data: Value, extra: Option<Value> },
    Error(MooringError),
    Closed,
}

/// Single-consumer event outlet.
///
/// The producing side holds the sink and `emit`s into it; the consuming
/// side `attach`es to obtain a receiver. Attaching again replaces the
/// previous receiver; `detach` drops the sender so later emits go
/// nowhere. Emits are fire-and-forget: events for a detached sink are
/// discarded, which is exactly the post-close behavior the proxy relies
/// on.
#[derive(Debug)]
pub struct EventSink<T> {
    tx: Arc<Mutex<Option<mpsc::UnboundedSender<T>>>>,
}

impl<T> Clone for EventSink<T> {
    fn clone(&self) -> Self {
        Self {
            tx: Arc::clone(&self.tx),
        }
    }
}

impl<T> Default for EventSink<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> EventSink<T> {
    pub fn new() -> Self {
        Self {
            tx: Arc::new(Mutex::new(None)),
        }
    }

    /// Attach a receiver, replacing any previous one.
    pub fn attach(&self) -> mpsc::UnboundedReceiver<T> {
        let (tx, rx) = mpsc::unbounded_channel();
        if let Ok(mut slot) = self.tx.lock() {
            *slot = Some(tx);
        }
        rx
    }

    /// Drop the current receiver binding. Subsequent emits are discarded.
    pub fn detach(&self) {
        if let Ok(mut slot) = self.tx.lock() {
            *slot = None;
        }
    }

    /// Deliver an event to the attached receiver, if any.
    ///
    /// Returns `true` if the event was accepted.
    pub fn emit(&self, event: T) -> bool {
        match self.tx.lock() {
            Ok(slot) => match slot.as_ref() {
                Some(tx) => tx.send(event).is_ok(),
                None => false,
            },
            Err(_) => false,
        }
    }

    pub fn is_attached(&self) -> bool {
        self.tx.lock().map(|slot| slot.is_some()).unwrap_or(false)
    }
}

/// A one-shot, multi-waiter value slot.
///
/// Backs the identity handshake: the slot resolves exactly once (the
/// first resolution wins), and any number of senders can `wait` for it
/// before transmitting. Also used for other start-time facts learned
/// from the peer, such as the stream transport's message URL.
#[derive(Debug, Clone)]
pub struct OnceSlot {
    tx: watch::Sender<Option<String>>,
}

impl Default for OnceSlot {
    fn default() -> Self {
        Self::new()
    }
}

impl OnceSlot {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(None);
        Self { tx }
    }

    /// Resolve the slot. Only the first call takes effect; returns
    /// whether this call was the one that resolved it.
    pub fn resolve(&self, value: impl Into<String>) -> bool {
        let value = value.into();
        self.tx.send_if_modified(|slot| {
            if slot.is_none() {
                *slot = Some(value);
                true
            } else {
                false
            }
        })
    }

    /// The resolved value, if any.
    pub fn get(&self) -> Option<String> {
        self.tx.borrow().clone()
    }

    /// Suspend until the slot resolves.
    pub async fn wait(&self) -> MooringResult<String> {
        let mut rx = self.tx.subscribe();
        loop {
            if let Some(value) = rx.borrow_and_update().clone() {
                return Ok(value);
            }
            rx.changed().await.map_err(|_| MooringError::Closed)?;
        }
    }
}

/// A bidirectional envelope channel with an identity handshake.
///
/// Endpoints are single-use: created, `start`ed (which performs or
/// completes the handshake), pumped until one side closes, then done.
/// Every `send` of a non-initialize envelope must await the identity,
/// so the peer always learns who it is talking to before any
/// application traffic — the handshake response totally precedes the
/// first application message.
#[async_trait]
pub trait Endpoint: Send + Sync {
    /// Run the handshake (client variants) or confirm readiness
    /// (server variants). Must not resolve before `client_id` is
    /// usable.
    async fn start(&self) -> MooringResult<()>;

    /// Transmit one envelope. Initialize envelopes bypass the identity
    /// wait; everything else suspends until the handshake settled.
    async fn send(&self, envelope: Envelope) -> MooringResult<()>;

    /// Tear the endpoint down. Idempotent.
    async fn close(&self) -> MooringResult<()>;

    /// The client identity, once known.
    fn client_id(&self) -> Option<String>;

    /// The sink this endpoint delivers inbound events through.
    fn events(&self) -> &EventSink<EndpointEvent>;
}

/// A generic bidirectional message channel, as consumed by the proxy
/// (inbound side) and produced by the transport adapter (outbound
/// side). Same lifecycle as [`Endpoint`], but it carries bare
/// application messages rather than envelopes and has no identity of
/// its own.
#[async_trait]
pub trait Channel: Send + Sync {
    async fn start(&self) -> MooringResult<()>;
    async fn send(&self, message: Value) -> MooringResult<()>;
    async fn close(&self) -> MooringResult<()>;
    fn events(&self) -> &EventSink<ChannelEvent>;
}
