//! mooring-client: Rust client library for mooring.
//!
//! A client process moors to the rendezvous server over one of two
//! transports and then receives proxied tool-session traffic through
//! the endpoint contract:
//!
//! - [`SocketClientEndpoint`] — a long-lived WebSocket carrying JSON
//!   envelope frames; many logical sessions are multiplexed over it by
//!   the server side.
//! - [`StreamClientEndpoint`] — the per-session fallback: a persistent
//!   one-way event stream for receiving plus HTTP POST for sending.
//!
//! Both perform the identity handshake during `start()` and surface
//! inbound traffic through their event sink.

pub mod socket;
pub mod stream;

pub use socket::{ConnectConfig, SocketClientEndpoint};
pub use stream::{StreamClientEndpoint, StreamConfig};
