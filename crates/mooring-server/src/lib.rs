//! mooring-server: rendezvous server for mooring connectors.
//!
//! Clients moor over a long-lived WebSocket (multiplexed, many logical
//! sessions per socket) or over SSE + POST (one endpoint per stream).
//! Inbound tool sessions arrive through the HTTP front door and are
//! bridged to the target client by a [`proxy::ProxyServer`], with the
//! [`center::ConnectorCenter`] as the only shared registry.

pub mod center;
pub mod config;
pub mod http;
pub mod proxy;
pub mod socket;
pub mod stream;
pub mod testing;

pub use center::{ClientEntry, ConnectorCenter, EndpointFactory};
pub use http::FrontDoorState;
pub use proxy::ProxyServer;
pub use socket::{SessionMode, SocketConnection, SocketServerEndpoint};
pub use stream::StreamServerEndpoint;
