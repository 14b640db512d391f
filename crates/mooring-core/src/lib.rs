//! mooring-core: Shared protocol library for mooring.
//!
//! Provides the JSON message envelope, the endpoint/channel contracts
//! with their event plumbing, session-scope id rewriting for shared
//! connections, and the transport adapter used by the initiating side.

pub mod adapter;
pub mod endpoint;
pub mod envelope;
pub mod error;
pub mod scope;

// Re-export commonly used items at crate root.
pub use adapter::EndpointChannel;
pub use endpoint::{Channel, ChannelEvent, Endpoint, EndpointEvent, EventSink, OnceSlot};
pub use envelope::{decode, encode, inject_verify_code, Envelope, EnvelopeKind};
pub use error::{MooringError, MooringResult};
pub use scope::{scope_request_id, unscope_response_id, validate_server_id, SCOPE_DELIMITER};
