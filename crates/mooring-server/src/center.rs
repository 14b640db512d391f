//! Connector registry: client identity → endpoint or endpoint factory.
//!
//! A `Direct` entry is one endpoint per client (single-session mode,
//! the stream transport). A `Factory` entry mints a NEW session-scoped
//! endpoint per lookup, which is what lets one physical socket back any
//! number of logical sessions. Entries are removed when the owning
//! physical connection closes; session-scoped endpoints are ephemeral
//! wrappers, never registry entries.

use std::collections::HashMap;
use std::sync::Arc;

use rand::Rng;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use mooring_core::endpoint::Endpoint;
use mooring_core::error::MooringResult;

/// Mints a session-scoped endpoint for the given session id.
pub type EndpointFactory = Box<dyn Fn(&str) -> MooringResult<Arc<dyn Endpoint>> + Send + Sync>;

/// A registered client: either a ready endpoint or a factory for
/// session-scoped ones.
pub enum ClientEntry {
    Direct(Arc<dyn Endpoint>),
    Factory(EndpointFactory),
}

/// In-memory registry of moored clients.
#[derive(Default)]
pub struct ConnectorCenter {
    clients: RwLock<HashMap<String, ClientEntry>>,
}

impl ConnectorCenter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a client. Overwrites silently — last write wins, which
    /// is what lets a reconnecting client reclaim its identity.
    pub async fn set_client(&self, client_id: &str, entry: ClientEntry) {
        let mut clients = self.clients.write().await;
        if clients.insert(client_id.to_string(), entry).is_some() {
            debug!(client_id = %client_id, "client entry overwritten");
        } else {
            info!(client_id = %client_id, "client registered");
        }
    }

    /// Resolve a client to an endpoint, optionally scoped to a session.
    ///
    /// Unknown ids yield `None` — the caller treats that as "target
    /// unreachable" and fails the inbound request, never blocks.
    pub async fn get_client(
        &self,
        client_id: &str,
        session_id: Option<&str>,
    ) -> Option<Arc<dyn Endpoint>> {
        let clients = self.clients.read().await;
        match clients.get(client_id)? {
            ClientEntry::Direct(endpoint) => Some(endpoint.clone()),
            ClientEntry::Factory(factory) => {
                let session_id = match session_id {
                    Some(id) => id.to_string(),
                    None => generate_session_id(),
                };
                match factory(&session_id) {
                    Ok(endpoint) => Some(endpoint),
                    Err(e) => {
                        warn!(client_id = %client_id, session_id = %session_id, error = %e,
                            "endpoint factory failed");
                        None
                    }
                }
            }
        }
    }

    /// Drop a client entry. Invoked by the owning transport when the
    /// physical connection closes.
    pub async fn remove_client(&self, client_id: &str) -> bool {
        let removed = self.clients.write().await.remove(client_id).is_some();
        if removed {
            debug!(client_id = %client_id, "client removed");
        }
        removed
    }

    pub async fn contains(&self, client_id: &str) -> bool {
        self.clients.read().await.contains_key(client_id)
    }

    /// Number of registered clients.
    pub async fn count(&self) -> usize {
        self.clients.read().await.len()
    }
}

/// Random identity for a newly moored client.
pub fn generate_client_id() -> String {
    random_hex(8)
}

/// Random id for a logical session (used when the caller supplies none).
pub fn generate_session_id() -> String {
    random_hex(16)
}

fn random_hex(len: usize) -> String {
    let mut rng = rand::thread_rng();
    let bytes: Vec<u8> = (0..len).map(|_| rng.gen()).collect();
    hex::encode(bytes)
}
