//! Proxy bridge: one inbound channel paired with one outbound endpoint.
//!
//! The front door hands the proxy an inbound channel for a single tool
//! session; the ConnectorCenter hands it the outbound endpoint for the
//! target client. `connect()` wires the two and returns once the pump
//! is live. Requests flowing toward the client carry the verify code in
//! their envelope `extra`; the reverse direction is not decorated.
//!
//! Lifecycle: `Unbound → Bound → Active → Closed`, strictly forward.
//! A proxy is single-use — a second `connect()` fails and leaves the
//! first binding's message flow undisturbed.

use std::sync::Arc;

use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use mooring_core::endpoint::{Channel, ChannelEvent, Endpoint, EndpointEvent};
use mooring_core::envelope::{inject_verify_code, Envelope};
use mooring_core::error::{MooringError, MooringResult};

enum ProxyState {
    Unbound,
    Bound {
        endpoint: Arc<dyn Endpoint>,
    },
    Active {
        endpoint: Arc<dyn Endpoint>,
        channel: Arc<dyn Channel>,
        pump: JoinHandle<()>,
    },
    Closed,
}

/// Bridges one inbound channel to one outbound endpoint.
pub struct ProxyServer {
    state: Mutex<ProxyState>,
    verify_code: Mutex<Option<String>>,
}

impl Default for ProxyServer {
    fn default() -> Self {
        Self::new()
    }
}

impl ProxyServer {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(ProxyState::Unbound),
            verify_code: Mutex::new(None),
        }
    }

    /// Bind the outbound endpoint. Required before `connect()`.
    pub async fn set_endpoint(&self, endpoint: Arc<dyn Endpoint>) {
        let mut state = self.state.lock().await;
        match &*state {
            ProxyState::Unbound | ProxyState::Bound { .. } => {
                *state = ProxyState::Bound { endpoint };
            }
            _ => warn!("endpoint set on a proxy that is already connected"),
        }
    }

    /// Token merged into every request forwarded toward the client.
    pub async fn set_verify_code(&self, code: impl Into<String>) {
        *self.verify_code.lock().await = Some(code.into());
    }

    /// Wire the inbound channel to the bound endpoint and start the
    /// channel. Exactly once per proxy.
    pub async fn connect(&self, channel: Arc<dyn Channel>) -> MooringResult<()> {
        let verify_code = self.verify_code.lock().await.clone();
        {
            let mut state = self.state.lock().await;
            let endpoint = match &*state {
                ProxyState::Unbound => return Err(MooringError::NoEndpoint),
                ProxyState::Active { .. } | ProxyState::Closed => {
                    return Err(MooringError::AlreadyConnected)
                }
                ProxyState::Bound { endpoint } => endpoint.clone(),
            };

            let endpoint_rx = endpoint.events().attach();
            let channel_rx = channel.events().attach();
            let pump = tokio::spawn(bridge_loop(
                endpoint.clone(),
                channel.clone(),
                endpoint_rx,
                channel_rx,
                verify_code,
            ));
            *state = ProxyState::Active {
                endpoint,
                channel: channel.clone(),
                pump,
            };
        }

        channel.start().await
    }

    /// Tear the bridge down: detach both event sinks, stop the pump,
    /// close the inbound channel, drop the channel reference. The
    /// outbound endpoint object is NOT closed here — session-scoped
    /// endpoints are ephemeral wrappers cleaned up when the last
    /// reference drops, and direct endpoints outlive single sessions.
    pub async fn close(&self) -> MooringResult<()> {
        let prior = {
            let mut state = self.state.lock().await;
            std::mem::replace(&mut *state, ProxyState::Closed)
        };
        if let ProxyState::Active {
            endpoint,
            channel,
            pump,
        } = prior
        {
            endpoint.events().detach();
            pump.abort();
            channel.events().detach();
            let _ = channel.close().await;
            debug!("proxy closed");
        }
        Ok(())
    }

    /// Whether the bridge is currently pumping.
    pub async fn is_active(&self) -> bool {
        matches!(&*self.state.lock().await, ProxyState::Active { .. })
    }
}

/// Forward events in both directions until either side closes.
async fn bridge_loop(
    endpoint: Arc<dyn Endpoint>,
    channel: Arc<dyn Channel>,
    mut endpoint_rx: mpsc::UnboundedReceiver<EndpointEvent>,
    mut channel_rx: mpsc::UnboundedReceiver<ChannelEvent>,
    verify_code: Option<String>,
) {
    loop {
        tokio::select! {
            ev = channel_rx.recv() => match ev {
                Some(ChannelEvent::Message { data, extra }) => {
                    let extra = match verify_code.as_deref() {
                        Some(code) => Some(inject_verify_code(extra, code)),
                        None => extra,
                    };
                    if let Err(e) = endpoint.send(Envelope::message(data, extra)).await {
                        warn!(error = %e, "forward to endpoint failed");
                    }
                }
                Some(ChannelEvent::Error(e)) => {
                    warn!(error = %e, "inbound channel error");
                }
                Some(ChannelEvent::Closed) | None => break,
            },
            ev = endpoint_rx.recv() => match ev {
                Some(EndpointEvent::Message(envelope)) => {
                    if let Some(data) = envelope.data {
                        if let Err(e) = channel.send(data).await {
                            warn!(error = %e, "forward to channel failed");
                        }
                    }
                }
                Some(EndpointEvent::Error(e)) => {
                    warn!(error = %e, "outbound endpoint error");
                }
                Some(EndpointEvent::Closed) | None => break,
            },
        }
    }

    // Either side closed: detach both sinks so late deliveries on the
    // torn-down bridge go nowhere, then release the inbound channel.
    endpoint.events().detach();
    channel.events().detach();
    let _ = channel.close().await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{MockChannel, MockEndpoint};
    use mooring_core::envelope::EnvelopeKind;
    use serde_json::json;
    use std::time::Duration;

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    #[tokio::test]
    async fn connect_without_endpoint_fails() {
        let proxy = ProxyServer::new();
        let channel = MockChannel::new();
        let err = proxy.connect(channel as Arc<dyn Channel>).await.unwrap_err();
        assert!(matches!(err, MooringError::NoEndpoint));
    }

    #[tokio::test]
    async fn connect_starts_channel_and_goes_active() {
        let proxy = ProxyServer::new();
        let endpoint = MockEndpoint::new("c1");
        let channel = MockChannel::new();
        proxy.set_endpoint(endpoint as Arc<dyn Endpoint>).await;

        proxy
            .connect(channel.clone() as Arc<dyn Channel>)
            .await
            .unwrap();
        assert!(channel.is_started());
        assert!(proxy.is_active().await);
    }

    #[tokio::test]
    async fn second_connect_fails_and_leaves_first_flow_intact() {
        let proxy = ProxyServer::new();
        let endpoint = MockEndpoint::new("c1");
        let first = MockChannel::new();
        let second = MockChannel::new();
        proxy.set_endpoint(endpoint.clone() as Arc<dyn Endpoint>).await;
        proxy
            .connect(first.clone() as Arc<dyn Channel>)
            .await
            .unwrap();

        let err = proxy
            .connect(second as Arc<dyn Channel>)
            .await
            .unwrap_err();
        assert!(matches!(err, MooringError::AlreadyConnected));

        // First binding still pumps.
        first.push_message(json!({"id": 1, "method": "m"}), None);
        settle().await;
        assert_eq!(endpoint.sent().len(), 1);
    }

    #[tokio::test]
    async fn verify_code_decorates_forward_direction_only() {
        let proxy = ProxyServer::new();
        let endpoint = MockEndpoint::new("c1");
        let channel = MockChannel::new();
        proxy.set_endpoint(endpoint.clone() as Arc<dyn Endpoint>).await;
        proxy.set_verify_code("abc123").await;
        proxy
            .connect(channel.clone() as Arc<dyn Channel>)
            .await
            .unwrap();

        channel.push_message(json!({"id": 1, "method": "doTask"}), None);
        settle().await;

        let sent = endpoint.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].kind, EnvelopeKind::Message);
        let extra = sent[0].extra.as_ref().unwrap();
        assert_eq!(extra["authInfo"]["extra"]["verifyCode"], "abc123");

        // Reverse direction: bare data, no decoration.
        endpoint.push(Envelope::message(json!({"id": 1, "result": "ok"}), None));
        settle().await;
        let delivered = channel.sent();
        assert_eq!(delivered, vec![json!({"id": 1, "result": "ok"})]);
    }

    #[tokio::test]
    async fn verify_code_merges_into_existing_extra() {
        let proxy = ProxyServer::new();
        let endpoint = MockEndpoint::new("c1");
        let channel = MockChannel::new();
        proxy.set_endpoint(endpoint.clone() as Arc<dyn Endpoint>).await;
        proxy.set_verify_code("tok").await;
        proxy
            .connect(channel.clone() as Arc<dyn Channel>)
            .await
            .unwrap();

        channel.push_message(json!({"id": 2}), Some(json!({"progressToken": "p"})));
        settle().await;

        let sent = endpoint.sent();
        let extra = sent[0].extra.as_ref().unwrap();
        assert_eq!(extra["progressToken"], "p");
        assert_eq!(extra["authInfo"]["extra"]["verifyCode"], "tok");
    }

    #[tokio::test]
    async fn without_verify_code_extra_passes_through() {
        let proxy = ProxyServer::new();
        let endpoint = MockEndpoint::new("c1");
        let channel = MockChannel::new();
        proxy.set_endpoint(endpoint.clone() as Arc<dyn Endpoint>).await;
        proxy
            .connect(channel.clone() as Arc<dyn Channel>)
            .await
            .unwrap();

        channel.push_message(json!({"id": 3}), None);
        settle().await;
        assert_eq!(endpoint.sent()[0].extra, None);
    }

    #[tokio::test]
    async fn channel_error_is_logged_not_fatal() {
        let proxy = ProxyServer::new();
        let endpoint = MockEndpoint::new("c1");
        let channel = MockChannel::new();
        proxy.set_endpoint(endpoint.clone() as Arc<dyn Endpoint>).await;
        proxy
            .connect(channel.clone() as Arc<dyn Channel>)
            .await
            .unwrap();

        channel.events().emit(ChannelEvent::Error(MooringError::Transport(
            "hiccup".to_string(),
        )));
        channel.push_message(json!({"id": 1}), None);
        settle().await;

        // The bridge keeps pumping after a channel error.
        assert_eq!(endpoint.sent().len(), 1);
        assert!(proxy.is_active().await);
    }

    #[tokio::test]
    async fn channel_close_tears_the_bridge_down() {
        let proxy = ProxyServer::new();
        let endpoint = MockEndpoint::new("c1");
        let channel = MockChannel::new();
        proxy.set_endpoint(endpoint.clone() as Arc<dyn Endpoint>).await;
        proxy
            .connect(channel.clone() as Arc<dyn Channel>)
            .await
            .unwrap();

        channel.push_closed();
        settle().await;

        // Endpoint sink was detached: late traffic goes nowhere.
        assert!(!endpoint.events().is_attached());
        assert!(channel.is_closed());
    }

    #[tokio::test]
    async fn endpoint_close_propagates_to_channel() {
        let proxy = ProxyServer::new();
        let endpoint = MockEndpoint::new("c1");
        let channel = MockChannel::new();
        proxy.set_endpoint(endpoint.clone() as Arc<dyn Endpoint>).await;
        proxy
            .connect(channel.clone() as Arc<dyn Channel>)
            .await
            .unwrap();

        endpoint.push_closed();
        settle().await;
        assert!(channel.is_closed());
    }

    #[tokio::test]
    async fn post_close_silence() {
        let proxy = ProxyServer::new();
        let endpoint = MockEndpoint::new("c1");
        let channel = MockChannel::new();
        proxy.set_endpoint(endpoint.clone() as Arc<dyn Endpoint>).await;
        proxy
            .connect(channel.clone() as Arc<dyn Channel>)
            .await
            .unwrap();

        endpoint.push(Envelope::message(json!({"id": 1, "result": "before"}), None));
        settle().await;
        assert_eq!(channel.sent().len(), 1);

        proxy.close().await.unwrap();

        // A message arriving on the since-detached endpoint must not
        // reach the closed channel.
        endpoint.push(Envelope::message(json!({"id": 2, "result": "late"}), None));
        settle().await;
        assert_eq!(channel.sent().len(), 1);
        assert!(!proxy.is_active().await);
    }

    #[tokio::test]
    async fn close_before_connect_is_fine_and_final() {
        let proxy = ProxyServer::new();
        let endpoint = MockEndpoint::new("c1");
        proxy.set_endpoint(endpoint as Arc<dyn Endpoint>).await;
        proxy.close().await.unwrap();

        let channel = MockChannel::new();
        let err = proxy.connect(channel as Arc<dyn Channel>).await.unwrap_err();
        assert!(matches!(err, MooringError::AlreadyConnected));
    }
}
