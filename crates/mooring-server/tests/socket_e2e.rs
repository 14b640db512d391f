//! End-to-end tests over a real WebSocket connection: handshake,
//! session multiplexing, registry cleanup, and the full proxied flow.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::time::{sleep, timeout};

use mooring_client::{ConnectConfig, SocketClientEndpoint};
use mooring_core::adapter::EndpointChannel;
use mooring_core::endpoint::{Channel, ChannelEvent, Endpoint, EndpointEvent};
use mooring_core::envelope::Envelope;
use mooring_server::center::ConnectorCenter;
use mooring_server::proxy::ProxyServer;
use mooring_server::socket::{self, SessionMode};
use mooring_server::testing::MockChannel;

const WAIT: Duration = Duration::from_secs(5);

async fn start_server(mode: SessionMode) -> (String, Arc<ConnectorCenter>) {
    let center = Arc::new(ConnectorCenter::new());
    let addr: SocketAddr = "127.0.0.1:0".parse().expect("loopback addr");
    let (bound, _task) = socket::start_listener_with_mode(addr, center.clone(), mode)
        .await
        .expect("listener starts");
    (format!("ws://{bound}"), center)
}

async fn moor(url: &str) -> Arc<SocketClientEndpoint> {
    let client = Arc::new(SocketClientEndpoint::new(ConnectConfig {
        url: url.to_string(),
        handshake_timeout_secs: 5,
    }));
    client.start().await.expect("handshake");
    client
}

async fn recv_message(rx: &mut UnboundedReceiver<EndpointEvent>) -> Envelope {
    match timeout(WAIT, rx.recv()).await.expect("event in time") {
        Some(EndpointEvent::Message(envelope)) => envelope,
        other => panic!("expected message, got {other:?}"),
    }
}

async fn wait_until<F: Fn() -> bool>(cond: F) {
    for _ in 0..100 {
        if cond() {
            return;
        }
        sleep(Duration::from_millis(20)).await;
    }
    panic!("condition not reached in time");
}

#[tokio::test]
async fn handshake_assigns_identity_and_registers() {
    let (url, center) = start_server(SessionMode::Shared).await;
    let client = moor(&url).await;

    let client_id = client.client_id().expect("identity after start");
    assert_eq!(client_id.len(), 16);
    assert!(center.contains(&client_id).await);
}

#[tokio::test]
async fn send_waits_for_the_handshake() {
    let (url, _center) = start_server(SessionMode::Shared).await;
    let client = Arc::new(SocketClientEndpoint::new(ConnectConfig {
        url,
        handshake_timeout_secs: 5,
    }));

    // An application send issued before start() must suspend on the
    // identity, not go out first.
    let early = {
        let client = client.clone();
        tokio::spawn(async move {
            client
                .send(Envelope::message(json!({"id": 1, "method": "early"}), None))
                .await
        })
    };
    sleep(Duration::from_millis(100)).await;
    assert!(!early.is_finished());

    client.start().await.expect("handshake");
    timeout(WAIT, early)
        .await
        .expect("send completes after handshake")
        .expect("task")
        .expect("send ok");
}

#[tokio::test]
async fn scoped_request_and_reply_round_trip() {
    let (url, center) = start_server(SessionMode::Shared).await;
    let client = moor(&url).await;
    let mut client_rx = client.events().attach();
    let client_id = client.client_id().expect("identity");

    let endpoint = center
        .get_client(&client_id, Some("s1"))
        .await
        .expect("factory mints scoped endpoint");
    let mut endpoint_rx = endpoint.events().attach();
    endpoint.start().await.expect("scoped endpoint ready");

    endpoint
        .send(Envelope::message(json!({"id": 1, "method": "doTask"}), None))
        .await
        .expect("request out");

    let at_client = recv_message(&mut client_rx).await;
    let data = at_client.data.expect("request data");
    assert_eq!(data["id"], "s1_1");
    assert_eq!(data["method"], "doTask");

    client
        .send(Envelope::message(json!({"id": "s1_1", "result": "ok"}), None))
        .await
        .expect("reply out");

    let at_endpoint = recv_message(&mut endpoint_rx).await;
    let data = at_endpoint.data.expect("reply data");
    assert_eq!(data["id"], 1);
    assert_eq!(data["result"], "ok");
}

#[tokio::test]
async fn sibling_sessions_are_isolated() {
    let (url, center) = start_server(SessionMode::Shared).await;
    let client = moor(&url).await;
    let mut client_rx = client.events().attach();
    let client_id = client.client_id().expect("identity");

    let s1 = center.get_client(&client_id, Some("s1")).await.expect("s1");
    let s2 = center.get_client(&client_id, Some("s2")).await.expect("s2");
    let mut s1_rx = s1.events().attach();
    let mut s2_rx = s2.events().attach();

    s1.send(Envelope::message(json!({"id": 7, "method": "a"}), None))
        .await
        .expect("s1 request");
    s2.send(Envelope::message(json!({"id": 9, "method": "b"}), None))
        .await
        .expect("s2 request");

    let first = recv_message(&mut client_rx).await;
    let second = recv_message(&mut client_rx).await;
    let ids: Vec<String> = [first, second]
        .iter()
        .map(|env| env.data.as_ref().expect("data")["id"]
            .as_str()
            .expect("scoped id")
            .to_string())
        .collect();
    assert!(ids.contains(&"s1_7".to_string()));
    assert!(ids.contains(&"s2_9".to_string()));

    // The reply addressed to s1 must reach s1 only.
    client
        .send(Envelope::message(json!({"id": "s1_7", "result": "ok"}), None))
        .await
        .expect("reply");

    let at_s1 = recv_message(&mut s1_rx).await;
    assert_eq!(at_s1.data.expect("data")["id"], 7);
    sleep(Duration::from_millis(100)).await;
    assert!(s2_rx.try_recv().is_err());

    client
        .send(Envelope::message(json!({"id": "s2_9", "result": "ok"}), None))
        .await
        .expect("reply");
    let at_s2 = recv_message(&mut s2_rx).await;
    assert_eq!(at_s2.data.expect("data")["id"], 9);
}

#[tokio::test]
async fn single_session_mode_passes_ids_through() {
    let (url, center) = start_server(SessionMode::Single).await;
    let client = moor(&url).await;
    let mut client_rx = client.events().attach();
    let client_id = client.client_id().expect("identity");

    let a = center.get_client(&client_id, None).await.expect("endpoint");
    let b = center
        .get_client(&client_id, Some("ignored"))
        .await
        .expect("endpoint");
    assert!(Arc::ptr_eq(&a, &b));

    let mut endpoint_rx = a.events().attach();
    a.send(Envelope::message(json!({"id": 1, "method": "doTask"}), None))
        .await
        .expect("request");

    let at_client = recv_message(&mut client_rx).await;
    assert_eq!(at_client.data.expect("data")["id"], 1);

    client
        .send(Envelope::message(json!({"id": 1, "result": "ok"}), None))
        .await
        .expect("reply");
    let at_endpoint = recv_message(&mut endpoint_rx).await;
    assert_eq!(at_endpoint.data.expect("data")["id"], 1);
}

#[tokio::test]
async fn registry_cleanup_after_client_close() {
    let (url, center) = start_server(SessionMode::Shared).await;
    let client = moor(&url).await;
    let client_id = client.client_id().expect("identity");
    assert!(center.contains(&client_id).await);

    client.close().await.expect("close");

    for _ in 0..100 {
        if !center.contains(&client_id).await {
            return;
        }
        sleep(Duration::from_millis(20)).await;
    }
    panic!("registry entry survived connection close");
}

#[tokio::test]
async fn proxied_session_end_to_end() {
    let (url, center) = start_server(SessionMode::Shared).await;
    let client = moor(&url).await;
    let mut client_rx = client.events().attach();
    let client_id = client.client_id().expect("identity");

    let endpoint = center
        .get_client(&client_id, Some("s1"))
        .await
        .expect("scoped endpoint");
    let proxy = ProxyServer::new();
    proxy.set_endpoint(endpoint).await;
    proxy.set_verify_code("abc123").await;
    let channel = MockChannel::new();
    proxy
        .connect(channel.clone() as Arc<dyn Channel>)
        .await
        .expect("bridge up");
    assert!(channel.is_started());

    // Inbound request: scoped id plus verify code on the way in.
    channel.push_message(json!({"id": 1, "method": "doTask"}), None);
    let at_client = recv_message(&mut client_rx).await;
    let data = at_client.data.expect("data");
    assert_eq!(data["id"], "s1_1");
    assert_eq!(data["method"], "doTask");
    let extra = at_client.extra.expect("extra");
    assert_eq!(extra["authInfo"]["extra"]["verifyCode"], "abc123");

    // Client reply: id restored, undecorated, lands on the channel.
    client
        .send(Envelope::message(json!({"id": "s1_1", "result": "ok"}), None))
        .await
        .expect("reply");
    wait_until(|| channel.sent().len() == 1).await;
    assert_eq!(channel.sent(), vec![json!({"id": 1, "result": "ok"})]);

    // After the bridge closes, late replies go nowhere.
    proxy.close().await.expect("close");
    client
        .send(Envelope::message(json!({"id": "s1_1", "result": "late"}), None))
        .await
        .expect("late reply");
    sleep(Duration::from_millis(150)).await;
    assert_eq!(channel.sent().len(), 1);
}

#[tokio::test]
async fn adapter_exposes_scoped_endpoint_as_plain_channel() {
    let (url, center) = start_server(SessionMode::Shared).await;
    let client = moor(&url).await;
    let mut client_rx = client.events().attach();
    let client_id = client.client_id().expect("identity");

    let endpoint = center
        .get_client(&client_id, Some("s1"))
        .await
        .expect("scoped endpoint");
    let adapter = EndpointChannel::new(move || endpoint);
    let mut adapter_rx = adapter.events().attach();
    adapter.start().await.expect("adapter starts");

    // Plain value out, scoped envelope on the wire.
    adapter
        .send(json!({"id": 3, "method": "doTask"}))
        .await
        .expect("request");
    let at_client = recv_message(&mut client_rx).await;
    assert_eq!(at_client.data.expect("data")["id"], "s1_3");

    // Envelope back, plain value delivered.
    client
        .send(Envelope::message(
            json!({"id": "s1_3", "result": "ok"}),
            Some(json!({"progressToken": "p"})),
        ))
        .await
        .expect("reply");
    match timeout(WAIT, adapter_rx.recv()).await.expect("reply in time") {
        Some(ChannelEvent::Message { data, extra }) => {
            assert_eq!(data, json!({"id": 3, "result": "ok"}));
            assert_eq!(extra, Some(json!({"progressToken": "p"})));
        }
        other => panic!("expected message, got {other:?}"),
    }
}

#[tokio::test]
async fn factory_rejects_session_id_with_delimiter() {
    let (url, center) = start_server(SessionMode::Shared).await;
    let client = moor(&url).await;
    let client_id = client.client_id().expect("identity");

    assert!(center.get_client(&client_id, Some("s_1")).await.is_none());
    assert!(center.get_client(&client_id, Some("s1")).await.is_some());
}
