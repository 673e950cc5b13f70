//! HTTP endpoint tests against a bridge wired to the simulated balance.

use std::sync::Arc;
use std::time::Duration;

use bridge_core::{BridgeConfig, ConnectivityState};
use bridge_driver_mtsics::{Bridge, SimConnector, SimulatedBalance};
use bridge_server::{
    start_http_server, HttpServerHandle, ReadingPublisher, ServerState, StreamEvent,
};
use hyper::body::HttpBody;
use hyper::{Body, Client, Method, Request, StatusCode};

struct Harness {
    balance: SimulatedBalance,
    bridge: Arc<Bridge>,
    publisher: ReadingPublisher,
    server: HttpServerHandle,
}

impl Harness {
    fn url(&self, path: &str) -> String {
        format!("http://{}{}", self.server.local_addr(), path)
    }

    async fn stop(self) {
        self.server.shutdown().await;
        self.bridge.shutdown().await;
    }
}

fn config(host: Option<&str>) -> BridgeConfig {
    let mut config = BridgeConfig::default();
    config.instrument.host = host.map(str::to_string);
    config.instrument.command_timeout = Duration::from_millis(200);
    config.stream.poll_interval = Duration::from_millis(20);
    config.server.bind = ([127, 0, 0, 1], 0).into();
    config
}

async fn harness(host: Option<&str>) -> Harness {
    let config = config(host);
    let balance = SimulatedBalance::new();
    let connector = SimConnector::new(balance.clone());
    let bridge = Arc::new(Bridge::start_with_connector(&config, Arc::new(connector)));
    if !bridge.is_disabled() {
        let state = bridge.wait_for_connection(Duration::from_secs(2)).await;
        assert_eq!(state, ConnectivityState::Connected);
    }

    let state = ServerState::new(Arc::clone(&bridge), &config.stream);
    let publisher = state.publisher().clone();
    let server = start_http_server(config.server.bind, state).await.unwrap();
    Harness {
        balance,
        bridge,
        publisher,
        server,
    }
}

async fn body_json(body: Body) -> serde_json::Value {
    let bytes = hyper::body::to_bytes(body).await.unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

/// Reads NDJSON events from a streaming body.
struct EventReader {
    body: Body,
    buffer: String,
}

impl EventReader {
    fn new(body: Body) -> Self {
        Self {
            body,
            buffer: String::new(),
        }
    }

    async fn next(&mut self) -> StreamEvent {
        loop {
            if let Some(pos) = self.buffer.find('\n') {
                let line: String = self.buffer.drain(..=pos).collect();
                return StreamEvent::from_ndjson(&line).unwrap();
            }
            let chunk = tokio::time::timeout(Duration::from_secs(2), self.body.data())
                .await
                .expect("event within deadline")
                .expect("stream still open")
                .unwrap();
            self.buffer.push_str(std::str::from_utf8(&chunk).unwrap());
        }
    }
}

#[tokio::test]
async fn disabled_bridge_answers_not_configured() {
    let h = harness(None).await;
    let client = Client::new();

    let res = client
        .get(h.url("/weight/stream").parse().unwrap())
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(
        body_json(res.into_body()).await,
        serde_json::json!({ "error": "not configured" })
    );

    let res = client.get(h.url("/status").parse().unwrap()).await.unwrap();
    assert_eq!(
        body_json(res.into_body()).await,
        serde_json::json!({ "state": "disabled" })
    );

    let res = client.get(h.url("/weight").parse().unwrap()).await.unwrap();
    assert_eq!(res.status(), StatusCode::SERVICE_UNAVAILABLE);

    h.stop().await;
}

#[tokio::test]
async fn status_reports_connected() {
    let h = harness(Some("balance.lab")).await;
    let res = Client::new()
        .get(h.url("/status").parse().unwrap())
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    assert_eq!(
        body_json(res.into_body()).await,
        serde_json::json!({ "state": "connected" })
    );
    h.stop().await;
}

#[tokio::test]
async fn stream_delivers_weight_and_error_events() {
    let h = harness(Some("balance.lab")).await;
    h.balance.set_weight(123.45, true);

    let res = Client::new()
        .get(h.url("/weight/stream").parse().unwrap())
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    assert_eq!(
        res.headers().get("content-type").unwrap(),
        "application/x-ndjson"
    );

    let mut events = EventReader::new(res.into_body());
    assert_eq!(
        events.next().await,
        StreamEvent::Weight {
            value: 123.45,
            unit: "g".to_string(),
            stable: true
        }
    );

    h.balance.inject_fault(Some("+"));
    let mut saw_error = false;
    for _ in 0..10 {
        if let StreamEvent::Error { message } = events.next().await {
            assert!(message.contains("overload"));
            saw_error = true;
            break;
        }
    }
    assert!(saw_error);

    h.balance.inject_fault(None);
    let mut recovered = false;
    for _ in 0..10 {
        if matches!(events.next().await, StreamEvent::Weight { .. }) {
            recovered = true;
            break;
        }
    }
    assert!(recovered);

    drop(events);
    h.stop().await;
}

#[tokio::test]
async fn closing_one_stream_keeps_the_other() {
    let h = harness(Some("balance.lab")).await;
    h.balance.set_weight(1.0, true);
    let client = Client::new();

    let first = client
        .get(h.url("/weight/stream").parse().unwrap())
        .await
        .unwrap();
    let second = client
        .get(h.url("/weight/stream").parse().unwrap())
        .await
        .unwrap();
    let mut first = EventReader::new(first.into_body());
    let mut second = EventReader::new(second.into_body());
    first.next().await;
    second.next().await;
    assert_eq!(h.publisher.subscriber_count(), 2);

    drop(first);
    let mut detached = false;
    for _ in 0..100 {
        if h.publisher.subscriber_count() == 1 {
            detached = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert!(detached);

    for _ in 0..3 {
        assert!(matches!(second.next().await, StreamEvent::Weight { .. }));
    }
    assert_eq!(h.bridge.state(), ConnectivityState::Connected);

    drop(second);
    h.stop().await;
}

#[tokio::test]
async fn tare_zero_and_single_read() {
    let h = harness(Some("balance.lab")).await;
    h.balance.set_weight(80.0, true);
    let client = Client::new();

    let tare = Request::builder()
        .method(Method::POST)
        .uri(h.url("/tare"))
        .body(Body::empty())
        .unwrap();
    let res = client.request(tare).await.unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    assert_eq!(body_json(res.into_body()).await["value"], 80.0);

    let res = client.get(h.url("/weight").parse().unwrap()).await.unwrap();
    assert_eq!(body_json(res.into_body()).await["value"], 0.0);

    let zero = Request::builder()
        .method(Method::POST)
        .uri(h.url("/zero"))
        .body(Body::empty())
        .unwrap();
    let res = client.request(zero).await.unwrap();
    assert_eq!(
        body_json(res.into_body()).await,
        serde_json::json!({ "ok": true })
    );

    h.balance.inject_fault(Some("ES"));
    let res = client.get(h.url("/weight").parse().unwrap()).await.unwrap();
    assert_eq!(res.status(), StatusCode::BAD_GATEWAY);

    h.stop().await;
}

#[tokio::test]
async fn unknown_routes() {
    let h = harness(None).await;
    let client = Client::new();

    let res = client.get(h.url("/nope").parse().unwrap()).await.unwrap();
    assert_eq!(res.status(), StatusCode::NOT_FOUND);

    let res = client.get(h.url("/zero").parse().unwrap()).await.unwrap();
    assert_eq!(res.status(), StatusCode::METHOD_NOT_ALLOWED);

    let res = client.get(h.url("/health").parse().unwrap()).await.unwrap();
    assert_eq!(res.status(), StatusCode::OK);

    h.stop().await;
}
