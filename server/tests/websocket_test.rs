//! WebSocket Gateway Tests
//!
//! Runs the router on a real socket and talks to `/ws` with a
//! tokio-tungstenite client.
//!
//! Run with: `cargo test --test websocket_test`

mod helpers;

use std::time::Duration;

use futures::{SinkExt, StreamExt};
use helpers::{generate_access_token, spawn_test_server, TestApp};
use sb_server::events::DomainEvent;
use serde_json::{json, Value};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use uuid::Uuid;

type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

async fn connect(url: &str, token: &str) -> Client {
    let (client, _) = connect_async(format!("{url}?token={token}"))
        .await
        .expect("WebSocket handshake failed");
    client
}

/// Next text frame as JSON, skipping pings.
async fn next_json(client: &mut Client) -> Value {
    loop {
        let message = tokio::time::timeout(Duration::from_secs(2), client.next())
            .await
            .expect("timed out waiting for frame")
            .expect("stream ended")
            .expect("transport error");
        if let Message::Text(text) = message {
            return serde_json::from_str(text.as_str()).expect("frame is not JSON");
        }
    }
}

async fn send(client: &mut Client, frame: Value) {
    client
        .send(Message::Text(frame.to_string().into()))
        .await
        .expect("send failed");
}

#[tokio::test]
async fn subscribe_and_receive_events() {
    let app = TestApp::new();
    let server = spawn_test_server(app.router.clone()).await;
    let (user, tenant) = (Uuid::new_v4(), Uuid::new_v4());
    let token = generate_access_token(&app.config, user, tenant);

    let mut client = connect(&server.ws_url, &token).await;
    let ready = next_json(&mut client).await;
    assert_eq!(ready["type"], "ready");
    assert_eq!(ready["tenant_id"], tenant.to_string());

    let channel = format!("tenant:{tenant}:events");
    send(&mut client, json!({"type": "subscribe", "channel": channel})).await;
    let ack = next_json(&mut client).await;
    assert_eq!(ack["type"], "subscribed");
    assert_eq!(ack["channel"], channel);

    assert!(
        app.state
            .bus
            .publish(DomainEvent::new("call.started", tenant, json!({"call_id": "c1"})))
            .await
    );
    let event = next_json(&mut client).await;
    assert_eq!(event["type"], "event");
    assert_eq!(event["channel"], channel);
    assert_eq!(event["event"]["event_name"], "call.started");
    assert_eq!(event["event"]["data"]["call_id"], "c1");

    send(&mut client, json!({"type": "ping"})).await;
    assert_eq!(next_json(&mut client).await["type"], "pong");
}

#[tokio::test]
async fn cross_tenant_subscription_is_rejected() {
    let app = TestApp::new();
    let server = spawn_test_server(app.router.clone()).await;
    let tenant = Uuid::new_v4();
    let other_tenant = Uuid::new_v4();
    let token = generate_access_token(&app.config, Uuid::new_v4(), tenant);

    let mut client = connect(&server.ws_url, &token).await;
    assert_eq!(next_json(&mut client).await["type"], "ready");

    let foreign = format!("tenant:{other_tenant}:events");
    send(&mut client, json!({"type": "subscribe", "channel": foreign})).await;
    let reply = next_json(&mut client).await;
    assert_eq!(reply["type"], "error");
    assert_eq!(reply["code"], "forbidden");

    // Nothing published to the other tenant leaks through
    app.state
        .bus
        .publish(DomainEvent::new("call.started", other_tenant, json!({})))
        .await;
    send(&mut client, json!({"type": "ping"})).await;
    assert_eq!(next_json(&mut client).await["type"], "pong");
}

#[tokio::test]
async fn lead_subscription_requires_access() {
    let app = TestApp::new();
    let server = spawn_test_server(app.router.clone()).await;
    let tenant = Uuid::new_v4();
    let (granted, denied) = (Uuid::new_v4(), Uuid::new_v4());
    app.directory.grant_lead(granted, tenant);
    app.directory.grant_lead(denied, Uuid::new_v4());
    let token = generate_access_token(&app.config, Uuid::new_v4(), tenant);

    let mut client = connect(&server.ws_url, &token).await;
    next_json(&mut client).await;

    send(&mut client, json!({"type": "subscribe", "channel": format!("lead:{granted}:timeline")})).await;
    assert_eq!(next_json(&mut client).await["type"], "subscribed");

    send(&mut client, json!({"type": "subscribe", "channel": format!("lead:{denied}:timeline")})).await;
    assert_eq!(next_json(&mut client).await["code"], "forbidden");
}

#[tokio::test]
async fn malformed_channel_is_rejected() {
    let app = TestApp::new();
    let server = spawn_test_server(app.router.clone()).await;
    let tenant = Uuid::new_v4();
    let token = generate_access_token(&app.config, Uuid::new_v4(), tenant);

    let mut client = connect(&server.ws_url, &token).await;
    next_json(&mut client).await;

    send(&mut client, json!({"type": "subscribe", "channel": format!("tenant:{tenant}:*")})).await;
    assert_eq!(next_json(&mut client).await["code"], "invalid_channel");
}

#[tokio::test]
async fn bad_token_closes_with_policy_violation() {
    let app = TestApp::new();
    let server = spawn_test_server(app.router.clone()).await;

    let mut client = connect(&server.ws_url, "not-a-jwt").await;
    let message = tokio::time::timeout(Duration::from_secs(2), client.next())
        .await
        .expect("timed out waiting for close")
        .expect("stream ended")
        .expect("transport error");

    match message {
        Message::Close(Some(frame)) => assert_eq!(u16::from(frame.code), 1008),
        other => panic!("expected close frame, got {other:?}"),
    }
}

#[tokio::test]
async fn shutdown_closes_connections_with_going_away() {
    let app = TestApp::new();
    let server = spawn_test_server(app.router.clone()).await;
    let token = generate_access_token(&app.config, Uuid::new_v4(), Uuid::new_v4());

    let mut client = connect(&server.ws_url, &token).await;
    next_json(&mut client).await;
    assert_eq!(app.state.hub.connection_count(), 1);

    app.state.hub.close_all(sb_server::hub::CloseReason::Shutdown);

    let close = loop {
        let message = tokio::time::timeout(Duration::from_secs(2), client.next())
            .await
            .expect("timed out waiting for close")
            .expect("stream ended")
            .expect("transport error");
        if let Message::Close(frame) = message {
            break frame;
        }
    };
    assert_eq!(close.map(|f| u16::from(f.code)), Some(1001));
    assert_eq!(app.state.hub.connection_count(), 0);
}
