//! Transport session tests against a local socket.io-speaking websocket server.

use std::time::Duration;

use crossbeam_channel::Receiver;
use fluxlite_core::transport::socketio::{self, Packet};
use fluxlite_core::transport::{
    BackoffConfig, Command, ConnectionConfig, ConnectionState, Envelope, EventSink, InboundEvent,
    TransportSession,
};
use futures::{SinkExt, StreamExt};
use serde_json::json;
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;

const WAIT: Duration = Duration::from_secs(5);
const OPEN: &str = r#"0{"sid":"s1","upgrades":[],"pingInterval":25000,"pingTimeout":20000}"#;

type ServerWs = WebSocketStream<TcpStream>;

fn config(port: u16) -> ConnectionConfig {
    ConnectionConfig {
        host: "http://127.0.0.1".to_string(),
        port,
        backoff: BackoffConfig {
            initial_ms: 20,
            max_ms: 100,
            multiplier: 2.0,
            jitter: 0.0,
        },
    }
}

/// Poll the inbound channel without blocking the runtime.
async fn next_matching<F>(rx: &Receiver<InboundEvent>, mut pred: F) -> InboundEvent
where
    F: FnMut(&InboundEvent) -> bool,
{
    let deadline = tokio::time::Instant::now() + WAIT;
    loop {
        while let Ok(event) = rx.try_recv() {
            if pred(&event) {
                return event;
            }
        }
        assert!(tokio::time::Instant::now() < deadline, "timed out waiting for event");
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

async fn wait_for_state(rx: &Receiver<InboundEvent>, state: ConnectionState) {
    next_matching(rx, |e| matches!(e, InboundEvent::Connection(s) if *s == state)).await;
}

async fn accept_ws(listener: &TcpListener) -> ServerWs {
    let stream = tokio::time::timeout(WAIT, listener.accept())
        .await
        .expect("no connection")
        .expect("accept failed")
        .0;
    tokio_tungstenite::accept_async(stream)
        .await
        .expect("websocket upgrade failed")
}

async fn send(ws: &mut ServerWs, text: &str) {
    ws.send(Message::text(text.to_string())).await.unwrap();
}

async fn next_text(ws: &mut ServerWs) -> String {
    loop {
        let message = tokio::time::timeout(WAIT, ws.next())
            .await
            .expect("timed out waiting for client")
            .expect("client closed the stream")
            .expect("read failed");
        if let Message::Text(text) = message {
            return text.as_str().to_string();
        }
    }
}

/// Accept a client and complete the Engine.IO open and namespace join.
async fn accept_session(listener: &TcpListener, open: &str) -> ServerWs {
    let mut ws = accept_ws(listener).await;
    send(&mut ws, open).await;
    assert_eq!(next_text(&mut ws).await, socketio::CONNECT_PACKET);
    send(&mut ws, r#"40{"sid":"n1"}"#).await;
    ws
}

/// Next event the client emitted, skipping heartbeat replies.
async fn next_client_event(ws: &mut ServerWs) -> Envelope {
    loop {
        match socketio::decode(&next_text(ws).await).unwrap() {
            Packet::Event(envelope) => return envelope,
            Packet::Pong => {}
            other => panic!("unexpected client packet {other:?}"),
        }
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_events_in_and_commands_out() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let (tx, rx) = crossbeam_channel::bounded(100);

    let session = TransportSession::connect(&config(port), tx);
    assert_eq!(session.address(), format!("127.0.0.1:{port}"));

    let mut server = accept_session(&listener, OPEN).await;
    wait_for_state(&rx, ConnectionState::Connected).await;
    assert_eq!(session.state(), ConnectionState::Connected);

    send(&mut server, r#"42["jsonData",{"deviceId":"g.Launch Zone","recordId":9}]"#).await;
    send(&mut server, r#"42["somethingNew",{}]"#).await;
    send(&mut server, "not a packet").await;
    send(&mut server, "2").await;
    send(&mut server, r#"42["battery",{"level":80}]"#).await;

    match next_matching(&rx, |e| matches!(e, InboundEvent::Frame(_))).await {
        InboundEvent::Frame(frame) => assert_eq!(frame.record_id, 9),
        other => panic!("unexpected {other:?}"),
    }
    // unknown and undecodable packets are dropped without closing the link
    next_matching(&rx, |e| matches!(e, InboundEvent::Battery(_))).await;
    // the server ping is answered
    assert_eq!(next_text(&mut server).await, socketio::PONG_PACKET);

    session.emit(Command::GetGroups);
    session.emit(Command::SetSamplingRate(1000));

    let first = next_client_event(&mut server).await;
    assert_eq!(first, Envelope::new("getGroups", serde_json::Value::Null));
    let second = next_client_event(&mut server).await;
    assert_eq!(second, Envelope::new("setSamplingRate", json!(1000)));

    session.shutdown().await;
    assert_eq!(next_text(&mut server).await, socketio::DISCONNECT_PACKET);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_connected_only_after_namespace_join() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let (tx, rx) = crossbeam_channel::bounded(100);
    let session = TransportSession::connect(&config(port), tx);

    let mut ws = accept_ws(&listener).await;
    send(&mut ws, OPEN).await;
    assert_eq!(next_text(&mut ws).await, socketio::CONNECT_PACKET);
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(session.state(), ConnectionState::Connecting);

    send(&mut ws, r#"44{"message":"not allowed"}"#).await;
    wait_for_state(&rx, ConnectionState::Disconnected).await;
    assert!(!rx
        .try_iter()
        .any(|e| e == InboundEvent::Connection(ConnectionState::Connected)));

    // the next attempt is accepted
    let _server = accept_session(&listener, OPEN).await;
    wait_for_state(&rx, ConnectionState::Connected).await;
    session.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_reconnects_after_drop() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let (tx, rx) = crossbeam_channel::bounded(100);
    let session = TransportSession::connect(&config(port), tx);

    let server = accept_session(&listener, OPEN).await;
    wait_for_state(&rx, ConnectionState::Connected).await;

    drop(server);
    wait_for_state(&rx, ConnectionState::Disconnected).await;

    let _again = accept_session(&listener, OPEN).await;
    wait_for_state(&rx, ConnectionState::Connected).await;

    session.shutdown().await;
    assert_eq!(session.state(), ConnectionState::Disconnected);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_silent_backend_is_dropped_after_heartbeat_timeout() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let (tx, rx) = crossbeam_channel::bounded(100);
    let session = TransportSession::connect(&config(port), tx);

    let quick = r#"0{"sid":"s2","upgrades":[],"pingInterval":50,"pingTimeout":50}"#;
    let _server = accept_session(&listener, quick).await;
    wait_for_state(&rx, ConnectionState::Connected).await;

    // no pings are sent, so the client gives up on the link
    wait_for_state(&rx, ConnectionState::Disconnected).await;
    let _again = accept_session(&listener, OPEN).await;
    wait_for_state(&rx, ConnectionState::Connected).await;
    session.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_unreachable_backend_is_transient_and_cancellable() {
    // bind then release a port so nothing is listening on it
    let port = {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap().port()
    };
    let (tx, rx) = crossbeam_channel::bounded(100);
    let session = TransportSession::connect(&config(port), tx);

    // several failed attempts cycle through Connecting and Disconnected
    for _ in 0..2 {
        wait_for_state(&rx, ConnectionState::Connecting).await;
        wait_for_state(&rx, ConnectionState::Disconnected).await;
    }

    session.disconnect();
    session.disconnect();
    tokio::time::timeout(WAIT, session.shutdown())
        .await
        .expect("reconnect loop did not stop");
    assert_eq!(session.state(), ConnectionState::Disconnected);
}
