//! End-to-end tests over real sockets bound to ephemeral ports.

use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;

use hv_rack::config::{CoordinatorConfig, SimulatedConfig};
use hv_rack::hardware::SimulatedBackend;
use hv_rack::transport::envelope::{Envelope, EnvelopeCodec, META_TYPE_JSON};
use hv_rack::transport::{TcpServer, WsServer};
use hv_rack::{Coordinator, TelemetryHub};

const WAIT: Duration = Duration::from_secs(10);

/// Fast simulator so real-time tests finish quickly.
fn fast_coordinator() -> Coordinator {
    let backend = Arc::new(SimulatedBackend::new(SimulatedConfig {
        ramp_rate: 1000.0,
        tick_ms: 10,
        jitter: 0.0,
        setpoint_ack_ms: 20,
        read_interval_ms: 25,
        seed: Some(1),
        initial_voltage: 0.0,
    }));
    let config = CoordinatorConfig {
        convergence_poll_ms: 20,
        telemetry_error_backoff_ms: 50,
    };
    Coordinator::new(
        config,
        backend,
        TelemetryHub::new(1024),
        None,
    )
}

async fn start_tcp(coordinator: &Coordinator, cancel: &CancellationToken) -> (String, JoinHandle<()>) {
    let server = TcpServer::bind("127.0.0.1:0", coordinator.handle())
        .await
        .unwrap();
    let addr = server.local_addr().unwrap().to_string();
    (addr, tokio::spawn(server.run(cancel.child_token())))
}

async fn start_ws(coordinator: &Coordinator, cancel: &CancellationToken) -> (String, JoinHandle<()>) {
    let server = WsServer::bind("127.0.0.1:0", coordinator.handle())
        .await
        .unwrap();
    let addr = server.local_addr().unwrap().to_string();
    (addr, tokio::spawn(server.run(cancel.child_token())))
}

/// Reads envelopes until one carries a non-telemetry meta.
async fn next_tcp_reply(framed: &mut Framed<TcpStream, EnvelopeCodec>) -> Value {
    tokio::time::timeout(WAIT, async {
        loop {
            let envelope = framed.next().await.expect("connection closed").unwrap();
            assert_eq!(envelope.meta_type, META_TYPE_JSON);
            let meta = envelope.meta_json().unwrap();
            if meta["answer_type"] != "get_voltage" {
                return meta;
            }
        }
    })
    .await
    .expect("no reply in time")
}

async fn next_ws_reply<S>(ws: &mut S) -> Value
where
    S: futures::Stream<Item = Result<Message, tokio_tungstenite::tungstenite::Error>> + Unpin,
{
    tokio::time::timeout(WAIT, async {
        loop {
            match ws.next().await.expect("connection closed").unwrap() {
                Message::Text(text) => {
                    let meta: Value = serde_json::from_str(&text).unwrap();
                    if meta["answer_type"] != "get_voltage" {
                        return meta;
                    }
                }
                Message::Ping(_) | Message::Pong(_) => {}
                other => panic!("unexpected frame {other:?}"),
            }
        }
    })
    .await
    .expect("no reply in time")
}

#[tokio::test]
async fn test_tcp_envelope_command_round_trip() {
    let coordinator = fast_coordinator();
    coordinator.start().await.unwrap();
    let cancel = CancellationToken::new();
    let (addr, server) = start_tcp(&coordinator, &cancel).await;

    let stream = TcpStream::connect(&addr).await.unwrap();
    let mut framed = Framed::new(stream, EnvelopeCodec);

    framed
        .send(Envelope::with_meta(
            &json!({"command_type": "set_voltage_and_check", "voltage": 300, "max_error": 1, "timeout": 5}),
        ))
        .await
        .unwrap();
    let reply = next_tcp_reply(&mut framed).await;
    assert_eq!(reply["type"], "answer");
    assert_eq!(reply["answer_type"], "set_voltage_and_check");
    assert_eq!(reply["status"], "ok");
    assert_eq!(reply["block"], 1);

    // Telemetry reaches the connection too.
    let telemetry = tokio::time::timeout(WAIT, async {
        loop {
            let meta = framed.next().await.unwrap().unwrap().meta_json().unwrap();
            if meta["answer_type"] == "get_voltage" {
                return meta;
            }
        }
    })
    .await
    .unwrap();
    assert!(telemetry["voltage"].is_f64());

    cancel.cancel();
    server.await.unwrap();
    coordinator.stop().await;
}

#[tokio::test]
async fn test_tcp_rejections_go_to_the_sender_only() {
    let coordinator = fast_coordinator();
    coordinator.start().await.unwrap();
    let cancel = CancellationToken::new();
    let (addr, server) = start_tcp(&coordinator, &cancel).await;

    let mut sender = Framed::new(TcpStream::connect(&addr).await.unwrap(), EnvelopeCodec);
    let mut other = Framed::new(TcpStream::connect(&addr).await.unwrap(), EnvelopeCodec);

    // Meta that is not JSON still frames correctly and gets a targeted reply.
    let mut garbage = Envelope::with_meta(&json!({}));
    garbage.meta = Bytes::from_static(b"{not json");
    sender.send(garbage).await.unwrap();
    let reply = next_tcp_reply(&mut sender).await;
    assert_eq!(reply["type"], "reply");
    assert_eq!(reply["error_code"], 9);
    assert_eq!(reply["error_text_code"], "INCORRECT_MESSAGE_PARAMS");

    sender
        .send(Envelope::with_meta(&json!({"voltage": 10})))
        .await
        .unwrap();
    let reply = next_tcp_reply(&mut sender).await;
    assert_eq!(reply["error_code"], 9);
    assert!(reply["description"]
        .as_str()
        .unwrap()
        .contains("command_type"));

    // The connection survives rejections.
    sender
        .send(Envelope::with_meta(&json!({"command_type": "set_voltage", "voltage": 10})))
        .await
        .unwrap();
    let reply = next_tcp_reply(&mut sender).await;
    assert_eq!(reply["answer_type"], "set_voltage");

    // The other client saw the broadcast answer, not the rejections.
    let reply = next_tcp_reply(&mut other).await;
    assert_eq!(reply["answer_type"], "set_voltage");

    cancel.cancel();
    server.await.unwrap();
    coordinator.stop().await;
}

#[tokio::test]
async fn test_tcp_bad_framing_closes_the_connection() {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    let coordinator = fast_coordinator();
    coordinator.start().await.unwrap();
    let cancel = CancellationToken::new();
    let (addr, server) = start_tcp(&coordinator, &cancel).await;

    let mut stream = TcpStream::connect(&addr).await.unwrap();
    stream.write_all(&[b'X'; 64]).await.unwrap();

    let closed = tokio::time::timeout(WAIT, async {
        let mut buf = vec![0_u8; 4096];
        loop {
            match stream.read(&mut buf).await {
                Ok(0) | Err(_) => return,
                Ok(_) => {}
            }
        }
    })
    .await;
    assert!(closed.is_ok(), "server kept a corrupted stream open");

    cancel.cancel();
    server.await.unwrap();
    coordinator.stop().await;
}

#[tokio::test]
async fn test_websocket_text_command_round_trip() {
    let coordinator = fast_coordinator();
    coordinator.start().await.unwrap();
    let cancel = CancellationToken::new();
    let (addr, server) = start_ws(&coordinator, &cancel).await;

    let (mut ws, _) = tokio_tungstenite::connect_async(format!("ws://{addr}"))
        .await
        .unwrap();

    ws.send(Message::text(
        json!({"command_type": "set_voltage", "voltage": "120.5"}).to_string(),
    ))
    .await
    .unwrap();
    let reply = next_ws_reply(&mut ws).await;
    assert_eq!(reply["answer_type"], "set_voltage");
    assert_eq!(reply["status"], "ok");
    assert_eq!(coordinator.voltage().target, 120.5);

    ws.send(Message::text("definitely not json")).await.unwrap();
    let reply = next_ws_reply(&mut ws).await;
    assert_eq!(reply["error_text_code"], "INCORRECT_MESSAGE_PARAMS");

    ws.send(Message::Binary(vec![1, 2, 3])).await.unwrap();
    let reply = next_ws_reply(&mut ws).await;
    assert_eq!(reply["error_code"], 9);
    assert!(reply["description"].as_str().unwrap().contains("binary"));

    ws.close(None).await.unwrap();
    cancel.cancel();
    server.await.unwrap();
    coordinator.stop().await;
}

#[tokio::test]
async fn test_websocket_busy_reply_reaches_origin() {
    let coordinator = fast_coordinator();
    coordinator.start().await.unwrap();
    let cancel = CancellationToken::new();
    let (addr, server) = start_ws(&coordinator, &cancel).await;

    let (mut ws, _) = tokio_tungstenite::connect_async(format!("ws://{addr}"))
        .await
        .unwrap();

    // Far target with a long timeout keeps the coordinator executing.
    ws.send(Message::text(
        json!({"command_type": "set_voltage_and_check", "voltage": 1.0e9, "max_error": 1, "timeout": 60})
            .to_string(),
    ))
    .await
    .unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    ws.send(Message::text(
        json!({"command_type": "set_voltage", "voltage": 1}).to_string(),
    ))
    .await
    .unwrap();

    let reply = next_ws_reply(&mut ws).await;
    assert_eq!(reply["error_code"], 8);
    assert_eq!(reply["error_text_code"], "SERVER_BUSY_ERROR");

    // Shutdown closes the session.
    cancel.cancel();
    server.await.unwrap();
    coordinator.stop().await;
}

#[tokio::test]
async fn test_websocket_shutdown_with_stalled_handshake() {
    let coordinator = fast_coordinator();
    let cancel = CancellationToken::new();
    let (addr, server) = start_ws(&coordinator, &cancel).await;

    // Connects at the TCP level but never sends the HTTP upgrade.
    let _silent = TcpStream::connect(&addr).await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;

    cancel.cancel();
    let stopped = tokio::time::timeout(Duration::from_secs(5), server).await;
    assert!(stopped.is_ok(), "server waited on a client stuck in the handshake");
}
