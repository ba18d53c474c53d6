//! WebSocket client behavior against a loopback relay.

use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpListener;
use tokio::time::{timeout, Duration};
use tokio_tungstenite::accept_async;
use tokio_tungstenite::tungstenite::Message;

use voicemesh::signaling::{ClientEvent, ServerEvent, SignalChannel, SignalingClient};

#[tokio::test]
async fn disconnect_closes_the_socket() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    // The relay only learns of a departure when the socket actually closes.
    let relay = tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let mut ws = accept_async(stream).await.unwrap();
        loop {
            match ws.next().await {
                Some(Ok(Message::Close(_))) | None => return true,
                Some(Ok(_)) => continue,
                Some(Err(_)) => return false,
            }
        }
    });

    let mut client = SignalingClient::connect(&format!("ws://{addr}")).await.unwrap();
    client.disconnect().await;

    let saw_close = timeout(Duration::from_secs(5), relay)
        .await
        .expect("relay never observed the departure")
        .unwrap();
    assert!(saw_close, "socket must close cleanly, not just go quiet");
}

#[tokio::test]
async fn events_round_trip_through_the_relay() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let relay = tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let mut ws = accept_async(stream).await.unwrap();
        ws.send(Message::Text(
            r#"{"event": "session", "data": "p1"}"#.to_string(),
        ))
        .await
        .unwrap();
        ws.send(Message::Text(r#"{"event": "hype-room"}"#.to_string()))
            .await
            .unwrap();
        // First client frame comes back out for inspection.
        loop {
            match ws.next().await {
                Some(Ok(Message::Text(text))) => return Some(text),
                Some(Ok(_)) => continue,
                _ => return None,
            }
        }
    });

    let mut client = SignalingClient::connect(&format!("ws://{addr}")).await.unwrap();
    client.emit(ClientEvent::HypeRoom("room-1".to_string())).await.unwrap();

    // The session handshake is consumed internally; only hype comes through.
    let event = timeout(Duration::from_secs(5), client.next_event())
        .await
        .unwrap();
    assert_eq!(event, Some(ServerEvent::HypeRoom));
    assert_eq!(client.local_identity().map(|id| id.to_string()), Some("p1".to_string()));

    let sent = timeout(Duration::from_secs(5), relay).await.unwrap().unwrap();
    let frame: serde_json::Value = serde_json::from_str(&sent.unwrap()).unwrap();
    assert_eq!(frame["event"], "hype-room");
    assert_eq!(frame["data"], "room-1");

    client.disconnect().await;
}
