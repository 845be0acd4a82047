use futures_util::{SinkExt, StreamExt};
use meetsignal::config::ServerConfig;
use meetsignal::error::RoomError;
use meetsignal::signaling::SignalingServer;
use serde_json::{json, Value};
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};

type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

async fn start_server() -> (SignalingServer, String) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("ws://{}/ws", listener.local_addr().unwrap());
    let server = SignalingServer::new(ServerConfig::default());
    tokio::spawn(server.clone().serve_on(listener));
    (server, url)
}

async fn send(client: &mut Client, frame: Value) {
    client.send(Message::Text(frame.to_string().into())).await.unwrap();
}

async fn next_event(client: &mut Client) -> Value {
    loop {
        let frame = tokio::time::timeout(Duration::from_secs(5), client.next())
            .await
            .expect("timed out waiting for a frame")
            .expect("stream ended")
            .unwrap();
        if let Message::Text(text) = frame {
            return serde_json::from_str(text.as_str()).unwrap();
        }
    }
}

async fn join(url: &str, room: &str, name: &str) -> (Client, Value) {
    let (mut client, _) = connect_async(url).await.unwrap();
    send(&mut client, json!({"event": "join-room", "data": {"roomId": room, "userName": name}})).await;
    let reply = next_event(&mut client).await;
    assert_eq!(reply["event"], "room-participants");
    (client, reply["data"].clone())
}

async fn wait_until(mut done: impl FnMut() -> bool) {
    for _ in 0..100 {
        if done() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("condition not reached in time");
}

#[tokio::test]
async fn test_two_party_meeting_over_websocket() {
    let (server, url) = start_server().await;

    let (mut alice, list) = join(&url, "e2e", "Alice").await;
    assert_eq!(list.as_array().unwrap().len(), 1);
    let alice_id = list[0]["id"].as_str().unwrap().to_string();

    let (mut bob, list) = join(&url, "e2e", "Bob").await;
    assert_eq!(list.as_array().unwrap().len(), 2);

    let joined = next_event(&mut alice).await;
    assert_eq!(joined["event"], "participant-joined");
    assert_eq!(joined["data"]["name"], "Bob");
    let bob_id = joined["data"]["id"].as_str().unwrap().to_string();

    // Offer relay carries the sender's id
    send(&mut alice, json!({"event": "offer", "data": {"targetId": bob_id, "offer": {"sdp": "v=0"}}})).await;
    let offer = next_event(&mut bob).await;
    assert_eq!(offer["event"], "offer");
    assert_eq!(offer["data"]["senderId"], alice_id.as_str());
    assert_eq!(offer["data"]["offer"]["sdp"], "v=0");

    // Chat comes back to the sender too, byte-for-byte the same
    send(&mut bob, json!({"event": "chat-message", "data": {"message": "hello"}})).await;
    let to_alice = next_event(&mut alice).await;
    let to_bob = next_event(&mut bob).await;
    assert_eq!(to_alice, to_bob);
    assert_eq!(to_alice["data"]["senderName"], "Bob");

    let snapshot = server.room_manager().get_room_snapshot("e2e").await.unwrap();
    assert_eq!(snapshot.participant_count, 2);

    bob.close(None).await.unwrap();
    let left = next_event(&mut alice).await;
    assert_eq!(left["event"], "participant-left");
    assert_eq!(left["data"], bob_id.as_str());

    alice.close(None).await.unwrap();
    let registry = server.room_manager().registry().clone();
    wait_until(|| registry.connection_count() == 0).await;

    assert_eq!(server.room_manager().room_count(), 0);
    assert_eq!(
        server.room_manager().get_room_snapshot("e2e").await.err(),
        Some(RoomError::NotFound("e2e".into()))
    );
}

#[tokio::test]
async fn test_malformed_frames_are_dropped_silently() {
    let (server, url) = start_server().await;
    let (mut client, _) = join(&url, "quiet", "Solo").await;

    send(&mut client, json!({"event": "no-such-event"})).await;
    client.send(Message::Text("not json".into())).await.unwrap();
    send(&mut client, json!({"event": "chat-message", "data": {"message": ""}})).await;

    // The connection is still usable and nothing was sent back for the junk
    send(&mut client, json!({"event": "check-room-occupancy", "data": {"roomId": "quiet"}})).await;
    let status = next_event(&mut client).await;
    assert_eq!(status["event"], "room-occupancy-status");
    assert_eq!(status["data"]["participantCount"], 1);

    let metrics = server.metrics().clone();
    wait_until(|| metrics.get(meetsignal::metrics::Counter::Errors) == 3).await;
}
