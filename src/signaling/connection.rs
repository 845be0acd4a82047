#![forbid(unsafe_code)]

// WebSocket connection handler for individual clients

use super::outbox::send_to;
use super::protocol::{ChatEntry, ClientMessage, ServerMessage};
use super::relay::SignalKind;
use super::SignalingServer;
use crate::error::SignalError;
use crate::metrics::Counter;
use crate::room::participant::Participant;
use crate::room::registry::Binding;
use crate::room::RoomManager;
use axum::extract::ws::{Message, WebSocket};
use chrono::Utc;
use futures_util::{SinkExt, StreamExt};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc;
use tokio::sync::OwnedSemaphorePermit;
use tracing::{debug, info, warn};
use uuid::Uuid;

const MAX_ROOM_ID_LEN: usize = 128;
const MAX_USER_NAME_LEN: usize = 64;
const MAX_CHAT_LEN: usize = 4096;
const MAX_TARGET_ID_LEN: usize = 128;

/// Internal: 1 token in microseconds (for integer math).
const TOKEN_US: u64 = 1_000_000;

/// Token bucket: burst capacity and refill rate are both `per_sec` frames.
struct RateLimiter {
    per_sec: u64,
    tokens_us: u64,
    last_refill: Instant,
    warned: bool,
}

impl RateLimiter {
    fn new(per_sec: u64, now: Instant) -> Self {
        Self {
            per_sec,
            tokens_us: per_sec * TOKEN_US,
            last_refill: now,
            warned: false,
        }
    }

    /// Takes one token. Returns `Err(first)` when limited, where `first` is
    /// true only for the first rejected frame of a burst.
    fn take(&mut self, now: Instant) -> Result<(), bool> {
        let elapsed_us = now.saturating_duration_since(self.last_refill).as_micros() as u64;
        self.last_refill = now;
        self.tokens_us = (self.tokens_us + elapsed_us * self.per_sec).min(self.per_sec * TOKEN_US);

        if self.tokens_us >= TOKEN_US {
            self.tokens_us -= TOKEN_US;
            self.warned = false;
            Ok(())
        } else {
            let first = !self.warned;
            self.warned = true;
            Err(first)
        }
    }
}

/// Handles a single WebSocket connection
pub async fn handle_connection(socket: WebSocket, server: SignalingServer, _permit: OwnedSemaphorePermit) {
    let connection_id = Uuid::new_v4().to_string();
    info!("New WebSocket connection: {}", connection_id);

    let metrics = server.metrics.clone();
    metrics.inc(Counter::ConnectionsTotal);
    let _conn_guard = metrics.connection_active_guard();

    let (mut ws_sender, mut ws_receiver) = socket.split();

    // Bounded channel for sending messages to this client
    let (tx, mut rx) = mpsc::channel::<Arc<String>>(server.config.channel_capacity);
    server.room_manager.registry().register(connection_id.clone(), tx);

    let send_id = connection_id.clone();
    let send_metrics = metrics.clone();
    let send_task = tokio::spawn(async move {
        while let Some(json) = rx.recv().await {
            send_metrics.inc(Counter::MessagesSent);
            if ws_sender.send(Message::Text((*json).clone().into())).await.is_err() {
                break;
            }
        }
        debug!("Send task finished for connection: {}", send_id);
    });

    let mut limiter = RateLimiter::new(server.config.rate_limit_per_sec, Instant::now());

    loop {
        let msg = match tokio::time::timeout(server.config.idle_timeout, ws_receiver.next()).await {
            Ok(Some(Ok(message))) => message,
            Ok(Some(Err(e))) => {
                debug!("WebSocket error for connection {}: {}", connection_id, e);
                break;
            }
            Ok(None) => break,
            Err(_) => {
                warn!("Idle timeout for connection {}", connection_id);
                break;
            }
        };

        match msg {
            Message::Text(text) => {
                metrics.inc(Counter::MessagesReceived);

                if let Err(first) = limiter.take(Instant::now()) {
                    if first {
                        warn!(
                            "Rate limit exceeded for connection {} (max {}/s), dropping frames",
                            connection_id, server.config.rate_limit_per_sec
                        );
                    }
                    continue;
                }

                let client_msg = match serde_json::from_str::<ClientMessage>(&text) {
                    Ok(client_msg) => client_msg,
                    Err(e) => {
                        warn!("Invalid message format from {}: {}", connection_id, e);
                        metrics.inc(Counter::Errors);
                        continue;
                    }
                };

                let start = Instant::now();
                let event = client_msg.event_name();
                let result = handle_client_message(client_msg, &connection_id, &server).await;
                metrics.observe_message_handling(start.elapsed());

                if let Err(e) = result {
                    warn!("Dropping {} from {}: {}", event, connection_id, e);
                    metrics.inc(Counter::Errors);
                }
            }
            Message::Close(_) => {
                info!("Client {} closed connection", connection_id);
                break;
            }
            Message::Ping(_) | Message::Pong(_) => {
                // WebSocket ping/pong handled automatically
            }
            Message::Binary(_) => {
                warn!("Unexpected binary frame from client {}", connection_id);
                metrics.inc(Counter::Errors);
            }
        }
    }

    disconnect(&connection_id, &server.room_manager).await;

    // Registry held the last sender; dropping it ends the send task
    let _ = send_task.await;

    info!("Connection handler finished for connection: {}", connection_id);
}

/// Leaves the current room, if any, announcing `participant-left` to the rest.
pub async fn leave_current_room(connection_id: &str, room_manager: &RoomManager) -> Option<Participant> {
    let binding = room_manager.registry().lookup(connection_id)?;
    let left = room_manager.remove_member(&binding.room_id, connection_id).await;
    if left.is_some() {
        room_manager.metrics().inc(Counter::Leaves);
    }
    left
}

/// Tears down a connection: leave its room, then forget it. Safe to call
/// more than once; later calls find nothing to do.
pub async fn disconnect(connection_id: &str, room_manager: &RoomManager) -> Option<Participant> {
    let left = leave_current_room(connection_id, room_manager).await;
    if room_manager.registry().deregister(connection_id).is_some() {
        // Binding survived the leave; only possible if the room vanished underneath it
        debug!("Connection {} was still bound on deregister", connection_id);
    }
    left
}

fn bound_room(server: &SignalingServer, connection_id: &str) -> Result<Binding, SignalError> {
    server
        .room_manager
        .registry()
        .lookup(connection_id)
        .ok_or_else(|| SignalError::NotInRoom(connection_id.to_string()))
}

fn check_len(event: &'static str, field: &str, value: &str, max: usize) -> Result<(), SignalError> {
    if value.is_empty() || value.chars().count() > max {
        return Err(SignalError::malformed(event, format!("{field} must be 1-{max} characters")));
    }
    Ok(())
}

/// Handle a single client message
async fn handle_client_message(
    message: ClientMessage,
    connection_id: &str,
    server: &SignalingServer,
) -> Result<(), SignalError> {
    let room_manager = &server.room_manager;
    let outbox = room_manager
        .registry()
        .outbox(connection_id)
        .ok_or_else(|| SignalError::UnknownConnection(connection_id.to_string()))?;

    match message {
        ClientMessage::JoinRoom { room_id, user_name } => {
            check_len("join-room", "roomId", &room_id, MAX_ROOM_ID_LEN)?;
            if let Some(name) = user_name.as_deref() {
                if name.chars().count() > MAX_USER_NAME_LEN {
                    return Err(SignalError::malformed(
                        "join-room",
                        format!("userName must be at most {MAX_USER_NAME_LEN} characters"),
                    ));
                }
            }

            if let Some(previous) = room_manager.registry().lookup(connection_id) {
                if previous.room_id != room_id {
                    debug!("Connection {} switching rooms {} -> {}", connection_id, previous.room_id, room_id);
                    leave_current_room(connection_id, room_manager).await;
                }
            }

            let participant = Participant::new(connection_id, user_name.as_deref());
            let participants = room_manager.add_member(&room_id, participant, outbox.clone()).await;
            room_manager.metrics().inc(Counter::Joins);

            send_to(&outbox, &ServerMessage::RoomParticipants(participants), connection_id);
        }

        ClientMessage::LeaveRoom => {
            if leave_current_room(connection_id, room_manager).await.is_none() {
                debug!("leave-room from {} while not in a room", connection_id);
            }
        }

        ClientMessage::Offer { target_id, offer } => {
            check_len("offer", "targetId", &target_id, MAX_TARGET_ID_LEN)?;
            server.relay.relay(SignalKind::Offer, connection_id, &target_id, offer);
        }

        ClientMessage::Answer { target_id, answer } => {
            check_len("answer", "targetId", &target_id, MAX_TARGET_ID_LEN)?;
            server.relay.relay(SignalKind::Answer, connection_id, &target_id, answer);
        }

        ClientMessage::IceCandidate { target_id, candidate } => {
            check_len("ice-candidate", "targetId", &target_id, MAX_TARGET_ID_LEN)?;
            server.relay.relay(SignalKind::IceCandidate, connection_id, &target_id, candidate);
        }

        ClientMessage::MediaControl { kind, enabled } => {
            let binding = bound_room(server, connection_id)?;
            if !room_manager.set_media_flag(&binding.room_id, connection_id, kind, enabled).await {
                return Err(SignalError::NotInRoom(connection_id.to_string()));
            }
        }

        ClientMessage::ChatMessage { message } => {
            check_len("chat-message", "message", &message, MAX_CHAT_LEN)?;
            let binding = bound_room(server, connection_id)?;

            let entry = ChatEntry {
                id: Uuid::new_v4().to_string(),
                sender_id: connection_id.to_string(),
                sender_name: binding.participant.name,
                message,
                timestamp: Utc::now(),
            };
            room_manager
                .broadcast_to_room_including_self(&binding.room_id, &ServerMessage::ChatMessage(entry))
                .await
                .map_err(|_| SignalError::NotInRoom(connection_id.to_string()))?;
            room_manager.metrics().inc(Counter::ChatMessages);
        }

        ClientMessage::GetAnalytics => {
            let binding = bound_room(server, connection_id)?;
            let analytics = room_manager
                .analytics(&binding.room_id)
                .await
                .map_err(|_| SignalError::NotInRoom(connection_id.to_string()))?;
            send_to(&outbox, &ServerMessage::AnalyticsData(analytics), connection_id);
        }

        ClientMessage::CheckRoomOccupancy { room_id } => {
            check_len("check-room-occupancy", "roomId", &room_id, MAX_ROOM_ID_LEN)?;
            let occupancy = room_manager.occupancy(&room_id).await;
            send_to(&outbox, &ServerMessage::RoomOccupancyStatus(occupancy), connection_id);
        }

        ClientMessage::CheckParticipantInRoom { room_id, participant_id } => {
            check_len("check-participant-in-room", "roomId", &room_id, MAX_ROOM_ID_LEN)?;
            let status = room_manager.participant_status(&room_id, &participant_id).await;
            send_to(&outbox, &ServerMessage::ParticipantRoomStatus(status), connection_id);
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ServerConfig;
    use serde_json::{json, Value};
    use std::time::Duration;

    type Inbox = mpsc::Receiver<Arc<String>>;

    fn server() -> SignalingServer {
        SignalingServer::new(ServerConfig::default())
    }

    fn connect(server: &SignalingServer, id: &str) -> Inbox {
        let (tx, rx) = mpsc::channel(32);
        server.room_manager.registry().register(id.to_string(), tx);
        rx
    }

    async fn send(server: &SignalingServer, id: &str, frame: Value) -> Result<(), SignalError> {
        let msg: ClientMessage = serde_json::from_value(frame).unwrap();
        handle_client_message(msg, id, server).await
    }

    async fn join(server: &SignalingServer, id: &str, room: &str, name: &str) {
        send(server, id, json!({"event": "join-room", "data": {"roomId": room, "userName": name}}))
            .await
            .unwrap();
    }

    fn events(rx: &mut Inbox) -> Vec<Value> {
        let mut out = Vec::new();
        while let Ok(json) = rx.try_recv() {
            out.push(serde_json::from_str(&json).unwrap());
        }
        out
    }

    #[tokio::test]
    async fn test_join_replies_with_full_list() {
        let server = server();
        let mut alice = connect(&server, "alice");
        let mut bob = connect(&server, "bob");

        join(&server, "alice", "r1", "Alice").await;
        let alice_events = events(&mut alice);
        assert_eq!(alice_events.len(), 1);
        assert_eq!(alice_events[0]["event"], "room-participants");
        assert_eq!(alice_events[0]["data"][0]["id"], "alice");

        join(&server, "bob", "r1", "Bob").await;
        let bob_events = events(&mut bob);
        assert_eq!(bob_events[0]["event"], "room-participants");
        assert_eq!(bob_events[0]["data"].as_array().unwrap().len(), 2);

        let alice_events = events(&mut alice);
        assert_eq!(alice_events.len(), 1);
        assert_eq!(alice_events[0]["event"], "participant-joined");
        assert_eq!(alice_events[0]["data"]["name"], "Bob");
        assert_eq!(alice_events[0]["data"]["videoEnabled"], true);
    }

    #[tokio::test]
    async fn test_join_without_name_gets_placeholder() {
        let server = server();
        let mut rx = connect(&server, "abcd1234");
        send(&server, "abcd1234", json!({"event": "join-room", "data": {"roomId": "r1"}}))
            .await
            .unwrap();
        let reply = events(&mut rx);
        assert_eq!(reply[0]["data"][0]["name"], "User abcd");
    }

    #[tokio::test]
    async fn test_join_into_other_room_leaves_previous() {
        let server = server();
        let _alice = connect(&server, "alice");
        let mut bob = connect(&server, "bob");
        join(&server, "alice", "r1", "Alice").await;
        join(&server, "bob", "r1", "Bob").await;
        events(&mut bob);

        join(&server, "alice", "r2", "Alice").await;

        let bob_events = events(&mut bob);
        assert_eq!(bob_events.len(), 1);
        assert_eq!(bob_events[0]["event"], "participant-left");
        assert_eq!(bob_events[0]["data"], "alice");

        let rm = &server.room_manager;
        assert_eq!(rm.get_members("r1").await.unwrap().len(), 1);
        assert_eq!(rm.get_members("r2").await.unwrap()[0].id, "alice");
        assert_eq!(rm.registry().lookup("alice").unwrap().room_id, "r2");
    }

    #[tokio::test]
    async fn test_duplicate_disconnect_is_noop() {
        let server = server();
        let _alice = connect(&server, "alice");
        let mut bob = connect(&server, "bob");
        join(&server, "alice", "r1", "Alice").await;
        join(&server, "bob", "r1", "Bob").await;
        events(&mut bob);

        assert!(disconnect("alice", &server.room_manager).await.is_some());
        assert!(disconnect("alice", &server.room_manager).await.is_none());

        let bob_events = events(&mut bob);
        assert_eq!(bob_events.len(), 1);
        assert_eq!(bob_events[0]["event"], "participant-left");
        assert_eq!(server.room_manager.registry().connection_count(), 1);
        assert_eq!(server.metrics.get(Counter::Leaves), 1);
    }

    #[tokio::test]
    async fn test_leave_room_keeps_connection() {
        let server = server();
        let _alice = connect(&server, "alice");
        join(&server, "alice", "r1", "Alice").await;

        send(&server, "alice", json!({"event": "leave-room"})).await.unwrap();

        assert_eq!(server.room_manager.room_count(), 0);
        assert!(server.room_manager.registry().outbox("alice").is_some());
        assert!(server.room_manager.registry().lookup("alice").is_none());
    }

    #[tokio::test]
    async fn test_relay_accepts_payload_alias() {
        let server = server();
        let _alice = connect(&server, "alice");
        let mut bob = connect(&server, "bob");

        send(
            &server,
            "alice",
            json!({"event": "offer", "data": {"targetId": "bob", "payload": {"sdp": "v=0"}}}),
        )
        .await
        .unwrap();

        let bob_events = events(&mut bob);
        assert_eq!(bob_events[0]["event"], "offer");
        assert_eq!(bob_events[0]["data"]["senderId"], "alice");
        assert_eq!(bob_events[0]["data"]["offer"]["sdp"], "v=0");

        // Unknown target: nothing delivered, not an error
        send(&server, "alice", json!({"event": "answer", "data": {"targetId": "ghost", "answer": {}}}))
            .await
            .unwrap();
        assert!(matches!(
            send(&server, "alice", json!({"event": "answer", "data": {"targetId": "", "answer": {}}})).await,
            Err(SignalError::Malformed { .. })
        ));
    }

    #[tokio::test]
    async fn test_media_control_reaches_others_only() {
        let server = server();
        let mut alice = connect(&server, "alice");
        let mut bob = connect(&server, "bob");
        join(&server, "alice", "r1", "Alice").await;
        join(&server, "bob", "r1", "Bob").await;
        events(&mut alice);
        events(&mut bob);

        send(&server, "alice", json!({"event": "media-control", "data": {"type": "audio", "enabled": false}}))
            .await
            .unwrap();

        assert!(events(&mut alice).is_empty());
        let bob_events = events(&mut bob);
        assert_eq!(bob_events[0]["event"], "participant-media-changed");
        assert_eq!(bob_events[0]["data"]["participantId"], "alice");
        assert_eq!(bob_events[0]["data"]["type"], "audio");
        assert_eq!(bob_events[0]["data"]["enabled"], false);
    }

    #[tokio::test]
    async fn test_chat_identical_for_everyone() {
        let server = server();
        let mut alice = connect(&server, "alice");
        let mut bob = connect(&server, "bob");
        join(&server, "alice", "r1", "Alice").await;
        join(&server, "bob", "r1", "Bob").await;
        events(&mut alice);
        events(&mut bob);

        send(&server, "alice", json!({"event": "chat-message", "data": {"message": "hi all"}}))
            .await
            .unwrap();

        let a = events(&mut alice);
        let b = events(&mut bob);
        assert_eq!(a, b);
        assert_eq!(a[0]["data"]["senderName"], "Alice");
        assert_eq!(a[0]["data"]["message"], "hi all");
    }

    #[tokio::test]
    async fn test_room_scoped_messages_need_a_room() {
        let server = server();
        let mut rx = connect(&server, "loner");

        assert!(matches!(
            send(&server, "loner", json!({"event": "chat-message", "data": {"message": "hello?"}})).await,
            Err(SignalError::NotInRoom(_))
        ));
        assert!(matches!(
            send(&server, "loner", json!({"event": "get-analytics"})).await,
            Err(SignalError::NotInRoom(_))
        ));
        assert!(matches!(
            send(&server, "loner", json!({"event": "join-room", "data": {"roomId": ""}})).await,
            Err(SignalError::Malformed { .. })
        ));
        assert!(events(&mut rx).is_empty());
        assert_eq!(server.room_manager.room_count(), 0);
    }

    #[tokio::test]
    async fn test_status_queries_reply_to_sender() {
        let server = server();
        let mut alice = connect(&server, "alice");
        join(&server, "alice", "r1", "Alice").await;
        events(&mut alice);

        send(&server, "alice", json!({"event": "get-analytics"})).await.unwrap();
        send(&server, "alice", json!({"event": "check-room-occupancy", "data": {"roomId": "nope"}}))
            .await
            .unwrap();
        send(
            &server,
            "alice",
            json!({"event": "check-participant-in-room", "data": {"roomId": "r1", "participantId": "alice"}}),
        )
        .await
        .unwrap();

        let replies = events(&mut alice);
        assert_eq!(replies[0]["event"], "analytics-data");
        assert_eq!(replies[0]["data"]["participantCount"], 1);
        assert_eq!(replies[1]["event"], "room-occupancy-status");
        assert_eq!(replies[1]["data"]["roomExists"], false);
        assert_eq!(replies[2]["event"], "participant-room-status");
        assert_eq!(replies[2]["data"]["isInRoom"], true);
        assert!(replies[2]["data"]["lastSeen"].is_string());
    }

    #[test]
    fn test_rate_limiter_warns_once_per_burst() {
        let start = Instant::now();
        let mut limiter = RateLimiter::new(2, start);

        assert_eq!(limiter.take(start), Ok(()));
        assert_eq!(limiter.take(start), Ok(()));
        assert_eq!(limiter.take(start), Err(true));
        assert_eq!(limiter.take(start), Err(false));

        // Half a second refills one token at 2/s
        let later = start + Duration::from_millis(500);
        assert_eq!(limiter.take(later), Ok(()));
        assert_eq!(limiter.take(later), Err(true));
    }
}
