#![forbid(unsafe_code)]

// Signaling protocol - event envelopes exchanged over the WebSocket.
//
// Every frame is `{"event": "<kebab-case name>", "data": <payload>}`; events
// without a payload may omit `data`.

use crate::room::participant::{MediaKind, Participant};
use crate::room::snapshot::{Analytics, Occupancy, ParticipantRoomStatus};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Client-to-Server messages
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "kebab-case")]
pub enum ClientMessage {
    /// Join (or create) a room
    #[serde(rename_all = "camelCase")]
    JoinRoom {
        room_id: String,
        #[serde(default)]
        user_name: Option<String>,
    },
    /// Leave the current room without closing the connection
    LeaveRoom,
    /// SDP offer for one peer
    #[serde(rename_all = "camelCase")]
    Offer {
        target_id: String,
        #[serde(alias = "payload")]
        offer: Value,
    },
    /// SDP answer for one peer
    #[serde(rename_all = "camelCase")]
    Answer {
        target_id: String,
        #[serde(alias = "payload")]
        answer: Value,
    },
    /// Trickled ICE candidate for one peer
    #[serde(rename_all = "camelCase")]
    IceCandidate {
        target_id: String,
        #[serde(alias = "payload")]
        candidate: Value,
    },
    /// Toggle the sender's audio or video flag
    MediaControl {
        #[serde(rename = "type")]
        kind: MediaKind,
        enabled: bool,
    },
    /// Chat line for the whole room
    ChatMessage {
        message: String,
    },
    /// Room analytics for the sender's room
    GetAnalytics,
    #[serde(rename_all = "camelCase")]
    CheckRoomOccupancy {
        room_id: String,
    },
    #[serde(rename_all = "camelCase")]
    CheckParticipantInRoom {
        room_id: String,
        participant_id: String,
    },
}

impl ClientMessage {
    pub fn event_name(&self) -> &'static str {
        match self {
            ClientMessage::JoinRoom { .. } => "join-room",
            ClientMessage::LeaveRoom => "leave-room",
            ClientMessage::Offer { .. } => "offer",
            ClientMessage::Answer { .. } => "answer",
            ClientMessage::IceCandidate { .. } => "ice-candidate",
            ClientMessage::MediaControl { .. } => "media-control",
            ClientMessage::ChatMessage { .. } => "chat-message",
            ClientMessage::GetAnalytics => "get-analytics",
            ClientMessage::CheckRoomOccupancy { .. } => "check-room-occupancy",
            ClientMessage::CheckParticipantInRoom { .. } => "check-participant-in-room",
        }
    }
}

/// Server-to-Client messages
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "kebab-case")]
pub enum ServerMessage {
    /// Someone else joined the room
    ParticipantJoined(Participant),
    /// Full member list, sent only to the joining connection
    RoomParticipants(Vec<Participant>),
    #[serde(rename_all = "camelCase")]
    Offer {
        sender_id: String,
        offer: Value,
    },
    #[serde(rename_all = "camelCase")]
    Answer {
        sender_id: String,
        answer: Value,
    },
    #[serde(rename_all = "camelCase")]
    IceCandidate {
        sender_id: String,
        candidate: Value,
    },
    #[serde(rename_all = "camelCase")]
    ParticipantMediaChanged {
        participant_id: String,
        #[serde(rename = "type")]
        kind: MediaKind,
        enabled: bool,
    },
    /// Server-stamped chat line, identical for every recipient
    ChatMessage(ChatEntry),
    AnalyticsData(Analytics),
    RoomOccupancyStatus(Occupancy),
    ParticipantRoomStatus(ParticipantRoomStatus),
    /// Connection id of the departed participant
    ParticipantLeft(String),
}

impl ServerMessage {
    pub fn event_name(&self) -> &'static str {
        match self {
            ServerMessage::ParticipantJoined(_) => "participant-joined",
            ServerMessage::RoomParticipants(_) => "room-participants",
            ServerMessage::Offer { .. } => "offer",
            ServerMessage::Answer { .. } => "answer",
            ServerMessage::IceCandidate { .. } => "ice-candidate",
            ServerMessage::ParticipantMediaChanged { .. } => "participant-media-changed",
            ServerMessage::ChatMessage(_) => "chat-message",
            ServerMessage::AnalyticsData(_) => "analytics-data",
            ServerMessage::RoomOccupancyStatus(_) => "room-occupancy-status",
            ServerMessage::ParticipantRoomStatus(_) => "participant-room-status",
            ServerMessage::ParticipantLeft(_) => "participant-left",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatEntry {
    pub id: String,
    pub sender_id: String,
    pub sender_name: String,
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_join_room_user_name_optional() {
        let msg: ClientMessage =
            serde_json::from_str(r#"{"event":"join-room","data":{"roomId":"abc123"}}"#).unwrap();
        match msg {
            ClientMessage::JoinRoom { room_id, user_name } => {
                assert_eq!(room_id, "abc123");
                assert!(user_name.is_none());
            }
            other => panic!("unexpected {other:?}"),
        }

        let msg: ClientMessage = serde_json::from_str(
            r#"{"event":"join-room","data":{"roomId":"abc123","userName":"Alice"}}"#,
        )
        .unwrap();
        assert!(matches!(msg, ClientMessage::JoinRoom { user_name: Some(ref n), .. } if n == "Alice"));
    }

    #[test]
    fn test_signal_payload_accepts_both_field_names() {
        let named: ClientMessage = serde_json::from_str(
            r#"{"event":"offer","data":{"targetId":"b","offer":{"type":"offer","sdp":"v=0"}}}"#,
        )
        .unwrap();
        let generic: ClientMessage = serde_json::from_str(
            r#"{"event":"ice-candidate","data":{"targetId":"b","payload":{"candidate":"c1"}}}"#,
        )
        .unwrap();

        assert!(matches!(named, ClientMessage::Offer { ref offer, .. } if offer["sdp"] == "v=0"));
        assert!(matches!(generic, ClientMessage::IceCandidate { ref candidate, .. } if candidate["candidate"] == "c1"));
    }

    #[test]
    fn test_missing_fields_are_rejected() {
        assert!(serde_json::from_str::<ClientMessage>(r#"{"event":"offer","data":{"targetId":"b"}}"#).is_err());
        assert!(serde_json::from_str::<ClientMessage>(r#"{"event":"join-room","data":{}}"#).is_err());
        assert!(serde_json::from_str::<ClientMessage>(r#"{"event":"media-control","data":{"type":"screen","enabled":true}}"#).is_err());
        assert!(serde_json::from_str::<ClientMessage>(r#"{"event":"no-such-event"}"#).is_err());
    }

    #[test]
    fn test_payloadless_events() {
        let msg: ClientMessage = serde_json::from_str(r#"{"event":"get-analytics"}"#).unwrap();
        assert!(matches!(msg, ClientMessage::GetAnalytics));
        let msg: ClientMessage = serde_json::from_str(r#"{"event":"leave-room"}"#).unwrap();
        assert_eq!(msg.event_name(), "leave-room");
    }

    #[test]
    fn test_media_changed_wire_shape() {
        let msg = ServerMessage::ParticipantMediaChanged {
            participant_id: "p1".into(),
            kind: MediaKind::Video,
            enabled: false,
        };
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["event"], "participant-media-changed");
        assert_eq!(json["data"]["participantId"], "p1");
        assert_eq!(json["data"]["type"], "video");
        assert_eq!(json["data"]["enabled"], false);
    }

    #[test]
    fn test_relayed_signal_wire_shape() {
        let msg = ServerMessage::Answer {
            sender_id: "a".into(),
            answer: serde_json::json!({"sdp": "x"}),
        };
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["event"], "answer");
        assert_eq!(json["data"]["senderId"], "a");
        assert_eq!(json["data"]["answer"]["sdp"], "x");
    }
}
