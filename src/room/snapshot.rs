#![forbid(unsafe_code)]

// Read-only views over the room store for polling callers (REST and socket queries).
// Every read goes to the live RoomManager; nothing is cached.

use super::participant::Participant;
use super::RoomManager;
use crate::error::RoomError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomSnapshot {
    pub room_id: String,
    pub participants: Vec<Participant>,
    pub participant_count: usize,
    pub is_empty: bool,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ParticipantCheck {
    pub room_id: String,
    pub participant_id: String,
    pub is_in_room: bool,
    pub participant: Option<Participant>,
    pub total_participants: usize,
}

/// Reply to `check-room-occupancy`. Always produced, even for unknown rooms.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Occupancy {
    pub room_id: String,
    pub room_exists: bool,
    pub has_participants: bool,
    pub participant_count: usize,
    pub participants: Vec<Participant>,
    pub is_empty: bool,
}

/// Reply to `check-participant-in-room`. `last_seen` is the member's join time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ParticipantRoomStatus {
    pub room_id: String,
    pub participant_id: String,
    pub room_exists: bool,
    pub is_in_room: bool,
    pub participant: Option<Participant>,
    pub last_seen: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Analytics {
    pub participant_count: usize,
    /// Milliseconds since the room was created
    pub elapsed_since_creation: i64,
    pub created_at: DateTime<Utc>,
}

impl RoomManager {
    pub async fn get_room_snapshot(&self, room_id: &str) -> Result<RoomSnapshot, RoomError> {
        let room = self.read_room(room_id).await?;
        let participants = room.participants();
        Ok(RoomSnapshot {
            room_id: room.id.clone(),
            participant_count: participants.len(),
            is_empty: participants.is_empty(),
            participants,
            created_at: room.created_at,
        })
    }

    pub async fn check_participant(&self, room_id: &str, participant_id: &str) -> Result<ParticipantCheck, RoomError> {
        let room = self.read_room(room_id).await?;
        let participant = room.participant(participant_id).cloned();
        Ok(ParticipantCheck {
            room_id: room_id.to_string(),
            participant_id: participant_id.to_string(),
            is_in_room: participant.is_some(),
            participant,
            total_participants: room.len(),
        })
    }

    pub async fn occupancy(&self, room_id: &str) -> Occupancy {
        match self.read_room(room_id).await {
            Ok(room) => {
                let participants = room.participants();
                Occupancy {
                    room_id: room_id.to_string(),
                    room_exists: true,
                    has_participants: !participants.is_empty(),
                    participant_count: participants.len(),
                    is_empty: participants.is_empty(),
                    participants,
                }
            }
            Err(RoomError::NotFound(_)) => Occupancy {
                room_id: room_id.to_string(),
                room_exists: false,
                has_participants: false,
                participant_count: 0,
                participants: Vec::new(),
                is_empty: true,
            },
        }
    }

    pub async fn participant_status(&self, room_id: &str, participant_id: &str) -> ParticipantRoomStatus {
        match self.check_participant(room_id, participant_id).await {
            Ok(check) => ParticipantRoomStatus {
                room_id: check.room_id,
                participant_id: check.participant_id,
                room_exists: true,
                is_in_room: check.is_in_room,
                last_seen: check.participant.as_ref().map(|p| p.joined_at),
                participant: check.participant,
            },
            Err(RoomError::NotFound(_)) => ParticipantRoomStatus {
                room_id: room_id.to_string(),
                participant_id: participant_id.to_string(),
                room_exists: false,
                is_in_room: false,
                participant: None,
                last_seen: None,
            },
        }
    }

    pub async fn analytics(&self, room_id: &str) -> Result<Analytics, RoomError> {
        let room = self.read_room(room_id).await?;
        Ok(Analytics {
            participant_count: room.len(),
            elapsed_since_creation: (Utc::now() - room.created_at).num_milliseconds().max(0),
            created_at: room.created_at,
        })
    }
}
