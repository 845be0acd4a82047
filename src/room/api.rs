#![forbid(unsafe_code)]

// REST snapshot surface for callers that hold no socket.

use super::snapshot::{ParticipantCheck, RoomSnapshot};
use crate::error::RoomError;
use crate::signaling::SignalingServer;
use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;

#[derive(Debug)]
pub enum ApiError {
    RoomNotFound,
    /// Participant check against a room that does not exist
    ParticipantCheckNotFound { room_id: String, participant_id: String },
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = match self {
            ApiError::RoomNotFound => serde_json::json!({ "error": "Room not found" }),
            ApiError::ParticipantCheckNotFound { room_id, participant_id } => serde_json::json!({
                "error": "Room not found",
                "roomId": room_id,
                "participantId": participant_id,
                "isInRoom": false,
            }),
        };
        (StatusCode::NOT_FOUND, Json(body)).into_response()
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CreatedRoom {
    pub room_id: String,
}

/// GET /api/rooms/{room_id}
pub async fn get_room(
    State(server): State<SignalingServer>,
    Path(room_id): Path<String>,
) -> Result<Json<RoomSnapshot>, ApiError> {
    server
        .room_manager()
        .get_room_snapshot(&room_id)
        .await
        .map(Json)
        .map_err(|RoomError::NotFound(_)| ApiError::RoomNotFound)
}

/// GET /api/rooms/{room_id}/check-participant/{participant_id}
pub async fn check_participant(
    State(server): State<SignalingServer>,
    Path((room_id, participant_id)): Path<(String, String)>,
) -> Result<Json<ParticipantCheck>, ApiError> {
    match server.room_manager().check_participant(&room_id, &participant_id).await {
        Ok(check) => Ok(Json(check)),
        Err(RoomError::NotFound(_)) => Err(ApiError::ParticipantCheckNotFound { room_id, participant_id }),
    }
}

/// POST /api/rooms
pub async fn create_room(State(server): State<SignalingServer>) -> Json<CreatedRoom> {
    let room_id = server.room_manager().create_room();
    Json(CreatedRoom { room_id })
}
