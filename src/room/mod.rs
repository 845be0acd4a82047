#![forbid(unsafe_code)]

// Room module - room store, connection registry, fan-out and snapshots
pub mod api;
pub mod broadcast;
pub mod participant;
pub mod registry;
pub mod snapshot;

use crate::error::RoomError;
use crate::metrics::{Counter, ServerMetrics};
use crate::signaling::outbox::Outbox;
use crate::signaling::protocol::ServerMessage;
use chrono::{DateTime, Utc};
use participant::{MediaKind, Participant};
use rand::Rng;
use registry::ConnectionRegistry;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::RwLock as StdRwLock;
use tokio::sync::{OwnedRwLockReadGuard, OwnedRwLockWriteGuard, RwLock as TokioRwLock};
use tracing::{debug, info};

const ROOM_ID_LEN: usize = 6;
const ROOM_ID_ALPHABET: &[u8] = b"0123456789abcdefghijklmnopqrstuvwxyz";

/// A participant plus the channel used to reach it.
pub struct Member {
    pub participant: Participant,
    pub outbox: Outbox,
}

/// Room state
pub struct Room {
    pub id: String,
    pub created_at: DateTime<Utc>,
    members: HashMap<String, Member>,
    /// Set under the write lock when the last member leaves and the room is
    /// dropped from the map. Holders of a stale handle must treat it as gone.
    closed: bool,
}

impl Room {
    fn new(id: String) -> Self {
        Self {
            id,
            created_at: Utc::now(),
            members: HashMap::new(),
            closed: false,
        }
    }

    /// Members ordered by join time.
    pub fn participants(&self) -> Vec<Participant> {
        let mut list: Vec<Participant> = self.members.values().map(|m| m.participant.clone()).collect();
        list.sort_by(|a, b| a.joined_at.cmp(&b.joined_at).then_with(|| a.id.cmp(&b.id)));
        list
    }

    pub fn participant(&self, connection_id: &str) -> Option<&Participant> {
        self.members.get(connection_id).map(|m| &m.participant)
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }
}

/// Room store shared by every connection.
///
/// Uses per-room locking: the outer HashMap is protected by a std::sync::RwLock
/// (held only for brief lookups/inserts/removals, never across await points),
/// while each room is protected by its own tokio::sync::RwLock so joins and
/// leaves in one room never wait on another room.
///
/// Membership changes also update the [`ConnectionRegistry`] binding while the
/// room's write lock is held, so the two views never disagree.
pub struct RoomManager {
    rooms: StdRwLock<HashMap<String, Arc<TokioRwLock<Room>>>>,
    registry: ConnectionRegistry,
    metrics: ServerMetrics,
}

impl RoomManager {
    pub fn new(registry: ConnectionRegistry, metrics: ServerMetrics) -> Self {
        Self {
            rooms: StdRwLock::new(HashMap::new()),
            registry,
            metrics,
        }
    }

    pub fn registry(&self) -> &ConnectionRegistry {
        &self.registry
    }

    pub fn metrics(&self) -> &ServerMetrics {
        &self.metrics
    }

    /// Gets a room lock by ID (brief outer read lock, no await)
    fn get_room(&self, room_id: &str) -> Option<Arc<TokioRwLock<Room>>> {
        let rooms = self.rooms.read().unwrap_or_else(|e| e.into_inner());
        rooms.get(room_id).cloned()
    }

    /// Creates an empty room under a fresh random id.
    ///
    /// Ids are not checked against live rooms beyond the map entry: on the
    /// rare collision the existing room is kept and its id returned.
    pub fn create_room(&self) -> String {
        let room_id = generate_room_id();
        self.ensure_room(&room_id);
        room_id
    }

    /// Returns the room with this id, creating an empty one if absent.
    pub fn ensure_room(&self, room_id: &str) -> Arc<TokioRwLock<Room>> {
        // Fast path: room exists (brief outer read lock)
        if let Some(room) = self.get_room(room_id) {
            return room;
        }

        let mut rooms = self.rooms.write().unwrap_or_else(|e| e.into_inner());
        rooms
            .entry(room_id.to_string())
            .or_insert_with(|| {
                info!("Creating new room: {}", room_id);
                self.metrics.inc(Counter::RoomsCreated);
                Arc::new(TokioRwLock::new(Room::new(room_id.to_string())))
            })
            .clone()
    }

    /// Write guard on a live room, creating it if needed. Retries when the
    /// handle it raced for was closed by a concurrent last-leave.
    async fn open_room(&self, room_id: &str) -> OwnedRwLockWriteGuard<Room> {
        loop {
            let room = self.ensure_room(room_id).write_owned().await;
            if !room.closed {
                return room;
            }
            debug!("Room {} closed while waiting for its lock, retrying", room_id);
        }
    }

    /// Read guard on a live room, or NotFound.
    pub(crate) async fn read_room(&self, room_id: &str) -> Result<OwnedRwLockReadGuard<Room>, RoomError> {
        let lock = self
            .get_room(room_id)
            .ok_or_else(|| RoomError::NotFound(room_id.to_string()))?;
        let room = lock.read_owned().await;
        if room.closed {
            return Err(RoomError::NotFound(room_id.to_string()));
        }
        Ok(room)
    }

    /// Adds (or overwrites) a member, binds the connection to the room and
    /// announces `participant-joined` to everyone else.
    ///
    /// Returns the full member list including the new participant.
    pub async fn add_member(&self, room_id: &str, participant: Participant, outbox: Outbox) -> Vec<Participant> {
        let mut room = self.open_room(room_id).await;
        let connection_id = participant.id.clone();

        let replaced = room
            .members
            .insert(connection_id.clone(), Member { participant: participant.clone(), outbox })
            .is_some();
        self.registry.bind(&connection_id, room_id, participant.clone());

        if replaced {
            debug!("Participant {} re-joined room {} (overwritten)", connection_id, room_id);
        } else {
            info!("Participant {} ({}) joined room {}", connection_id, participant.name, room_id);
        }

        let fanout = room.broadcast_except(&connection_id, &ServerMessage::ParticipantJoined(participant));
        self.record_fanout(fanout);

        room.participants()
    }

    /// Removes a member, clears its registry binding and tells the rest of the
    /// room. The room is deleted in the same critical section when it becomes
    /// empty. Returns `None` if the room or member did not exist.
    pub async fn remove_member(&self, room_id: &str, connection_id: &str) -> Option<Participant> {
        let lock = self.get_room(room_id)?;
        let mut room = lock.write().await;
        if room.closed {
            return None;
        }

        let member = room.members.remove(connection_id)?;
        if self
            .registry
            .lookup(connection_id)
            .is_some_and(|binding| binding.room_id == room_id)
        {
            self.registry.unbind(connection_id);
        }
        info!("Participant {} left room {}", connection_id, room_id);

        let fanout = room.broadcast_all(&ServerMessage::ParticipantLeft(connection_id.to_string()));
        self.record_fanout(fanout);

        if room.members.is_empty() {
            room.closed = true;
            let mut rooms = self.rooms.write().unwrap_or_else(|e| e.into_inner());
            if rooms.get(room_id).is_some_and(|current| Arc::ptr_eq(current, &lock)) {
                rooms.remove(room_id);
            }
            info!("Room {} is empty, deleted", room_id);
        }

        Some(member.participant)
    }

    pub async fn get_members(&self, room_id: &str) -> Result<Vec<Participant>, RoomError> {
        Ok(self.read_room(room_id).await?.participants())
    }

    /// Sets one media flag on a member and announces the change to the others.
    /// Returns false (and does nothing) when the room or member is absent.
    pub async fn set_media_flag(&self, room_id: &str, connection_id: &str, kind: MediaKind, enabled: bool) -> bool {
        let Some(lock) = self.get_room(room_id) else {
            return false;
        };
        let mut room = lock.write().await;
        if room.closed {
            return false;
        }
        let Some(member) = room.members.get_mut(connection_id) else {
            return false;
        };

        member.participant.set_media(kind, enabled);
        self.registry.set_media(connection_id, kind, enabled);
        debug!("Participant {} set {} enabled={} in room {}", connection_id, kind, enabled, room_id);

        let fanout = room.broadcast_except(connection_id, &ServerMessage::ParticipantMediaChanged {
            participant_id: connection_id.to_string(),
            kind,
            enabled,
        });
        self.record_fanout(fanout);
        true
    }

    /// Drops every room. Used on process shutdown.
    pub async fn shutdown(&self) {
        info!("Shutting down all rooms...");

        let all_rooms: Vec<(String, Arc<TokioRwLock<Room>>)> = {
            let mut rooms = self.rooms.write().unwrap_or_else(|e| e.into_inner());
            rooms.drain().collect()
        };

        for (room_id, room_lock) in &all_rooms {
            let mut room = room_lock.write().await;
            room.closed = true;
            let ids: Vec<String> = room.members.drain().map(|(id, _)| id).collect();
            for id in &ids {
                self.registry.unbind(id);
            }
            info!("Shut down room {} ({} participants)", room_id, ids.len());
        }

        info!("All rooms shut down ({} total)", all_rooms.len());
    }

    /// Gets current room count
    pub fn room_count(&self) -> usize {
        self.rooms.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// Gets total participant count across all rooms
    pub async fn total_participant_count(&self) -> usize {
        let room_locks: Vec<Arc<TokioRwLock<Room>>> = {
            let rooms = self.rooms.read().unwrap_or_else(|e| e.into_inner());
            rooms.values().cloned().collect()
        };

        let mut total = 0;
        for room_lock in room_locks {
            total += room_lock.read().await.len();
        }
        total
    }
}

fn generate_room_id() -> String {
    let mut rng = rand::thread_rng();
    (0..ROOM_ID_LEN)
        .map(|_| ROOM_ID_ALPHABET[rng.gen_range(0..ROOM_ID_ALPHABET.len())] as char)
        .collect()
}
