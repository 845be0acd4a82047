#![forbid(unsafe_code)]

// Room-scoped fan-out. Messages are serialized once and the same Arc<String>
// is queued for every recipient, so all copies are byte-identical.

use super::{Room, RoomManager};
use crate::error::RoomError;
use crate::metrics::Counter;
use crate::signaling::outbox::{deliver, encode};
use crate::signaling::protocol::ServerMessage;

/// Outcome of one fan-out.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Fanout {
    pub delivered: usize,
    pub dropped: usize,
}

impl Room {
    /// Broadcast a message to all members except the sender
    pub(crate) fn broadcast_except(&self, sender_id: &str, message: &ServerMessage) -> Fanout {
        self.fan_out(message, Some(sender_id))
    }

    /// Broadcast a message to all members
    pub(crate) fn broadcast_all(&self, message: &ServerMessage) -> Fanout {
        self.fan_out(message, None)
    }

    fn fan_out(&self, message: &ServerMessage, exclude: Option<&str>) -> Fanout {
        let mut fanout = Fanout::default();
        let Some(json) = encode(message) else {
            fanout.dropped = self.members.len();
            return fanout;
        };
        for (id, member) in &self.members {
            if exclude == Some(id.as_str()) {
                continue;
            }
            if deliver(&member.outbox, json.clone(), id) {
                fanout.delivered += 1;
            } else {
                fanout.dropped += 1;
            }
        }
        fanout
    }
}

impl RoomManager {
    /// Delivers `message` to every member of the room except `exclude`.
    /// Returns how many members it was queued for.
    pub async fn broadcast_to_room(
        &self,
        room_id: &str,
        message: &ServerMessage,
        exclude: Option<&str>,
    ) -> Result<usize, RoomError> {
        let room = self.read_room(room_id).await?;
        let fanout = room.fan_out(message, exclude);
        Ok(self.record_fanout(fanout))
    }

    /// Delivers `message` to every member, the originator included.
    pub async fn broadcast_to_room_including_self(
        &self,
        room_id: &str,
        message: &ServerMessage,
    ) -> Result<usize, RoomError> {
        self.broadcast_to_room(room_id, message, None).await
    }

    pub(crate) fn record_fanout(&self, fanout: Fanout) -> usize {
        if fanout.dropped > 0 {
            self.metrics().add(Counter::DeliveriesDropped, fanout.dropped as u64);
        }
        fanout.delivered
    }
}
