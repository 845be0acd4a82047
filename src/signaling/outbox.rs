#![forbid(unsafe_code)]

// Per-connection outbound channel. Everything queued here is pre-serialized JSON,
// so a broadcast serializes once and shares the Arc across recipients.

use super::protocol::ServerMessage;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, warn};

pub type Outbox = mpsc::Sender<Arc<String>>;

/// Serialize a message for delivery. Serialization failures are logged and
/// reported as `None`; callers treat that as a dropped delivery.
pub fn encode(message: &ServerMessage) -> Option<Arc<String>> {
    match serde_json::to_string(message) {
        Ok(json) => Some(Arc::new(json)),
        Err(e) => {
            warn!("Failed to serialize {} message: {}", message.event_name(), e);
            None
        }
    }
}

/// Queue pre-serialized JSON without waiting. Returns false when the message
/// was dropped because the channel is full or the peer is gone.
pub fn deliver(outbox: &Outbox, json: Arc<String>, peer_id: &str) -> bool {
    match outbox.try_send(json) {
        Ok(()) => true,
        Err(mpsc::error::TrySendError::Full(_)) => {
            warn!("Channel full for connection {}, dropping message", peer_id);
            false
        }
        Err(mpsc::error::TrySendError::Closed(_)) => {
            debug!("Channel closed for connection {} (disconnected)", peer_id);
            false
        }
    }
}

/// Serialize and queue in one step.
pub fn send_to(outbox: &Outbox, message: &ServerMessage, peer_id: &str) -> bool {
    encode(message).is_some_and(|json| deliver(outbox, json, peer_id))
}
