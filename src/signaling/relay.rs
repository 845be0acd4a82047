#![forbid(unsafe_code)]

// Point-to-point handshake forwarding. The target is looked up in the
// connection registry only; room membership is not checked, and a missing
// target is a silent drop.

use super::outbox::send_to;
use super::protocol::ServerMessage;
use crate::metrics::{Counter, ServerMetrics};
use crate::room::registry::ConnectionRegistry;
use serde_json::Value;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalKind {
    Offer,
    Answer,
    IceCandidate,
}

impl SignalKind {
    pub fn event_name(self) -> &'static str {
        match self {
            SignalKind::Offer => "offer",
            SignalKind::Answer => "answer",
            SignalKind::IceCandidate => "ice-candidate",
        }
    }

    fn into_message(self, sender_id: String, payload: Value) -> ServerMessage {
        match self {
            SignalKind::Offer => ServerMessage::Offer { sender_id, offer: payload },
            SignalKind::Answer => ServerMessage::Answer { sender_id, answer: payload },
            SignalKind::IceCandidate => ServerMessage::IceCandidate { sender_id, candidate: payload },
        }
    }
}

#[derive(Clone)]
pub struct Relay {
    registry: ConnectionRegistry,
    metrics: ServerMetrics,
}

impl Relay {
    pub fn new(registry: ConnectionRegistry, metrics: ServerMetrics) -> Self {
        Self { registry, metrics }
    }

    /// Forwards `payload` unchanged to `to`, tagged with `senderId = from`.
    /// Returns whether it was queued; a false return is never an error.
    pub fn relay(&self, kind: SignalKind, from: &str, to: &str, payload: Value) -> bool {
        let Some(outbox) = self.registry.outbox(to) else {
            debug!("Dropping {} from {}: target {} not connected", kind.event_name(), from, to);
            self.metrics.inc(Counter::DeliveriesDropped);
            return false;
        };

        if send_to(&outbox, &kind.into_message(from.to_string(), payload), to) {
            debug!("Relayed {} {} -> {}", kind.event_name(), from, to);
            self.metrics.inc(Counter::SignalsRelayed);
            true
        } else {
            self.metrics.inc(Counter::DeliveriesDropped);
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use tokio::sync::mpsc;

    fn setup(ids: &[&str]) -> (Relay, Vec<mpsc::Receiver<Arc<String>>>) {
        let registry = ConnectionRegistry::new();
        let inboxes = ids
            .iter()
            .map(|id| {
                let (tx, rx) = mpsc::channel(4);
                registry.register(id.to_string(), tx);
                rx
            })
            .collect();
        (Relay::new(registry, ServerMetrics::new()), inboxes)
    }

    #[test]
    fn test_reaches_only_target_with_sender_id() {
        let (relay, mut inboxes) = setup(&["a", "b", "c"]);
        let sdp = serde_json::json!({"type": "offer", "sdp": "v=0"});

        assert!(relay.relay(SignalKind::Offer, "a", "b", sdp.clone()));

        let json: Value = serde_json::from_str(&inboxes[1].try_recv().unwrap()).unwrap();
        assert_eq!(json["event"], "offer");
        assert_eq!(json["data"]["senderId"], "a");
        assert_eq!(json["data"]["offer"], sdp);
        assert!(inboxes[0].try_recv().is_err());
        assert!(inboxes[2].try_recv().is_err());
        assert_eq!(relay.metrics.get(Counter::SignalsRelayed), 1);
    }

    #[test]
    fn test_kind_becomes_event_name() {
        let (relay, mut inboxes) = setup(&["a", "b"]);
        relay.relay(SignalKind::IceCandidate, "b", "a", serde_json::json!({"candidate": "c"}));
        let json: Value = serde_json::from_str(&inboxes[0].try_recv().unwrap()).unwrap();
        assert_eq!(json["event"], "ice-candidate");
        assert_eq!(json["data"]["candidate"]["candidate"], "c");
    }

    #[test]
    fn test_gone_target_is_silent() {
        let (relay, mut inboxes) = setup(&["a", "b"]);
        relay.registry.deregister("b");

        assert!(!relay.relay(SignalKind::Answer, "a", "b", Value::Null));
        assert!(!relay.relay(SignalKind::Answer, "a", "never-existed", Value::Null));
        assert!(inboxes[0].try_recv().is_err());
        assert_eq!(relay.metrics.get(Counter::DeliveriesDropped), 2);
    }

    #[test]
    fn test_closed_channel_is_silent() {
        let (relay, mut inboxes) = setup(&["a", "b"]);
        // b's socket task exited but the registry entry has not been cleaned up yet
        drop(inboxes.pop());
        assert!(!relay.relay(SignalKind::Offer, "a", "b", Value::Null));
    }
}
