use std::collections::{HashMap, HashSet};
use std::time::{Duration, Instant};
use anyhow::{bail, Result};
use futures_util::{Sink, SinkExt, StreamExt};
use rand::Rng;
use serde_json::json;
use tokio_tungstenite::{connect_async, tungstenite::Message};

use meetsignal::signaling::protocol::{ClientMessage, ServerMessage};

use super::metrics::MetricsCollector;

/// Minimal SDP body; the server relays it opaquely.
const SYNTHETIC_SDP: &str = "v=0\r\no=- 0 0 IN IP4 127.0.0.1\r\ns=-\r\nt=0 0\r\n";

#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub server_url: String,
    pub room_id: String,
    /// Unique per client; used to find our own entry in `room-participants`
    pub user_name: String,
    pub session_duration: Duration,
    pub chat_interval: Duration,
    /// Send an offer to a random peer every N chat ticks
    pub offer_every: u64,
}

async fn send<S>(sink: &mut S, msg: &ClientMessage, metrics: &MetricsCollector) -> Result<()>
where
    S: Sink<Message> + Unpin,
    S::Error: std::error::Error + Send + Sync + 'static,
{
    let json = serde_json::to_string(msg)?;
    sink.send(Message::Text(json.into())).await?;
    metrics.record_frame_sent();
    Ok(())
}

fn pick_peer(peers: &HashSet<String>) -> Option<String> {
    if peers.is_empty() {
        return None;
    }
    let idx = rand::thread_rng().gen_range(0..peers.len());
    peers.iter().nth(idx).cloned()
}

fn elapsed_ms(since: Instant) -> u64 {
    since.elapsed().as_millis() as u64
}

/// One synthetic participant: join, chat on a timer, offer to peers, answer
/// incoming offers, then leave.
pub async fn run_session(config: &SessionConfig, metrics: &MetricsCollector) -> Result<()> {
    let connect_start = Instant::now();
    let (ws, _) = connect_async(config.server_url.as_str()).await?;
    metrics.mark_connection_successful(elapsed_ms(connect_start));
    let (mut sink, mut stream) = ws.split();

    let join_sent = Instant::now();
    send(&mut sink, &ClientMessage::JoinRoom {
        room_id: config.room_id.clone(),
        user_name: Some(config.user_name.clone()),
    }, metrics).await?;

    let mut own_id: Option<String> = None;
    let mut peers: HashSet<String> = HashSet::new();
    let mut pending_chats: HashMap<String, Instant> = HashMap::new();
    let mut pending_offers: HashMap<String, Instant> = HashMap::new();
    let mut ticks: u64 = 0;

    let deadline = tokio::time::sleep(config.session_duration);
    tokio::pin!(deadline);
    let mut ticker = tokio::time::interval(config.chat_interval);

    loop {
        tokio::select! {
            _ = &mut deadline => break,

            _ = ticker.tick(), if own_id.is_some() => {
                ticks += 1;
                let message = format!("{}#{}", config.user_name, ticks);
                pending_chats.insert(message.clone(), Instant::now());
                send(&mut sink, &ClientMessage::ChatMessage { message }, metrics).await?;
                metrics.record_chat_sent();

                if config.offer_every > 0 && ticks % config.offer_every == 0 {
                    if let Some(target_id) = pick_peer(&peers) {
                        pending_offers.insert(target_id.clone(), Instant::now());
                        send(&mut sink, &ClientMessage::Offer {
                            target_id,
                            offer: json!({ "type": "offer", "sdp": SYNTHETIC_SDP }),
                        }, metrics).await?;
                        metrics.record_offer_sent();
                    }
                }
            }

            frame = stream.next() => {
                let text = match frame {
                    Some(Ok(Message::Text(text))) => text,
                    Some(Ok(Message::Close(_))) | None => bail!("server closed the connection"),
                    Some(Ok(_)) => continue,
                    Some(Err(e)) => return Err(e.into()),
                };
                metrics.record_frame_received();

                let msg = match serde_json::from_str::<ServerMessage>(text.as_str()) {
                    Ok(msg) => msg,
                    Err(e) => {
                        metrics.record_error(format!("unparseable frame: {e}"));
                        continue;
                    }
                };

                match msg {
                    ServerMessage::RoomParticipants(list) => {
                        metrics.record_signaling_latency("join-room", elapsed_ms(join_sent));
                        own_id = list.iter().find(|p| p.name == config.user_name).map(|p| p.id.clone());
                        if own_id.is_none() {
                            bail!("own entry missing from room-participants");
                        }
                        peers = list
                            .into_iter()
                            .map(|p| p.id)
                            .filter(|id| Some(id) != own_id.as_ref())
                            .collect();
                        metrics.observe_room_size(peers.len() + 1);
                    }
                    ServerMessage::ParticipantJoined(participant) => {
                        peers.insert(participant.id);
                        metrics.observe_room_size(peers.len() + 1);
                    }
                    ServerMessage::ParticipantLeft(id) => {
                        peers.remove(&id);
                        pending_offers.remove(&id);
                    }
                    ServerMessage::ChatMessage(entry) => {
                        if Some(&entry.sender_id) == own_id.as_ref() {
                            if let Some(sent) = pending_chats.remove(&entry.message) {
                                metrics.record_signaling_latency("chat-message", elapsed_ms(sent));
                                metrics.record_chat_echoed();
                            }
                        }
                    }
                    ServerMessage::Offer { sender_id, .. } => {
                        metrics.record_signal_received();
                        send(&mut sink, &ClientMessage::Answer {
                            target_id: sender_id,
                            answer: json!({ "type": "answer", "sdp": SYNTHETIC_SDP }),
                        }, metrics).await?;
                    }
                    ServerMessage::Answer { sender_id, .. } => {
                        metrics.record_signal_received();
                        if let Some(sent) = pending_offers.remove(&sender_id) {
                            metrics.record_signaling_latency("offer-answer", elapsed_ms(sent));
                        }
                    }
                    ServerMessage::IceCandidate { .. } => metrics.record_signal_received(),
                    _ => {}
                }
            }
        }
    }

    send(&mut sink, &ClientMessage::LeaveRoom, metrics).await?;
    let _ = sink.send(Message::Close(None)).await;
    Ok(())
}
