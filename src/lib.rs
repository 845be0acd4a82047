#![forbid(unsafe_code)]

// meetsignal library - room/presence signaling server for browser WebRTC meetings

pub mod config;
pub mod error;
pub mod metrics;
pub mod room;
pub mod signaling;
