#![forbid(unsafe_code)]

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Media track a participant can toggle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Audio,
    Video,
}

impl std::fmt::Display for MediaKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MediaKind::Audio => f.write_str("audio"),
            MediaKind::Video => f.write_str("video"),
        }
    }
}

/// Public presence fields of a connection inside a room.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Participant {
    pub id: String,
    pub name: String,
    pub joined_at: DateTime<Utc>,
    pub video_enabled: bool,
    pub audio_enabled: bool,
}

impl Participant {
    /// New participant with both tracks enabled. A missing or blank name
    /// falls back to [`Participant::placeholder_name`].
    pub fn new(id: impl Into<String>, name: Option<&str>) -> Self {
        let id = id.into();
        let name = match name.map(str::trim) {
            Some(n) if !n.is_empty() => n.to_string(),
            _ => Self::placeholder_name(&id),
        };
        Self {
            id,
            name,
            joined_at: Utc::now(),
            video_enabled: true,
            audio_enabled: true,
        }
    }

    /// `User <first four chars of the connection id>`
    pub fn placeholder_name(id: &str) -> String {
        let prefix: String = id.chars().take(4).collect();
        format!("User {prefix}")
    }

    pub fn media_enabled(&self, kind: MediaKind) -> bool {
        match kind {
            MediaKind::Audio => self.audio_enabled,
            MediaKind::Video => self.video_enabled,
        }
    }

    pub fn set_media(&mut self, kind: MediaKind, enabled: bool) {
        match kind {
            MediaKind::Audio => self.audio_enabled = enabled,
            MediaKind::Video => self.video_enabled = enabled,
        }
    }
}
