use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// The closed set of playback actions a client can report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[sqlx(type_name = "playback_event_type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventType {
    StartPlayback,
    Pause,
    Resume,
    EndPlayback,
    ChapterChange,
    Bookmark,
    SpeedChange,
}

impl EventType {
    pub const ALL: [EventType; 7] = [
        EventType::StartPlayback,
        EventType::Pause,
        EventType::Resume,
        EventType::EndPlayback,
        EventType::ChapterChange,
        EventType::Bookmark,
        EventType::SpeedChange,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::StartPlayback => "START_PLAYBACK",
            EventType::Pause => "PAUSE",
            EventType::Resume => "RESUME",
            EventType::EndPlayback => "END_PLAYBACK",
            EventType::ChapterChange => "CHAPTER_CHANGE",
            EventType::Bookmark => "BOOKMARK",
            EventType::SpeedChange => "SPEED_CHANGE",
        }
    }
}

#[derive(Debug, PartialEq, Eq)]
pub struct UnknownEventType(pub String);

/// Exact, case-sensitive match against the wire names.
impl FromStr for EventType {
    type Err = UnknownEventType;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        EventType::ALL
            .into_iter()
            .find(|event_type| event_type.as_str() == s)
            .ok_or_else(|| UnknownEventType(s.to_owned()))
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Client context attached to an event. Every field is free-form.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlaybackMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub app_version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub network_type: Option<String>,
}

/// A validated, normalized playback event as persisted by the store.
///
/// `processed_at` and `ttl` are derived at ingestion and never read from the
/// client payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlaybackEvent {
    pub event_id: String,
    pub user_id: String,
    pub book_id: String,
    pub event_type: EventType,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub position: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chapter: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<PlaybackMetadata>,
    pub processed_at: DateTime<Utc>,
    #[serde(with = "chrono::serde::ts_seconds")]
    pub ttl: DateTime<Utc>,
}

impl PlaybackEvent {
    /// Compares the client-supplied fields, ignoring the derived ones.
    /// Two deliveries of the same logical event are `same_content` even when
    /// they were ingested at different times.
    pub fn same_content(&self, other: &PlaybackEvent) -> bool {
        self.event_id == other.event_id
            && self.user_id == other.user_id
            && self.book_id == other.book_id
            && self.event_type == other.event_type
            && self.timestamp == other.timestamp
            && self.position == other.position
            && self.chapter == other.chapter
            && self.metadata == other.metadata
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.ttl <= now
    }
}
