//! # Store
//!
//! Idempotent persistence for `PlaybackEvent`s, keyed by `event_id`, with one
//! secondary chronological access path over `(user_id, timestamp)`.
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::event::PlaybackEvent;

pub mod memory;
pub mod postgres;

pub use memory::MemoryEventStore;
pub use postgres::PgEventStore;

/// Outcome of a successful `put`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Ack {
    /// No live record existed for the `event_id`.
    Created,
    /// The record was rewritten, either with different content or because it had expired.
    Updated,
    /// The same content was already stored. Nothing was written.
    Unchanged,
}

impl Ack {
    pub fn as_str(&self) -> &'static str {
        match self {
            Ack::Created => "created",
            Ack::Updated => "updated",
            Ack::Unchanged => "unchanged",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailureKind {
    /// May succeed if attempted again later.
    Transient,
    /// Will fail again for the same item.
    Permanent,
    /// The store itself is gone. Nothing else can make progress.
    Fatal,
}

impl FailureKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureKind::Transient => "transient",
            FailureKind::Permanent => "permanent",
            FailureKind::Fatal => "fatal",
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("store is throttling requests: {0}")]
    Throttled(String),
    #[error("store call timed out: {0}")]
    Timeout(String),
    #[error("store is temporarily unavailable: {0}")]
    Unavailable(String),
    #[error("item of {size} bytes exceeds the {limit} byte limit")]
    ItemTooLarge { size: usize, limit: usize },
    #[error("malformed key: {0}")]
    MalformedKey(String),
    #[error("store rejected the item: {0}")]
    Rejected(String),
    #[error("lost connection to the store: {0}")]
    ConnectionLost(String),
}

impl StoreError {
    pub fn kind(&self) -> FailureKind {
        match self {
            StoreError::Throttled(_) | StoreError::Timeout(_) | StoreError::Unavailable(_) => {
                FailureKind::Transient
            }
            StoreError::ItemTooLarge { .. }
            | StoreError::MalformedKey(_)
            | StoreError::Rejected(_) => FailureKind::Permanent,
            StoreError::ConnectionLost(_) => FailureKind::Fatal,
        }
    }

    /// Stable identifier used in dead-letter entries and metric labels.
    pub fn reason_code(&self) -> &'static str {
        match self {
            StoreError::Throttled(_) => "throttled",
            StoreError::Timeout(_) => "timeout",
            StoreError::Unavailable(_) => "unavailable",
            StoreError::ItemTooLarge { .. } => "item_too_large",
            StoreError::MalformedKey(_) => "malformed_key",
            StoreError::Rejected(_) => "rejected",
            StoreError::ConnectionLost(_) => "connection_lost",
        }
    }
}

/// Size and shape limits enforced before an item reaches the backend.
#[derive(Debug, Clone, Copy)]
pub struct StoreLimits {
    pub max_key_bytes: usize,
    pub max_item_bytes: usize,
}

impl Default for StoreLimits {
    fn default() -> Self {
        Self {
            max_key_bytes: 2048,
            max_item_bytes: 400 * 1024,
        }
    }
}

impl StoreLimits {
    pub fn check(&self, event: &PlaybackEvent) -> Result<(), StoreError> {
        for key in [&event.event_id, &event.user_id] {
            if key.is_empty() || key.len() > self.max_key_bytes || key.contains('\0') {
                return Err(StoreError::MalformedKey(key.escape_debug().to_string()));
            }
        }

        let size = serde_json::to_vec(event)
            .map_err(|error| StoreError::Rejected(error.to_string()))?
            .len();
        if size > self.max_item_bytes {
            return Err(StoreError::ItemTooLarge {
                size,
                limit: self.max_item_bytes,
            });
        }

        Ok(())
    }
}

#[async_trait]
pub trait EventStore: Send + Sync {
    /// Conditional upsert keyed by `event_id`. Identical content is a no-op and
    /// keeps the stored `ttl`; different content overwrites.
    async fn put(&self, event: &PlaybackEvent) -> Result<Ack, StoreError>;

    /// Point lookup. Expired events are not returned.
    async fn get(&self, event_id: &str) -> Result<Option<PlaybackEvent>, StoreError>;

    /// Events of one user with `from <= timestamp < to`, oldest first, ties broken by `event_id`.
    /// Expired events are not returned.
    async fn events_for_user(
        &self,
        user_id: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<PlaybackEvent>, StoreError>;
}

#[async_trait]
pub trait ExpirySweeper: Send + Sync {
    /// Physically delete up to `limit` events whose `ttl` is at or before `now`.
    async fn sweep_expired(&self, now: DateTime<Utc>, limit: usize) -> Result<u64, StoreError>;
}
