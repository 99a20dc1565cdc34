use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use super::{Ack, EventStore, ExpirySweeper, StoreError, StoreLimits};
use crate::event::PlaybackEvent;
use crate::time::{SystemTime, TimeSource};

type UserIndexKey = (String, DateTime<Utc>, String);

#[derive(Default)]
struct Tables {
    events: HashMap<String, PlaybackEvent>,
    by_user: BTreeSet<UserIndexKey>,
}

impl Tables {
    fn index_key(event: &PlaybackEvent) -> UserIndexKey {
        (
            event.user_id.clone(),
            event.timestamp,
            event.event_id.clone(),
        )
    }

    fn insert(&mut self, event: PlaybackEvent) {
        if let Some(previous) = self.events.remove(&event.event_id) {
            _ = self.by_user.remove(&Self::index_key(&previous));
        }
        _ = self.by_user.insert(Self::index_key(&event));
        self.events.insert(event.event_id.clone(), event);
    }

    fn remove(&mut self, event_id: &str) -> bool {
        match self.events.remove(event_id) {
            Some(previous) => {
                _ = self.by_user.remove(&Self::index_key(&previous));
                true
            }
            None => false,
        }
    }
}

/// An `EventStore` held in process memory.
///
/// The primary map and the `(user_id, timestamp)` index are updated under the
/// same lock, so a reader never sees one without the other.
#[derive(Clone)]
pub struct MemoryEventStore {
    tables: Arc<Mutex<Tables>>,
    limits: StoreLimits,
    clock: Arc<dyn TimeSource>,
}

impl Default for MemoryEventStore {
    fn default() -> Self {
        Self::new(StoreLimits::default(), Arc::new(SystemTime {}))
    }
}

impl MemoryEventStore {
    pub fn new(limits: StoreLimits, clock: Arc<dyn TimeSource>) -> Self {
        Self {
            tables: Default::default(),
            limits,
            clock,
        }
    }

    /// Number of rows physically held, expired ones included.
    pub fn len(&self) -> usize {
        self.lock().map(|tables| tables.events.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> Result<MutexGuard<'_, Tables>, StoreError> {
        self.tables
            .lock()
            .map_err(|_| StoreError::ConnectionLost("poisoned store lock".to_owned()))
    }
}

#[async_trait]
impl EventStore for MemoryEventStore {
    async fn put(&self, event: &PlaybackEvent) -> Result<Ack, StoreError> {
        self.limits.check(event)?;
        let now = self.clock.now();
        let mut tables = self.lock()?;

        let ack = match tables.events.get(&event.event_id) {
            None => Ack::Created,
            Some(existing) if existing.is_expired(now) => Ack::Updated,
            Some(existing) if existing.same_content(event) => return Ok(Ack::Unchanged),
            Some(_) => Ack::Updated,
        };

        tables.insert(event.clone());
        Ok(ack)
    }

    async fn get(&self, event_id: &str) -> Result<Option<PlaybackEvent>, StoreError> {
        let now = self.clock.now();
        let tables = self.lock()?;

        Ok(tables
            .events
            .get(event_id)
            .filter(|event| !event.is_expired(now))
            .cloned())
    }

    async fn events_for_user(
        &self,
        user_id: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<PlaybackEvent>, StoreError> {
        if from >= to {
            return Ok(Vec::new());
        }

        let now = self.clock.now();
        let tables = self.lock()?;
        let start = (user_id.to_owned(), from, String::new());
        let end = (user_id.to_owned(), to, String::new());

        Ok(tables
            .by_user
            .range(start..end)
            .filter_map(|(_, _, event_id)| tables.events.get(event_id))
            .filter(|event| !event.is_expired(now))
            .take(limit)
            .cloned()
            .collect())
    }
}

#[async_trait]
impl ExpirySweeper for MemoryEventStore {
    async fn sweep_expired(&self, now: DateTime<Utc>, limit: usize) -> Result<u64, StoreError> {
        let mut tables = self.lock()?;

        let expired: Vec<String> = tables
            .events
            .values()
            .filter(|event| event.is_expired(now))
            .take(limit)
            .map(|event| event.event_id.clone())
            .collect();

        let mut deleted = 0;
        for event_id in expired {
            if tables.remove(&event_id) {
                deleted += 1;
            }
        }
        Ok(deleted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{EventType, PlaybackMetadata};
    use crate::store::FailureKind;
    use crate::time::ManualTime;
    use chrono::{Duration, TimeZone};

    fn start() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap()
    }

    fn event(event_id: &str, user_id: &str, seconds: i64) -> PlaybackEvent {
        PlaybackEvent {
            event_id: event_id.to_string(),
            user_id: user_id.to_string(),
            book_id: "book-1".to_string(),
            event_type: EventType::StartPlayback,
            timestamp: start() + Duration::seconds(seconds),
            position: Some(0.0),
            chapter: Some(1),
            metadata: Some(PlaybackMetadata {
                device_type: Some("web".to_string()),
                ..Default::default()
            }),
            processed_at: start(),
            ttl: start() + Duration::days(90),
        }
    }

    fn store_at(clock: &ManualTime) -> MemoryEventStore {
        MemoryEventStore::new(StoreLimits::default(), Arc::new(clock.clone()))
    }

    #[tokio::test]
    async fn repeated_puts_keep_exactly_one_record() {
        let clock = ManualTime::new(start());
        let store = store_at(&clock);
        let first = event("evt-1", "user-1", 0);

        assert_eq!(store.put(&first).await, Ok(Ack::Created));

        let mut redelivered = first.clone();
        redelivered.processed_at = start() + Duration::minutes(5);
        redelivered.ttl = first.ttl + Duration::minutes(5);
        assert_eq!(store.put(&redelivered).await, Ok(Ack::Unchanged));

        assert_eq!(store.len(), 1);
        // The first ttl is kept for an unchanged rewrite.
        assert_eq!(store.get("evt-1").await.unwrap(), Some(first));
    }

    #[tokio::test]
    async fn different_content_overwrites_and_moves_the_index() {
        let clock = ManualTime::new(start());
        let store = store_at(&clock);
        store.put(&event("evt-1", "user-1", 0)).await.unwrap();

        let mut moved = event("evt-1", "user-1", 0);
        moved.timestamp = start() + Duration::hours(2);
        moved.event_type = EventType::Pause;
        assert_eq!(store.put(&moved).await, Ok(Ack::Updated));

        let early = store
            .events_for_user("user-1", start(), start() + Duration::hours(1), 10)
            .await
            .unwrap();
        assert!(early.is_empty());

        let late = store
            .events_for_user("user-1", start(), start() + Duration::hours(3), 10)
            .await
            .unwrap();
        assert_eq!(late, vec![moved]);
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn scans_a_user_in_chronological_order() {
        let clock = ManualTime::new(start());
        let store = store_at(&clock);
        for (event_id, user_id, seconds) in [
            ("c", "user-1", 30),
            ("a", "user-1", 10),
            ("x", "user-2", 15),
            ("b", "user-1", 20),
            ("d", "user-1", 40),
        ] {
            store.put(&event(event_id, user_id, seconds)).await.unwrap();
        }

        let ids = |events: Vec<PlaybackEvent>| -> Vec<String> {
            events.into_iter().map(|event| event.event_id).collect()
        };

        let scanned = store
            .events_for_user("user-1", start(), start() + Duration::seconds(40), 10)
            .await
            .unwrap();
        assert_eq!(ids(scanned), vec!["a", "b", "c"]);

        let limited = store
            .events_for_user("user-1", start(), start() + Duration::hours(1), 2)
            .await
            .unwrap();
        assert_eq!(ids(limited), vec!["a", "b"]);
    }

    #[tokio::test]
    async fn expired_events_are_hidden_before_they_are_swept() {
        let clock = ManualTime::new(start());
        let store = store_at(&clock);
        let mut short_lived = event("evt-1", "user-1", 0);
        short_lived.ttl = start() + Duration::seconds(1);
        store.put(&short_lived).await.unwrap();

        assert!(store.get("evt-1").await.unwrap().is_some());

        clock.advance(Duration::seconds(2));
        assert_eq!(store.get("evt-1").await.unwrap(), None);
        assert!(store
            .events_for_user("user-1", start(), start() + Duration::hours(1), 10)
            .await
            .unwrap()
            .is_empty());
        assert_eq!(store.len(), 1);

        assert_eq!(store.sweep_expired(clock.now(), 100).await, Ok(1));
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn rewriting_an_expired_event_refreshes_it() {
        let clock = ManualTime::new(start());
        let store = store_at(&clock);
        let mut short_lived = event("evt-1", "user-1", 0);
        short_lived.ttl = start() + Duration::seconds(1);
        store.put(&short_lived).await.unwrap();

        clock.advance(Duration::seconds(2));
        let mut redelivered = short_lived.clone();
        redelivered.processed_at = clock.now();
        redelivered.ttl = clock.now() + Duration::days(90);
        assert_eq!(store.put(&redelivered).await, Ok(Ack::Updated));
        assert_eq!(store.get("evt-1").await.unwrap(), Some(redelivered));
    }

    #[tokio::test]
    async fn sweep_respects_the_limit() {
        let clock = ManualTime::new(start());
        let store = store_at(&clock);
        for i in 0..5 {
            let mut expiring = event(&format!("evt-{i}"), "user-1", i);
            expiring.ttl = start() + Duration::seconds(1);
            store.put(&expiring).await.unwrap();
        }
        store.put(&event("keep", "user-1", 9)).await.unwrap();

        let later = start() + Duration::seconds(5);
        assert_eq!(store.sweep_expired(later, 3).await, Ok(3));
        assert_eq!(store.sweep_expired(later, 3).await, Ok(2));
        assert_eq!(store.sweep_expired(later, 3).await, Ok(0));
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn enforces_limits_before_writing() {
        let store = MemoryEventStore::default();
        let result = store.put(&event("bad\0id", "user-1", 0)).await;

        assert!(matches!(result, Err(StoreError::MalformedKey(_))));
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn a_poisoned_lock_is_fatal() {
        let clock = ManualTime::new(start());
        let store = store_at(&clock);
        let tables = store.tables.clone();
        std::thread::spawn(move || {
            let _guard = tables.lock().unwrap();
            panic!("writer died holding the lock");
        })
        .join()
        .unwrap_err();

        let error = store.put(&event("evt-1", "user-1", 0)).await.unwrap_err();
        assert!(matches!(error, StoreError::ConnectionLost(_)));
        assert_eq!(error.kind(), FailureKind::Fatal);
        assert!(store.get("evt-1").await.is_err());
    }
}
