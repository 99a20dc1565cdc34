use std::sync::Arc;
use std::time::Instant;

use metrics::{counter, histogram};
use playback_common::store::{ExpirySweeper, StoreError};
use playback_common::time::TimeSource;
use tracing::{debug, info};

use crate::metrics_consts::{RUN_ENDS, RUN_STARTS, RUN_TIME, SWEPT_COUNT};

/// Physically deletes events past their `ttl`. Reads already hide them, so
/// this only reclaims space.
pub struct Janitor {
    sweeper: Arc<dyn ExpirySweeper>,
    clock: Arc<dyn TimeSource>,
    batch_size: usize,
}

impl Janitor {
    pub fn new(sweeper: Arc<dyn ExpirySweeper>, clock: Arc<dyn TimeSource>, batch_size: usize) -> Self {
        Self {
            sweeper,
            clock,
            batch_size: batch_size.max(1),
        }
    }

    /// Sweep in rounds of `batch_size` rows until a round comes back short.
    /// Returns the number of deleted rows.
    pub async fn run_once(&self) -> Result<u64, StoreError> {
        debug!("Running janitor loop");
        let started = Instant::now();
        counter!(RUN_STARTS).increment(1);

        let now = self.clock.now();
        let mut swept = 0;
        loop {
            let deleted = self.sweeper.sweep_expired(now, self.batch_size).await?;
            swept += deleted;
            counter!(SWEPT_COUNT).increment(deleted);

            if deleted < self.batch_size as u64 {
                break;
            }
        }

        histogram!(RUN_TIME).record(started.elapsed().as_secs_f64());
        counter!(RUN_ENDS).increment(1);
        if swept > 0 {
            info!(swept, "deleted expired events");
        }
        Ok(swept)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use chrono::{DateTime, Duration, TimeZone, Utc};
    use playback_common::event::{EventType, PlaybackEvent};
    use playback_common::store::{EventStore, MemoryEventStore, StoreLimits};
    use playback_common::time::ManualTime;
    use std::sync::Mutex;

    fn start() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap()
    }

    fn event(n: usize, ttl: DateTime<Utc>) -> PlaybackEvent {
        PlaybackEvent {
            event_id: format!("evt-{n}"),
            user_id: "user-1".to_string(),
            book_id: "book-1".to_string(),
            event_type: EventType::EndPlayback,
            timestamp: start(),
            position: None,
            chapter: None,
            metadata: None,
            processed_at: start(),
            ttl,
        }
    }

    #[tokio::test]
    async fn sweeps_every_expired_event_in_rounds() {
        let clock = ManualTime::new(start());
        let store = Arc::new(MemoryEventStore::new(
            StoreLimits::default(),
            Arc::new(clock.clone()),
        ));
        for n in 0..25 {
            store
                .put(&event(n, start() + Duration::seconds(1)))
                .await
                .unwrap();
        }
        store
            .put(&event(99, start() + Duration::days(90)))
            .await
            .unwrap();

        let janitor = Janitor::new(store.clone(), Arc::new(clock.clone()), 10);
        assert_eq!(janitor.run_once().await, Ok(0));

        clock.advance(Duration::seconds(2));
        assert_eq!(janitor.run_once().await, Ok(25));
        assert_eq!(store.len(), 1);
        assert!(store.get("evt-99").await.unwrap().is_some());
    }

    struct FailingSweeper {
        calls: Mutex<u32>,
    }

    #[async_trait]
    impl ExpirySweeper for FailingSweeper {
        async fn sweep_expired(&self, _: DateTime<Utc>, limit: usize) -> Result<u64, StoreError> {
            let mut calls = self.calls.lock().unwrap();
            *calls += 1;
            if *calls == 1 {
                Ok(limit as u64)
            } else {
                Err(StoreError::Unavailable("connection reset".to_string()))
            }
        }
    }

    #[tokio::test]
    async fn surfaces_sweep_errors() {
        let sweeper = Arc::new(FailingSweeper {
            calls: Mutex::new(0),
        });
        let janitor = Janitor::new(sweeper.clone(), Arc::new(ManualTime::new(start())), 5);

        assert!(matches!(
            janitor.run_once().await,
            Err(StoreError::Unavailable(_))
        ));
        assert_eq!(*sweeper.calls.lock().unwrap(), 2);
    }
}
