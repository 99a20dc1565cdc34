//! Validate and store one (sub)batch of records, classifying every outcome.
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use metrics::{counter, histogram};
use playback_common::dead_letter::FailureClass;
use playback_common::event::PlaybackEvent;
use playback_common::store::{Ack, EventStore, FailureKind, StoreError};
use playback_common::time::TimeSource;
use playback_common::validation::{validate, RejectionReason};
use tokio::time::timeout;
use tracing::{debug, warn};

use crate::error::ProcessError;
use crate::metrics_consts::{EVENTS_STORED, RECORDS_REJECTED, STORE_ERRORS, STORE_PUT_LATENCY};
use crate::stream::RawRecord;

#[derive(Debug, Clone, PartialEq)]
pub enum FailureReason {
    Rejected(RejectionReason),
    Store(StoreError),
    /// The write was not attempted because the store was throttling this subset.
    Deferred,
}

impl FailureReason {
    pub fn class(&self) -> FailureClass {
        match self {
            FailureReason::Rejected(_) => FailureClass::NonRetryable,
            FailureReason::Store(error) => match error.kind() {
                FailureKind::Transient => FailureClass::Retryable,
                FailureKind::Permanent | FailureKind::Fatal => FailureClass::NonRetryable,
            },
            FailureReason::Deferred => FailureClass::Retryable,
        }
    }

    pub fn reason_code(&self) -> &'static str {
        match self {
            FailureReason::Rejected(rejection) => rejection.reason_code(),
            FailureReason::Store(error) => error.reason_code(),
            FailureReason::Deferred => "deferred",
        }
    }

}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            FailureReason::Rejected(rejection) => write!(f, "{rejection}"),
            FailureReason::Store(error) => write!(f, "{error}"),
            FailureReason::Deferred => f.write_str("write deferred while the store was throttling"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RecordFailure {
    pub reason: FailureReason,
    /// The normalized event, when validation succeeded.
    pub event: Option<PlaybackEvent>,
}

impl RecordFailure {
    pub fn class(&self) -> FailureClass {
        self.reason.class()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredRecord {
    pub event_id: String,
    pub ack: Ack,
}

/// Outcomes of one `process` call, keyed by stream offset.
#[derive(Debug, Default)]
pub struct BatchResult {
    pub succeeded: BTreeMap<i64, StoredRecord>,
    pub failed: BTreeMap<i64, RecordFailure>,
}

impl BatchResult {
    pub fn retryable(&self) -> impl Iterator<Item = i64> + '_ {
        self.failed
            .iter()
            .filter(|(_, failure)| failure.class() == FailureClass::Retryable)
            .map(|(offset, _)| *offset)
    }
}

pub struct BatchProcessor {
    store: Arc<dyn EventStore>,
    clock: Arc<dyn TimeSource>,
    retention: chrono::Duration,
    store_timeout: Duration,
}

impl BatchProcessor {
    pub fn new(
        store: Arc<dyn EventStore>,
        clock: Arc<dyn TimeSource>,
        retention: chrono::Duration,
        store_timeout: Duration,
    ) -> Self {
        Self {
            store,
            clock,
            retention,
            store_timeout,
        }
    }

    /// Validate every record and write the valid ones, in the given order.
    ///
    /// Never retries. Once the store answers `Throttled`, the remaining valid
    /// records of this call are not written and come back as `Deferred`.
    /// Returns an error only when the store connection itself is gone.
    pub async fn process(&self, records: &[&RawRecord]) -> Result<BatchResult, ProcessError> {
        let ingested_at = self.clock.now();
        let mut result = BatchResult::default();
        let mut throttled = false;

        for record in records {
            let event = match validate(&record.payload, ingested_at, self.retention) {
                Ok(event) => event,
                Err(rejection) => {
                    debug!(
                        partition = record.partition,
                        offset = record.offset,
                        reason_code = rejection.reason_code(),
                        "rejected record: {rejection}"
                    );
                    counter!(RECORDS_REJECTED, "reason" => rejection.reason_code()).increment(1);
                    result.failed.insert(
                        record.offset,
                        RecordFailure {
                            reason: FailureReason::Rejected(rejection),
                            event: None,
                        },
                    );
                    continue;
                }
            };

            if throttled {
                result.failed.insert(
                    record.offset,
                    RecordFailure {
                        reason: FailureReason::Deferred,
                        event: Some(event),
                    },
                );
                continue;
            }

            match self.put(&event).await {
                Ok(ack) => {
                    counter!(EVENTS_STORED, "ack" => ack.as_str()).increment(1);
                    result.succeeded.insert(
                        record.offset,
                        StoredRecord {
                            event_id: event.event_id,
                            ack,
                        },
                    );
                }
                Err(error) => {
                    counter!(
                        STORE_ERRORS,
                        "kind" => error.kind().as_str(),
                        "reason" => error.reason_code()
                    )
                    .increment(1);

                    if error.kind() == FailureKind::Fatal {
                        return Err(ProcessError::StoreConnectionLost(error));
                    }

                    warn!(
                        partition = record.partition,
                        offset = record.offset,
                        event_id = %event.event_id,
                        kind = error.kind().as_str(),
                        "failed to store event: {error}"
                    );
                    throttled = matches!(error, StoreError::Throttled(_));
                    result.failed.insert(
                        record.offset,
                        RecordFailure {
                            reason: FailureReason::Store(error),
                            event: Some(event),
                        },
                    );
                }
            }
        }

        Ok(result)
    }

    async fn put(&self, event: &PlaybackEvent) -> Result<Ack, StoreError> {
        let started = Instant::now();
        let result = match timeout(self.store_timeout, self.store.put(event)).await {
            Ok(result) => result,
            Err(_) => Err(StoreError::Timeout(format!(
                "no answer within {:?}",
                self.store_timeout
            ))),
        };
        histogram!(STORE_PUT_LATENCY).record(started.elapsed().as_secs_f64());
        result
    }
}
