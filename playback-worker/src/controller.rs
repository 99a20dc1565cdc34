//! Drive a batch to a terminal state: every record stored or dead-lettered.
//!
//! Retryable failures are bisected. The failing subset is split in half and
//! each half is processed again, left half first, after a backoff that grows
//! with the bisection depth. A subset at depth `d` is on its `d + 1`th attempt,
//! so once a lineage reaches `max_attempts` its remaining retryable records are
//! dead-lettered. A batch therefore needs at most `2^max_attempts - 1` rounds,
//! however the failures are spread, and a single poison record is isolated in
//! `max_attempts` rounds.
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use health::HealthHandle;
use metrics::{counter, histogram};
use playback_common::dead_letter::{DeadLetter, DeadLetterSink, FailureClass};
use playback_common::retry::RetryPolicy;
use playback_common::time::TimeSource;
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

use crate::error::ResolveError;
use crate::metrics_consts::{
    BATCH_RESOLUTION_LATENCY, BATCH_ROUNDS, BATCH_SIZE, BISECTION_DEPTH, RECORDS_DEAD_LETTERED,
};
use crate::processor::{BatchProcessor, RecordFailure};
use crate::stream::RawRecord;

pub const RETRIES_EXHAUSTED: &str = "retries_exhausted";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchState {
    Pending,
    Processing,
    PartiallyFailed,
    Bisecting,
    Resolved,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resolution {
    pub stored: usize,
    pub dead_lettered: usize,
    /// Number of processor calls, the first one included.
    pub rounds: u32,
    pub max_depth: u32,
    pub state: BatchState,
}

/// A subset of the batch, as indices into it, and its bisection depth. Records
/// in the subset have been processed `depth` times already.
struct WorkItem {
    indices: Vec<usize>,
    depth: u32,
}

pub struct BisectionController {
    processor: BatchProcessor,
    sink: Arc<dyn DeadLetterSink>,
    retry_policy: RetryPolicy,
    max_attempts: u32,
    clock: Arc<dyn TimeSource>,
}

impl BisectionController {
    pub fn new(
        processor: BatchProcessor,
        sink: Arc<dyn DeadLetterSink>,
        retry_policy: RetryPolicy,
        max_attempts: u32,
        clock: Arc<dyn TimeSource>,
    ) -> Self {
        Self {
            processor,
            sink,
            retry_policy,
            max_attempts: max_attempts.max(1),
            clock,
        }
    }

    /// Upper bound on processor rounds for one batch: a full binary tree of
    /// `max_attempts` levels.
    pub fn max_rounds(&self) -> u32 {
        1u32.checked_shl(self.max_attempts)
            .map_or(u32::MAX, |rounds| rounds - 1)
    }

    /// Resolve `records`, which must come from one partition and be in stream order.
    ///
    /// Only returns `Ok` once every dead letter has been accepted by the sink.
    /// `liveness` is reported after every round, since a throttled batch can
    /// spend several backoffs here.
    pub async fn resolve(
        &self,
        records: &[RawRecord],
        liveness: &HealthHandle,
    ) -> Result<Resolution, ResolveError> {
        let started = Instant::now();
        let mut state = BatchState::Pending;
        let mut resolution = Resolution {
            stored: 0,
            dead_lettered: 0,
            rounds: 0,
            max_depth: 0,
            state,
        };

        let index_by_offset: HashMap<i64, usize> = records
            .iter()
            .enumerate()
            .map(|(index, record)| (record.offset, index))
            .collect();
        let mut dead_letters = Vec::new();

        let mut stack = vec![WorkItem {
            indices: (0..records.len()).collect(),
            depth: 0,
        }];

        while let Some(WorkItem { indices, depth }) = stack.pop() {
            if depth > 0 {
                transition(&mut state, BatchState::Bisecting);
                sleep(self.retry_policy.retry_interval(depth)).await;
            } else {
                transition(&mut state, BatchState::Processing);
            }

            let attempt = depth + 1;
            resolution.rounds += 1;
            resolution.max_depth = resolution.max_depth.max(depth);

            let subset: Vec<&RawRecord> = indices.iter().map(|&index| &records[index]).collect();
            let result = self.processor.process(&subset).await?;
            liveness.report_healthy();
            resolution.stored += result.succeeded.len();

            let mut retry = Vec::new();
            for (offset, failure) in result.failed {
                let Some(&index) = index_by_offset.get(&offset) else {
                    continue;
                };

                match failure.class() {
                    FailureClass::NonRetryable => {
                        dead_letters.push(self.dead_letter(
                            &records[index],
                            &failure,
                            failure.reason.reason_code(),
                            failure.reason.to_string(),
                            attempt,
                        ));
                    }
                    FailureClass::Retryable if attempt >= self.max_attempts => {
                        warn!(
                            partition = records[index].partition,
                            offset,
                            attempts = attempt,
                            "retries exhausted: {}",
                            failure.reason
                        );
                        dead_letters.push(self.dead_letter(
                            &records[index],
                            &failure,
                            RETRIES_EXHAUSTED,
                            format!(
                                "retries exhausted after {attempt} attempts: {}",
                                failure.reason
                            ),
                            attempt,
                        ));
                    }
                    FailureClass::Retryable => retry.push(index),
                }
            }

            if retry.is_empty() {
                continue;
            }

            transition(&mut state, BatchState::PartiallyFailed);
            debug!(retryable = retry.len(), depth, "bisecting failed subset");
            if retry.len() > 1 {
                let right = retry.split_off(retry.len() / 2);
                stack.push(WorkItem {
                    indices: right,
                    depth: attempt,
                });
            }
            stack.push(WorkItem {
                indices: retry,
                depth: attempt,
            });
        }

        resolution.dead_lettered = dead_letters.len();
        if !dead_letters.is_empty() {
            self.flush_dead_letters(dead_letters, liveness).await?;
        }

        transition(&mut state, BatchState::Resolved);
        resolution.state = state;

        histogram!(BATCH_SIZE).record(records.len() as f64);
        histogram!(BATCH_ROUNDS).record(f64::from(resolution.rounds));
        histogram!(BISECTION_DEPTH).record(f64::from(resolution.max_depth));
        histogram!(BATCH_RESOLUTION_LATENCY).record(started.elapsed().as_secs_f64());

        Ok(resolution)
    }

    fn dead_letter(
        &self,
        record: &RawRecord,
        failure: &RecordFailure,
        reason_code: &str,
        reason: String,
        attempts: u32,
    ) -> DeadLetter {
        let (payload, payload_encoding) = DeadLetter::encode_payload(&record.payload);
        DeadLetter {
            partition: record.partition,
            offset: record.offset,
            payload,
            payload_encoding,
            failure_class: failure.class(),
            reason_code: reason_code.to_owned(),
            reason,
            attempts,
            event_id: failure.event.as_ref().map(|event| event.event_id.clone()),
            event: failure.event.clone(),
            dead_lettered_at: self.clock.now(),
        }
    }

    /// Retried with the same backoff as records. Giving up leaves the batch uncommitted.
    async fn flush_dead_letters(
        &self,
        dead_letters: Vec<DeadLetter>,
        liveness: &HealthHandle,
    ) -> Result<(), ResolveError> {
        let mut attempt = 1;
        loop {
            let sent = self.sink.send_batch(dead_letters.clone()).await;
            liveness.report_healthy();
            match sent {
                Ok(()) => break,
                Err(e) if attempt < self.max_attempts => {
                    warn!(attempt, "failed to flush dead letters, retrying: {e}");
                    sleep(self.retry_policy.retry_interval(attempt)).await;
                    attempt += 1;
                }
                Err(e) => {
                    error!(attempt, "failed to flush dead letters: {e}");
                    return Err(e.into());
                }
            }
        }

        for entry in &dead_letters {
            counter!(
                RECORDS_DEAD_LETTERED,
                "reason" => entry.reason_code.clone(),
                "class" => entry.failure_class.as_str()
            )
            .increment(1);
        }
        info!(count = dead_letters.len(), "dead-lettered records");
        Ok(())
    }
}

fn transition(state: &mut BatchState, next: BatchState) {
    if *state != next {
        debug!(from = ?*state, to = ?next, "batch state");
        *state = next;
    }
}
