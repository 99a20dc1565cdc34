//! Per-partition access to the inbound stream.
use std::time::Duration;

use async_trait::async_trait;
use metrics::counter;
use tokio::time::{timeout_at, Instant};

use crate::error::StreamError;
use crate::metrics_consts::RECORDS_RECEIVED;

pub mod kafka;
pub mod memory;

pub use kafka::{KafkaPartitionSource, KafkaStream};
pub use memory::{MemoryPartitionLog, MemoryPartitionSource};

/// One record as read from a partition, before any validation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawRecord {
    pub partition: i32,
    pub offset: i64,
    pub payload: Vec<u8>,
}

/// An ordered source of records for a single partition.
#[async_trait]
pub trait RecordSource: Send {
    fn partition(&self) -> i32;

    /// Suspends until the next record is available. `Ok(None)` means the source
    /// is closed and will never yield again.
    async fn next_record(&mut self) -> Result<Option<RawRecord>, StreamError>;

    /// Persist the read position: `next_offset` is the first offset that has not
    /// been fully resolved.
    async fn commit(&mut self, next_offset: i64) -> Result<(), StreamError>;
}

/// Records accumulated by one `poll_batch` call, in stream order.
#[derive(Debug, Default)]
pub struct Batch {
    pub records: Vec<RawRecord>,
    pub source_closed: bool,
}

impl Batch {
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// The offset to commit once every record of this batch is resolved.
    pub fn next_offset(&self) -> Option<i64> {
        self.records.last().map(|record| record.offset + 1)
    }
}

/// Accumulate records until `batch_size` records were read or `batch_window`
/// elapsed, whichever comes first. An empty batch is a stall, not an error.
pub async fn poll_batch(
    source: &mut dyn RecordSource,
    batch_size: usize,
    batch_window: Duration,
) -> Result<Batch, StreamError> {
    let deadline = Instant::now() + batch_window;
    let mut batch = Batch::default();

    while batch.records.len() < batch_size {
        match timeout_at(deadline, source.next_record()).await {
            Err(_elapsed) => break,
            Ok(Ok(Some(record))) => batch.records.push(record),
            Ok(Ok(None)) => {
                batch.source_closed = true;
                break;
            }
            Ok(Err(error)) => return Err(error),
        }
    }

    if !batch.is_empty() {
        counter!(RECORDS_RECEIVED, "partition" => source.partition().to_string())
            .increment(batch.records.len() as u64);
    }

    Ok(batch)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn stops_at_the_size_ceiling() {
        let log = MemoryPartitionLog::new(0);
        for i in 0..5 {
            log.append(format!("{{\"n\":{i}}}").into_bytes());
        }
        let mut source = log.source();

        let batch = poll_batch(&mut source, 3, Duration::from_secs(60))
            .await
            .unwrap();
        let offsets: Vec<i64> = batch.records.iter().map(|r| r.offset).collect();
        assert_eq!(offsets, vec![0, 1, 2]);
        assert_eq!(batch.next_offset(), Some(3));
        assert!(!batch.source_closed);

        let batch = poll_batch(&mut source, 3, Duration::from_millis(20))
            .await
            .unwrap();
        assert_eq!(batch.len(), 2);
    }

    #[tokio::test]
    async fn stops_when_the_window_elapses() {
        let log = MemoryPartitionLog::new(0);
        log.append(b"{}".to_vec());
        let mut source = log.source();

        let batch = poll_batch(&mut source, 100, Duration::from_millis(20))
            .await
            .unwrap();
        assert_eq!(batch.len(), 1);

        let batch = poll_batch(&mut source, 100, Duration::from_millis(20))
            .await
            .unwrap();
        assert!(batch.is_empty());
        assert_eq!(batch.next_offset(), None);
    }

    #[tokio::test]
    async fn reports_a_closed_source() {
        let log = MemoryPartitionLog::new(0);
        log.append(b"{}".to_vec());
        log.close();
        let mut source = log.source();

        let batch = poll_batch(&mut source, 100, Duration::from_secs(60))
            .await
            .unwrap();
        assert_eq!(batch.len(), 1);
        assert!(batch.source_closed);
    }
}
