use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use tokio::sync::Notify;

use super::{RawRecord, RecordSource};
use crate::error::StreamError;

#[derive(Default)]
struct LogState {
    records: Vec<Vec<u8>>,
    committed: i64,
    commits: Vec<i64>,
    closed: bool,
}

/// An in-process, append-only partition with a committed offset.
///
/// Every `source()` starts reading at the committed offset, the way a consumer
/// restarted after a crash would.
#[derive(Clone)]
pub struct MemoryPartitionLog {
    partition: i32,
    state: Arc<Mutex<LogState>>,
    appended: Arc<Notify>,
}

impl MemoryPartitionLog {
    pub fn new(partition: i32) -> Self {
        Self {
            partition,
            state: Default::default(),
            appended: Arc::new(Notify::new()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, LogState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Returns the offset of the appended record.
    pub fn append(&self, payload: Vec<u8>) -> i64 {
        let offset = {
            let mut state = self.lock();
            state.records.push(payload);
            state.records.len() as i64 - 1
        };
        self.appended.notify_waiters();
        offset
    }

    /// No further records will be appended. Sources drain what is left, then end.
    pub fn close(&self) {
        self.lock().closed = true;
        self.appended.notify_waiters();
    }

    pub fn committed_offset(&self) -> i64 {
        self.lock().committed
    }

    /// Every offset committed so far, in commit order.
    pub fn commits(&self) -> Vec<i64> {
        self.lock().commits.clone()
    }

    pub fn len(&self) -> usize {
        self.lock().records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn source(&self) -> MemoryPartitionSource {
        MemoryPartitionSource {
            position: self.committed_offset(),
            log: self.clone(),
        }
    }
}

pub struct MemoryPartitionSource {
    log: MemoryPartitionLog,
    position: i64,
}

#[async_trait]
impl RecordSource for MemoryPartitionSource {
    fn partition(&self) -> i32 {
        self.log.partition
    }

    async fn next_record(&mut self) -> Result<Option<RawRecord>, StreamError> {
        loop {
            // Registered before checking, so an append in between is not missed.
            let appended = self.log.appended.notified();
            {
                let state = self.log.lock();
                if let Some(payload) = usize::try_from(self.position)
                    .ok()
                    .and_then(|position| state.records.get(position))
                {
                    let record = RawRecord {
                        partition: self.log.partition,
                        offset: self.position,
                        payload: payload.clone(),
                    };
                    self.position += 1;
                    return Ok(Some(record));
                }
                if state.closed {
                    return Ok(None);
                }
            }
            appended.await;
        }
    }

    async fn commit(&mut self, next_offset: i64) -> Result<(), StreamError> {
        let mut state = self.log.lock();
        if next_offset < state.committed {
            return Err(StreamError::OffsetRegression {
                partition: self.log.partition,
                current: state.committed,
                requested: next_offset,
            });
        }
        state.committed = next_offset;
        state.commits.push(next_offset);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn a_new_source_resumes_from_the_committed_offset() {
        let log = MemoryPartitionLog::new(2);
        for payload in ["a", "b", "c"] {
            log.append(payload.as_bytes().to_vec());
        }

        let mut source = log.source();
        let first = source.next_record().await.unwrap().unwrap();
        assert_eq!((first.partition, first.offset), (2, 0));
        source.commit(1).await.unwrap();
        let second = source.next_record().await.unwrap().unwrap();
        assert_eq!(second.offset, 1);

        // Offset 1 was read but never committed, so it is delivered again.
        let mut restarted = log.source();
        let redelivered = restarted.next_record().await.unwrap().unwrap();
        assert_eq!(redelivered.offset, 1);
        assert_eq!(redelivered.payload, b"b".to_vec());
    }

    #[tokio::test]
    async fn wakes_up_on_append() {
        let log = MemoryPartitionLog::new(0);
        let mut source = log.source();

        let writer = log.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            writer.append(b"late".to_vec())
        });

        let record = tokio::time::timeout(Duration::from_secs(5), source.next_record())
            .await
            .expect("woken by append")
            .unwrap()
            .unwrap();
        assert_eq!(record.payload, b"late".to_vec());
        assert_eq!(handle.await.unwrap(), 0);
    }

    #[tokio::test]
    async fn refuses_to_commit_backwards() {
        let log = MemoryPartitionLog::new(0);
        let mut source = log.source();
        source.commit(5).await.unwrap();

        assert!(matches!(
            source.commit(3).await,
            Err(StreamError::OffsetRegression {
                current: 5,
                requested: 3,
                ..
            })
        ));
        assert_eq!(log.committed_offset(), 5);
        assert_eq!(log.commits(), vec![5]);
    }
}
