use crate::error::StreamError;

/// The read position of one partition, owned by its worker.
///
/// Only moves forward, and only once a whole batch is resolved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionCursor {
    partition: i32,
    next_offset: Option<i64>,
}

impl PartitionCursor {
    pub fn new(partition: i32) -> Self {
        Self {
            partition,
            next_offset: None,
        }
    }

    pub fn partition(&self) -> i32 {
        self.partition
    }

    /// The first offset not yet resolved, `None` before the first batch.
    pub fn next_offset(&self) -> Option<i64> {
        self.next_offset
    }

    pub fn advance_to(&mut self, next_offset: i64) -> Result<(), StreamError> {
        if let Some(current) = self.next_offset {
            if next_offset < current {
                return Err(StreamError::OffsetRegression {
                    partition: self.partition,
                    current,
                    requested: next_offset,
                });
            }
        }
        self.next_offset = Some(next_offset);
        Ok(())
    }
}
