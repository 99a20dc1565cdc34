use playback_common::dead_letter::DeadLetterError;
use playback_common::store::StoreError;
use rdkafka::error::KafkaError;
use thiserror::Error;

/// Errors reading from or committing to a partition of the inbound stream.
#[derive(Error, Debug)]
pub enum StreamError {
    #[error("kafka error: {0}")]
    Kafka(#[from] KafkaError),
    #[error("partition {0} is not assigned to this consumer")]
    PartitionNotAssigned(i32),
    #[error("refusing to move partition {partition} back from offset {current} to {requested}")]
    OffsetRegression {
        partition: i32,
        current: i64,
        requested: i64,
    },
}

/// Errors that abort processing of a batch. Per-record failures are outcomes, not errors.
#[derive(Error, Debug)]
pub enum ProcessError {
    #[error("lost the store connection: {0}")]
    StoreConnectionLost(StoreError),
}

#[derive(Error, Debug)]
pub enum ResolveError {
    #[error(transparent)]
    Process(#[from] ProcessError),
    #[error("failed to flush dead letters: {0}")]
    DeadLetter(#[from] DeadLetterError),
}

/// Errors that terminate a partition worker.
#[derive(Error, Debug)]
pub enum WorkerError {
    #[error("stream error: {0}")]
    Stream(#[from] StreamError),
    #[error("failed to resolve batch: {0}")]
    Resolve(#[from] ResolveError),
    #[error("partition worker task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}
