use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use health::HealthHandle;
use playback_common::config::KafkaConfig;
use playback_common::kafka::{create_kafka_consumer, KafkaContext};
use rdkafka::consumer::stream_consumer::StreamPartitionQueue;
use rdkafka::consumer::{CommitMode, Consumer, StreamConsumer};
use rdkafka::error::{KafkaError, RDKafkaErrorCode};
use rdkafka::{Message, Offset, TopicPartitionList};
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{error, info, warn};

use super::{RawRecord, RecordSource};
use crate::error::StreamError;
use crate::metrics_consts::STREAM_ERRORS;

/// The inbound topic with partitions `0..partition_count` manually assigned to
/// this process, each read through its own partition queue.
pub struct KafkaStream {
    consumer: Arc<StreamConsumer<KafkaContext>>,
    topic: String,
}

impl KafkaStream {
    pub fn new(
        config: &KafkaConfig,
        partition_count: i32,
        liveness: HealthHandle,
    ) -> Result<Self, KafkaError> {
        let consumer = Arc::new(create_kafka_consumer(config, liveness)?);
        let topic = config.kafka_consumer_topic.as_str().to_owned();

        let mut assignment = TopicPartitionList::new();
        for partition in 0..partition_count {
            assignment.add_partition_offset(&topic, partition, Offset::Stored)?;
        }
        consumer.assign(&assignment)?;
        info!(topic = %topic, partition_count, "assigned partitions");

        Ok(Self { consumer, topic })
    }

    /// Must be called after `new`, assigning again deactivates existing queues.
    pub fn partition_source(&self, partition: i32) -> Result<KafkaPartitionSource, StreamError> {
        let queue = self
            .consumer
            .split_partition_queue(&self.topic, partition)
            .ok_or(StreamError::PartitionNotAssigned(partition))?;

        Ok(KafkaPartitionSource {
            consumer: self.consumer.clone(),
            queue,
            topic: self.topic.clone(),
            partition,
        })
    }

    /// Poll the main queue so rebalance and error callbacks are served. Messages
    /// of split partitions never show up here.
    pub fn drive_main_queue(&self) -> JoinHandle<()> {
        let consumer = self.consumer.clone();
        tokio::spawn(async move {
            loop {
                match consumer.recv().await {
                    Ok(message) => warn!(
                        partition = message.partition(),
                        offset = message.offset(),
                        "unexpected message on the main consumer queue"
                    ),
                    Err(e) => error!("kafka consumer error on main queue: {e}"),
                }
            }
        })
    }
}

pub struct KafkaPartitionSource {
    consumer: Arc<StreamConsumer<KafkaContext>>,
    queue: StreamPartitionQueue<KafkaContext>,
    topic: String,
    partition: i32,
}

/// Returns the error back if the consumer cannot recover from it.
async fn handle_kafka_error(e: KafkaError, consecutive: u64) -> Option<KafkaError> {
    match &e {
        KafkaError::MessageConsumption(code) => {
            match code {
                RDKafkaErrorCode::PartitionEOF => {
                    metrics::counter!(STREAM_ERRORS, &[("level", "info"), ("error", "partition_eof")])
                        .increment(1);
                }
                RDKafkaErrorCode::OperationTimedOut => {
                    metrics::counter!(STREAM_ERRORS, &[("level", "info"), ("error", "op_timed_out")])
                        .increment(1);
                }
                RDKafkaErrorCode::OffsetOutOfRange => {
                    // "auto.offset.reset" will trigger a seek to head or tail
                    warn!("offset out of range, seeking to the configured offset reset policy");
                    metrics::counter!(
                        STREAM_ERRORS,
                        &[("level", "info"), ("error", "offset_out_of_range")]
                    )
                    .increment(1);
                    sleep(Duration::from_millis(500)).await;
                }
                _ => {
                    warn!("kafka consumer error: {code:?}");
                    metrics::counter!(STREAM_ERRORS, &[("level", "warn"), ("error", "consumer")])
                        .increment(1);
                    sleep(Duration::from_millis(100 * consecutive.min(10))).await;
                }
            }
            None
        }
        KafkaError::MessageConsumptionFatal(code) => {
            error!("fatal kafka consumer error: {code:?}");
            metrics::counter!(STREAM_ERRORS, &[("level", "fatal"), ("error", "consumer")])
                .increment(1);
            Some(e)
        }
        _ => {
            error!("unexpected kafka error: {e}");
            metrics::counter!(STREAM_ERRORS, &[("level", "error"), ("error", "other")])
                .increment(1);
            Some(e)
        }
    }
}

#[async_trait]
impl RecordSource for KafkaPartitionSource {
    fn partition(&self) -> i32 {
        self.partition
    }

    async fn next_record(&mut self) -> Result<Option<RawRecord>, StreamError> {
        let mut consecutive = 0;
        loop {
            match self.queue.recv().await {
                Ok(message) => {
                    return Ok(Some(RawRecord {
                        partition: message.partition(),
                        offset: message.offset(),
                        payload: message.payload().unwrap_or_default().to_vec(),
                    }))
                }
                Err(e) => {
                    consecutive += 1;
                    if let Some(fatal) = handle_kafka_error(e, consecutive).await {
                        return Err(StreamError::Kafka(fatal));
                    }
                }
            }
        }
    }

    async fn commit(&mut self, next_offset: i64) -> Result<(), StreamError> {
        let mut offsets = TopicPartitionList::new();
        offsets.add_partition_offset(&self.topic, self.partition, Offset::Offset(next_offset))?;
        self.consumer.commit(&offsets, CommitMode::Async)?;
        Ok(())
    }
}
