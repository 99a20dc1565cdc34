use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use chrono::{DateTime, Utc};
use health::HealthHandle;
use rdkafka::error::KafkaError;
use rdkafka::producer::{DeliveryFuture, FutureProducer, FutureRecord};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{error, info, warn};

use crate::config::KafkaConfig;
use crate::event::PlaybackEvent;
use crate::kafka::{create_kafka_producer, KafkaContext};

/// Whether a failure could have succeeded on a later attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureClass {
    Retryable,
    NonRetryable,
}

impl FailureClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureClass::Retryable => "retryable",
            FailureClass::NonRetryable => "non_retryable",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PayloadEncoding {
    Utf8,
    Base64,
}

/// A record the pipeline gave up on, with everything an operator needs to replay it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeadLetter {
    pub partition: i32,
    pub offset: i64,
    pub payload: String,
    pub payload_encoding: PayloadEncoding,
    pub failure_class: FailureClass,
    pub reason_code: String,
    pub reason: String,
    pub attempts: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event: Option<PlaybackEvent>,
    pub dead_lettered_at: DateTime<Utc>,
}

impl DeadLetter {
    /// Keeps the raw payload verbatim. Payloads that are not valid UTF-8 are base64 encoded.
    pub fn encode_payload(raw: &[u8]) -> (String, PayloadEncoding) {
        match std::str::from_utf8(raw) {
            Ok(text) => (text.to_owned(), PayloadEncoding::Utf8),
            Err(_) => (STANDARD.encode(raw), PayloadEncoding::Base64),
        }
    }

    pub fn raw_payload(&self) -> Result<Vec<u8>, base64::DecodeError> {
        match self.payload_encoding {
            PayloadEncoding::Utf8 => Ok(self.payload.as_bytes().to_vec()),
            PayloadEncoding::Base64 => STANDARD.decode(&self.payload),
        }
    }

    fn key(&self) -> String {
        match &self.event_id {
            Some(event_id) => event_id.clone(),
            None => format!("{}:{}", self.partition, self.offset),
        }
    }
}

#[derive(Error, Debug)]
pub enum DeadLetterError {
    #[error("failed to serialize dead letter: {0}")]
    SerializationError(#[from] serde_json::Error),
    #[error("failed to produce dead letter to kafka: {0}")]
    KafkaProduceError(KafkaError),
    #[error("failed to produce dead letter to kafka (timeout)")]
    KafkaProduceCanceled,
    #[error("dead letter sink is unavailable")]
    Unavailable,
}

/// Append-only destination for dead letters, shared by every partition worker.
/// `send_batch` only returns `Ok` once every entry has been durably accepted.
#[async_trait]
pub trait DeadLetterSink: Send + Sync {
    async fn send_batch(&self, entries: Vec<DeadLetter>) -> Result<(), DeadLetterError>;
}

#[derive(Clone)]
pub struct KafkaDeadLetterSink {
    producer: FutureProducer<KafkaContext>,
    topic: String,
}

impl KafkaDeadLetterSink {
    pub async fn new(
        config: &KafkaConfig,
        liveness: HealthHandle,
    ) -> Result<KafkaDeadLetterSink, KafkaError> {
        info!("connecting to Kafka brokers at {}...", config.kafka_hosts);
        let producer = create_kafka_producer(config, liveness).await?;

        Ok(KafkaDeadLetterSink {
            producer,
            topic: config.kafka_dead_letter_topic.as_str().to_owned(),
        })
    }

    fn kafka_send(&self, entry: &DeadLetter) -> Result<DeliveryFuture, DeadLetterError> {
        let payload = serde_json::to_string(entry)?;
        let key = entry.key();

        match self.producer.send_result(FutureRecord {
            topic: self.topic.as_str(),
            payload: Some(&payload),
            partition: None,
            key: Some(key.as_str()),
            timestamp: None,
            headers: None,
        }) {
            Ok(ack) => Ok(ack),
            Err((e, _)) => {
                error!("failed to produce dead letter: {}", e);
                Err(DeadLetterError::KafkaProduceError(e))
            }
        }
    }
}

#[async_trait]
impl DeadLetterSink for KafkaDeadLetterSink {
    async fn send_batch(&self, entries: Vec<DeadLetter>) -> Result<(), DeadLetterError> {
        // Enqueue sequentially, then wait for every broker ack.
        let mut acks = Vec::with_capacity(entries.len());
        for entry in &entries {
            acks.push(self.kafka_send(entry)?);
        }

        for ack in acks {
            match ack.await {
                Ok(Ok(_)) => {}
                Ok(Err((err, _))) => {
                    error!("failed to produce dead letter to Kafka: {}", err);
                    return Err(DeadLetterError::KafkaProduceError(err));
                }
                Err(_) => {
                    error!("failed to produce dead letter to Kafka before write timeout");
                    return Err(DeadLetterError::KafkaProduceCanceled);
                }
            }
        }

        Ok(())
    }
}

/// Writes dead letters to the log instead of a topic.
#[derive(Clone, Default)]
pub struct LogDeadLetterSink {}

#[async_trait]
impl DeadLetterSink for LogDeadLetterSink {
    async fn send_batch(&self, entries: Vec<DeadLetter>) -> Result<(), DeadLetterError> {
        for entry in entries {
            let serialized = serde_json::to_string(&entry)?;
            warn!(
                partition = entry.partition,
                offset = entry.offset,
                reason_code = %entry.reason_code,
                failure_class = entry.failure_class.as_str(),
                attempts = entry.attempts,
                dead_letter = %serialized,
                "dead-lettered record"
            );
        }
        Ok(())
    }
}

/// Keeps dead letters in memory. Can be switched into a failing mode.
#[derive(Clone, Default)]
pub struct MemoryDeadLetterSink {
    entries: Arc<Mutex<Vec<DeadLetter>>>,
    failing: Arc<Mutex<bool>>,
}

impl MemoryDeadLetterSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn entries(&self) -> Vec<DeadLetter> {
        self.entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    pub fn set_failing(&self, failing: bool) {
        *self
            .failing
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = failing;
    }
}

#[async_trait]
impl DeadLetterSink for MemoryDeadLetterSink {
    async fn send_batch(&self, entries: Vec<DeadLetter>) -> Result<(), DeadLetterError> {
        if *self
            .failing
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
        {
            return Err(DeadLetterError::Unavailable);
        }

        self.entries
            .lock()
            .map_err(|_| DeadLetterError::Unavailable)?
            .extend(entries);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::NonEmptyString;
    use health::HealthRegistry;
    use rdkafka::mocking::MockCluster;
    use rdkafka::producer::DefaultProducerContext;
    use rdkafka::types::{RDKafkaApiKey, RDKafkaRespErr};
    use std::time::Duration;

    fn dead_letter(offset: i64, raw: &[u8]) -> DeadLetter {
        let (payload, payload_encoding) = DeadLetter::encode_payload(raw);
        DeadLetter {
            partition: 0,
            offset,
            payload,
            payload_encoding,
            failure_class: FailureClass::NonRetryable,
            reason_code: "invalid_event_type".to_string(),
            reason: "invalid event_type \"DANCE\"".to_string(),
            attempts: 1,
            event_id: None,
            event: None,
            dead_lettered_at: Utc::now(),
        }
    }

    #[test]
    fn keeps_utf8_payloads_verbatim() {
        let raw = br#"{"event_type":"DANCE"}"#;
        let entry = dead_letter(3, raw);

        assert_eq!(entry.payload_encoding, PayloadEncoding::Utf8);
        assert_eq!(entry.payload, r#"{"event_type":"DANCE"}"#);
        assert_eq!(entry.raw_payload().unwrap(), raw.to_vec());
        assert_eq!(entry.key(), "0:3");
    }

    #[test]
    fn base64_encodes_binary_payloads() {
        let raw = [0xff, 0xfe, 0x00, 0x7b];
        let entry = dead_letter(4, &raw);

        assert_eq!(entry.payload_encoding, PayloadEncoding::Base64);
        assert_eq!(entry.raw_payload().unwrap(), raw.to_vec());

        let json = serde_json::to_value(&entry).unwrap();
        assert_eq!(json["payload_encoding"], "base64");
        assert_eq!(json["failure_class"], "non_retryable");
        assert!(json.get("event").is_none());
    }

    #[tokio::test]
    async fn memory_sink_collects_and_fails_on_demand() {
        let sink = MemoryDeadLetterSink::new();
        sink.send_batch(vec![dead_letter(1, b"{}")]).await.unwrap();

        sink.set_failing(true);
        assert!(matches!(
            sink.send_batch(vec![dead_letter(2, b"{}")]).await,
            Err(DeadLetterError::Unavailable)
        ));

        sink.set_failing(false);
        sink.send_batch(vec![dead_letter(2, b"{}")]).await.unwrap();

        let offsets: Vec<i64> = sink.entries().iter().map(|e| e.offset).collect();
        assert_eq!(offsets, vec![1, 2]);
    }

    async fn start_on_mocked_sink() -> (
        MockCluster<'static, DefaultProducerContext>,
        KafkaDeadLetterSink,
    ) {
        let registry = HealthRegistry::new("liveness");
        let handle = registry.register("rdkafka".to_string(), Duration::from_secs(30));
        let cluster = MockCluster::new(1).expect("failed to create mock brokers");
        let config = KafkaConfig {
            kafka_producer_linger_ms: 0,
            kafka_producer_queue_mib: 50,
            kafka_message_timeout_ms: 500,
            kafka_compression_codec: "none".to_string(),
            kafka_tls: false,
            kafka_hosts: cluster.bootstrap_servers(),
            kafka_consumer_group: "playback-worker".to_string(),
            kafka_consumer_topic: NonEmptyString("playback_events".to_string()),
            kafka_consumer_offset_reset: "earliest".to_string(),
            kafka_dead_letter_topic: NonEmptyString("playback_events_dlq".to_string()),
        };
        let sink = KafkaDeadLetterSink::new(&config, handle)
            .await
            .expect("failed to create sink");
        (cluster, sink)
    }

    #[tokio::test]
    async fn kafka_sink_error_handling() {
        let (cluster, sink) = start_on_mocked_sink().await;

        // Wait for producer to be healthy, to keep kafka_message_timeout_ms short and tests faster
        for _ in 0..20 {
            if sink.send_batch(vec![dead_letter(0, b"{}")]).await.is_ok() {
                break;
            }
        }

        sink.send_batch(vec![dead_letter(1, b"{}"), dead_letter(2, &[0xff])])
            .await
            .expect("failed to send initial dead letters");

        // A rejected delivery must surface, the batch cannot be committed on top of it
        cluster.clear_request_errors(RDKafkaApiKey::Produce);
        let err = [RDKafkaRespErr::RD_KAFKA_RESP_ERR_INVALID_PARTITIONS; 1];
        cluster.request_errors(RDKafkaApiKey::Produce, &err);
        assert!(sink
            .send_batch(vec![dead_letter(3, b"{}"), dead_letter(4, b"{}")])
            .await
            .is_err());

        // Transient errors are retried by the producer
        cluster.clear_request_errors(RDKafkaApiKey::Produce);
        let err = [RDKafkaRespErr::RD_KAFKA_RESP_ERR_BROKER_NOT_AVAILABLE; 2];
        cluster.request_errors(RDKafkaApiKey::Produce, &err);
        sink.send_batch(vec![dead_letter(5, b"{}")])
            .await
            .expect("failed to send dead letters after recovery");
    }
}
