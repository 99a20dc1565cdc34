use std::str::FromStr;
use std::time;

use envconfig::Envconfig;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Clone, Copy)]
pub struct EnvMsDuration(pub time::Duration);

#[derive(Debug, PartialEq, Eq)]
pub struct ParseEnvMsDurationError;

impl FromStr for EnvMsDuration {
    type Err = ParseEnvMsDurationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let ms = s.parse::<u64>().map_err(|_| ParseEnvMsDurationError)?;

        Ok(EnvMsDuration(time::Duration::from_millis(ms)))
    }
}

#[derive(Debug, Clone)]
pub struct NonEmptyString(pub String);

impl NonEmptyString {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

#[derive(Debug, PartialEq, Eq)]
pub struct StringIsEmptyError;

impl FromStr for NonEmptyString {
    type Err = StringIsEmptyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() {
            Err(StringIsEmptyError)
        } else {
            Ok(NonEmptyString(s.to_owned()))
        }
    }
}

#[derive(Envconfig, Clone)]
pub struct KafkaConfig {
    #[envconfig(default = "20")]
    pub kafka_producer_linger_ms: u32, // Maximum time between producer batches during low traffic

    #[envconfig(default = "400")]
    pub kafka_producer_queue_mib: u32, // Size of the in-memory producer queue in mebibytes

    #[envconfig(default = "20000")]
    pub kafka_message_timeout_ms: u32, // Time before we stop retrying producing a message: 20 seconds

    #[envconfig(default = "none")]
    pub kafka_compression_codec: String, // none, gzip, snappy, lz4, zstd

    #[envconfig(default = "false")]
    pub kafka_tls: bool,

    #[envconfig(default = "localhost:9092")]
    pub kafka_hosts: String,

    #[envconfig(default = "playback-worker")]
    pub kafka_consumer_group: String,

    #[envconfig(default = "playback_events")]
    pub kafka_consumer_topic: NonEmptyString,

    // Only used when a partition has no committed offset yet.
    #[envconfig(default = "earliest")]
    pub kafka_consumer_offset_reset: String, // earliest, latest

    #[envconfig(default = "playback_events_dlq")]
    pub kafka_dead_letter_topic: NonEmptyString,
}

/// Install the global tracing subscriber. JSON lines by default, `RUST_LOG` filters.
pub fn init_tracing(log_json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);

    if log_json {
        builder.json().flatten_event(true).init();
    } else {
        builder.init();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_millisecond_durations() {
        let duration: EnvMsDuration = "1500".parse().expect("valid duration");
        assert_eq!(duration.0, time::Duration::from_millis(1500));

        assert_eq!(
            "1.5s".parse::<EnvMsDuration>().unwrap_err(),
            ParseEnvMsDurationError
        );
    }

    #[test]
    fn rejects_empty_strings() {
        assert_eq!(
            "".parse::<NonEmptyString>().unwrap_err(),
            StringIsEmptyError
        );
        assert_eq!(
            "playback_events"
                .parse::<NonEmptyString>()
                .expect("non-empty")
                .as_str(),
            "playback_events"
        );
    }
}
