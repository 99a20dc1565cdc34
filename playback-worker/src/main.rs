//! Consume playback events from Kafka, one task per partition, and store them idempotently.
use std::future::ready;
use std::sync::Arc;
use std::time::Duration;

use axum::{routing::get, Router};
use envconfig::Envconfig;
use health::HealthRegistry;
use playback_common::config::init_tracing;
use playback_common::dead_letter::{DeadLetterSink, KafkaDeadLetterSink, LogDeadLetterSink};
use playback_common::metrics::{serve, setup_metrics_routes};
use playback_common::store::PgEventStore;
use playback_common::time::{SystemTime, TimeSource};
use playback_worker::config::Config;
use playback_worker::controller::BisectionController;
use playback_worker::error::WorkerError;
use playback_worker::processor::BatchProcessor;
use playback_worker::stream::KafkaStream;
use playback_worker::worker::PartitionWorker;
use tokio::signal;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{error, info};

async fn shutdown() {
    let mut term = signal::unix::signal(signal::unix::SignalKind::terminate())
        .expect("failed to register SIGTERM handler");

    let mut interrupt = signal::unix::signal(signal::unix::SignalKind::interrupt())
        .expect("failed to register SIGINT handler");

    tokio::select! {
        _ = term.recv() => {},
        _ = interrupt.recv() => {},
    };

    info!("Shutting down gracefully...");
}

pub async fn index() -> &'static str {
    "playback worker"
}

#[tokio::main]
async fn main() -> Result<(), WorkerError> {
    let config = Config::init_from_env().expect("Invalid configuration:");
    init_tracing(config.log_json);

    let liveness = HealthRegistry::new("liveness");
    let clock: Arc<dyn TimeSource> = Arc::new(SystemTime {});

    let store = PgEventStore::new(
        &config.database_url,
        config.max_pg_connections,
        config.store_timeout.0,
        config.store_limits(),
    )
    .await
    .expect("failed to connect to the event store");

    let sink: Arc<dyn DeadLetterSink> = if config.print_dead_letters {
        Arc::new(LogDeadLetterSink {})
    } else {
        let producer_liveness =
            liveness.register("dead_letter_producer".to_string(), Duration::from_secs(30));
        Arc::new(
            KafkaDeadLetterSink::new(&config.kafka, producer_liveness)
                .await
                .expect("failed to create dead letter producer"),
        )
    };

    let consumer_liveness = liveness.register("consumer".to_string(), Duration::from_secs(30));
    let stream = KafkaStream::new(&config.kafka, config.partition_count, consumer_liveness)
        .expect("failed to create kafka consumer");
    let _main_queue = stream.drive_main_queue();

    let processor = BatchProcessor::new(
        Arc::new(store),
        clock.clone(),
        config.retention(),
        config.store_timeout.0,
    );
    let controller = Arc::new(BisectionController::new(
        processor,
        sink,
        config.retry_policy.provide(),
        config.max_retry_attempts,
        clock,
    ));

    // Workers report after every poll, processor round and dead-letter flush
    // attempt. The slowest of those is one backoff followed by a round where
    // every write times out.
    let store_round = u32::try_from(config.batch_size)
        .ok()
        .and_then(|size| config.store_timeout.0.checked_mul(size))
        .unwrap_or(Duration::MAX);
    let worker_deadline = config
        .batch_window
        .0
        .max(store_round)
        .max(Duration::from_millis(u64::from(
            config.kafka.kafka_message_timeout_ms,
        )))
        .saturating_add(config.retry_policy.maximum_interval.0)
        .saturating_add(Duration::from_secs(30))
        .min(Duration::from_secs(24 * 60 * 60));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut workers = JoinSet::new();
    for partition in 0..config.partition_count {
        let source = stream.partition_source(partition)?;
        let worker = PartitionWorker::new(
            Box::new(source),
            controller.clone(),
            config.batch_size,
            config.batch_window.0,
            liveness.register(format!("partition_{partition}"), worker_deadline),
        );
        workers.spawn(worker.run(shutdown_rx.clone()));
    }

    let status = liveness.clone();
    let router = Router::new()
        .route("/", get(index))
        .route("/_readiness", get(index))
        .route("/_liveness", get(move || ready(status.get_status())));
    let router = setup_metrics_routes(router, "playback-worker")
        .expect("failed to install metrics recorder");
    let bind = config.bind();
    tokio::task::spawn(async move {
        serve(router, &bind)
            .await
            .expect("failed to start serving metrics");
    });

    let shutdown_signal = shutdown();
    tokio::pin!(shutdown_signal);
    let mut shutting_down = false;
    let mut outcome = Ok(());

    loop {
        tokio::select! {
            _ = &mut shutdown_signal, if !shutting_down => {
                shutting_down = true;
                _ = shutdown_tx.send(true);
            }
            joined = workers.join_next() => match joined {
                None => break,
                Some(Ok(Ok(()))) => {}
                Some(Ok(Err(e))) => {
                    error!("stopping after partition worker failure: {e}");
                    outcome = outcome.and(Err(e));
                    shutting_down = true;
                    _ = shutdown_tx.send(true);
                }
                Some(Err(e)) => {
                    error!("stopping after partition worker task failure: {e}");
                    outcome = outcome.and(Err(WorkerError::from(e)));
                    shutting_down = true;
                    _ = shutdown_tx.send(true);
                }
            }
        }
    }

    outcome
}
