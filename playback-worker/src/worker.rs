use std::sync::Arc;
use std::time::Duration;

use health::HealthHandle;
use metrics::gauge;
use tokio::sync::watch;
use tracing::{debug, error, info};

use crate::controller::{BisectionController, Resolution};
use crate::cursor::PartitionCursor;
use crate::error::WorkerError;
use crate::metrics_consts::COMMITTED_OFFSET;
use crate::stream::{poll_batch, Batch, RecordSource};

/// What a single poll-and-resolve step did.
#[derive(Debug, PartialEq, Eq)]
pub struct Step {
    /// `None` when the poll came back empty.
    pub resolution: Option<Resolution>,
    pub source_closed: bool,
}

/// Consumes one partition: poll a batch, resolve it, then commit past it.
///
/// Nothing is committed for a batch that did not fully resolve, so a crash
/// redelivers at most the batch in flight.
pub struct PartitionWorker {
    source: Box<dyn RecordSource>,
    cursor: PartitionCursor,
    controller: Arc<BisectionController>,
    batch_size: usize,
    batch_window: Duration,
    liveness: HealthHandle,
}

impl PartitionWorker {
    pub fn new(
        source: Box<dyn RecordSource>,
        controller: Arc<BisectionController>,
        batch_size: usize,
        batch_window: Duration,
        liveness: HealthHandle,
    ) -> Self {
        let partition = source.partition();
        Self {
            source,
            cursor: PartitionCursor::new(partition),
            controller,
            batch_size: batch_size.max(1),
            batch_window,
            liveness,
        }
    }

    pub fn cursor(&self) -> &PartitionCursor {
        &self.cursor
    }

    pub async fn poll(&mut self) -> Result<Batch, WorkerError> {
        Ok(poll_batch(self.source.as_mut(), self.batch_size, self.batch_window).await?)
    }

    /// Resolve `batch` and commit past it. An empty batch is a no-op.
    pub async fn process_batch(&mut self, batch: &Batch) -> Result<Option<Resolution>, WorkerError> {
        let Some(next_offset) = batch.next_offset() else {
            return Ok(None);
        };

        let resolution = self
            .controller
            .resolve(&batch.records, &self.liveness)
            .await?;

        self.cursor.advance_to(next_offset)?;
        self.source.commit(next_offset).await?;
        gauge!(COMMITTED_OFFSET, "partition" => self.cursor.partition().to_string())
            .set(next_offset as f64);

        info!(
            partition = self.cursor.partition(),
            first_offset = batch.records.first().map(|record| record.offset),
            next_offset,
            batch_size = batch.len(),
            stored = resolution.stored,
            dead_lettered = resolution.dead_lettered,
            rounds = resolution.rounds,
            max_depth = resolution.max_depth,
            "resolved batch"
        );

        Ok(Some(resolution))
    }

    pub async fn run_once(&mut self) -> Result<Step, WorkerError> {
        let batch = self.poll().await?;
        self.liveness.report_healthy();

        if batch.is_empty() {
            debug!(partition = self.cursor.partition(), "no new records");
        }
        let resolution = self.process_batch(&batch).await?;
        self.liveness.report_healthy();

        Ok(Step {
            resolution,
            source_closed: batch.source_closed,
        })
    }

    /// Run until the source closes, shutdown is requested or an unrecoverable
    /// error occurs. Shutdown is only observed between batches.
    pub async fn run(mut self, shutdown: watch::Receiver<bool>) -> Result<(), WorkerError> {
        let partition = self.cursor.partition();
        info!(partition, "starting partition worker");

        loop {
            if *shutdown.borrow() {
                info!(partition, "partition worker shutting down");
                return Ok(());
            }

            match self.run_once().await {
                Ok(Step {
                    source_closed: true,
                    ..
                }) => {
                    info!(partition, "partition source closed");
                    return Ok(());
                }
                Ok(_) => {}
                Err(e) => {
                    error!(partition, "partition worker failed: {e}");
                    return Err(e);
                }
            }
        }
    }
}
