//! Batch coordinator: runs record pipelines under a bounded worker pool.
//!
//! Every input record yields exactly one [`RecordOutcome`]. A failing record
//! never affects its siblings; only a fatal (cache store) error aborts the
//! batch, after the in-flight pipelines have drained.

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, instrument};

use bookmarks_shared::{Bookmark, BookmarkError, RecordOutcome, Result};

use crate::pipeline::RecordPipeline;

/// Failure reason of records that were cancelled before finishing.
pub const CANCELLED_REASON: &str = "cancelled";

/// Failure reason of records whose pipeline task panicked.
pub const LOST_TASK_REASON: &str = "pipeline task panicked or was aborted";

// ---------------------------------------------------------------------------
// Progress reporting
// ---------------------------------------------------------------------------

/// Progress callback for batch runs.
pub trait BatchProgress: Send + Sync {
    fn started(&self, total: usize);
    /// Called once per record as its pipeline completes, in completion order.
    fn record_finished(&self, done: usize, total: usize, outcome: &RecordOutcome);
    fn finished(&self, result: &BatchResult);
}

/// No-op progress reporter (for tests and non-interactive runs).
pub struct SilentProgress;

impl BatchProgress for SilentProgress {
    fn started(&self, _total: usize) {}
    fn record_finished(&self, _done: usize, _total: usize, _outcome: &RecordOutcome) {}
    fn finished(&self, _result: &BatchResult) {}
}

// ---------------------------------------------------------------------------
// Results
// ---------------------------------------------------------------------------

/// Counts stored with the batch-run history.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchStats {
    pub total: usize,
    pub processed: usize,
    /// Failed records, including cancelled ones.
    pub failed: usize,
    pub cancelled: usize,
    pub elapsed_ms: u64,
}

#[derive(Debug, Clone)]
pub struct BatchResult {
    /// One outcome per input record, ordered by input position.
    pub outcomes: Vec<RecordOutcome>,
    pub stats: BatchStats,
}

impl BatchResult {
    fn new(outcomes: Vec<RecordOutcome>, elapsed: Duration) -> Self {
        let processed = outcomes.iter().filter(|o| o.is_processed()).count();
        let cancelled = outcomes
            .iter()
            .filter(|o| o.failure_reason.as_deref() == Some(CANCELLED_REASON))
            .count();
        let stats = BatchStats {
            total: outcomes.len(),
            processed,
            failed: outcomes.len() - processed,
            cancelled,
            elapsed_ms: elapsed.as_millis() as u64,
        };
        Self { outcomes, stats }
    }
}

// ---------------------------------------------------------------------------
// BatchCoordinator
// ---------------------------------------------------------------------------

pub struct BatchCoordinator {
    pipeline: Arc<RecordPipeline>,
    concurrency: usize,
}

impl BatchCoordinator {
    /// `concurrency` is clamped to at least 1.
    pub fn new(pipeline: Arc<RecordPipeline>, concurrency: usize) -> Self {
        Self {
            pipeline,
            concurrency: concurrency.max(1),
        }
    }

    /// Cancelling this token stops new records from starting and ends the
    /// running ones at their next stage boundary.
    pub fn cancellation(&self) -> &CancellationToken {
        self.pipeline.cancellation()
    }

    /// Process all records and return their outcomes once every pipeline is done.
    #[instrument(skip_all, fields(records = records.len(), concurrency = self.concurrency))]
    pub async fn run(
        &self,
        records: Vec<Bookmark>,
        progress: &dyn BatchProgress,
    ) -> Result<BatchResult> {
        let started = Instant::now();
        let total = records.len();
        let cancel = self.cancellation().clone();
        info!(total, "batch started");
        progress.started(total);

        let semaphore = Arc::new(Semaphore::new(self.concurrency));
        let mut tasks = JoinSet::new();

        for (index, record) in records.iter().cloned().enumerate() {
            let pipeline = Arc::clone(&self.pipeline);
            let semaphore = Arc::clone(&semaphore);
            let cancel = cancel.clone();

            tasks.spawn(async move {
                let permit = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => None,
                    permit = semaphore.acquire_owned() => permit.ok(),
                };
                let Some(_permit) = permit else {
                    let id = record.identity(index);
                    return Ok(RecordOutcome::failed(id, index, record, CANCELLED_REASON));
                };
                pipeline.process(index, record).await
            });
        }

        let mut slots: Vec<Option<RecordOutcome>> = (0..total).map(|_| None).collect();
        let mut fatal: Option<BookmarkError> = None;
        let mut done = 0;

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(Ok(outcome)) => {
                    done += 1;
                    progress.record_finished(done, total, &outcome);
                    let index = outcome.index;
                    if let Some(slot) = slots.get_mut(index) {
                        *slot = Some(outcome);
                    }
                }
                Ok(Err(e)) => {
                    if fatal.is_none() {
                        error!(error = %e, "fatal error, cancelling batch");
                        cancel.cancel();
                        fatal = Some(e);
                    }
                }
                Err(e) => error!(error = %e, "pipeline task panicked"),
            }
        }

        if let Some(e) = fatal {
            return Err(e);
        }

        let mut outcomes = Vec::with_capacity(total);
        for (index, (slot, record)) in slots.into_iter().zip(records).enumerate() {
            let outcome = match slot {
                Some(outcome) => outcome,
                None => {
                    let id = record.identity(index);
                    let outcome = RecordOutcome::failed(id, index, record, LOST_TASK_REASON);
                    done += 1;
                    progress.record_finished(done, total, &outcome);
                    outcome
                }
            };
            outcomes.push(outcome);
        }

        let result = BatchResult::new(outcomes, started.elapsed());
        info!(
            processed = result.stats.processed,
            failed = result.stats.failed,
            cancelled = result.stats.cancelled,
            elapsed_ms = result.stats.elapsed_ms,
            "batch finished"
        );
        progress.finished(&result);
        Ok(result)
    }
}
