//! Batch orchestration and bisection retry.
//!
//! One claimed batch becomes one model call. When the call fails — transport
//! error, malformed reply, correspondence mismatch — the batch is split in
//! half and each half retried independently, down to single-job granularity.
//! A failing job therefore never blocks analysis of its batch-mates, and the
//! worst case for one bad job in a batch of n is O(log n) extra calls. At
//! size one the retry-ceiling policy applies.

use std::future::Future;
use std::ops::{Add, AddAssign};
use std::pin::Pin;
use std::sync::Arc;

use thiserror::Error;
use uuid::Uuid;

use crate::services::model::AnalystClient;
use crate::services::queue::{ClaimedJob, FailureDisposition, QueueError, WorkQueue};
use crate::services::store::{BatchState, ItemState, ResultStore, StoreError};

const MIN_BATCH_SIZE: usize = 1;

/// Infrastructure failures the processor cannot absorb. Model failures never
/// surface here; they feed the bisection path instead.
#[derive(Debug, Error)]
pub enum ProcessorError {
    #[error(transparent)]
    Queue(#[from] QueueError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Per-run counters, summed across bisection levels.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct BatchStats {
    pub completed: usize,
    pub no_theme: usize,
    pub requeued: usize,
    pub failed: usize,
}

impl Add for BatchStats {
    type Output = BatchStats;

    fn add(self, other: BatchStats) -> BatchStats {
        BatchStats {
            completed: self.completed + other.completed,
            no_theme: self.no_theme + other.no_theme,
            requeued: self.requeued + other.requeued,
            failed: self.failed + other.failed,
        }
    }
}

impl AddAssign for BatchStats {
    fn add_assign(&mut self, rhs: Self) {
        *self = *self + rhs;
    }
}

pub struct BatchProcessor {
    queue: Arc<dyn WorkQueue>,
    client: Arc<dyn AnalystClient>,
    store: Arc<dyn ResultStore>,
}

impl BatchProcessor {
    pub fn new(
        queue: Arc<dyn WorkQueue>,
        client: Arc<dyn AnalystClient>,
        store: Arc<dyn ResultStore>,
    ) -> Self {
        Self {
            queue,
            client,
            store,
        }
    }

    /// Process one claimed batch to completion, including any bisection.
    pub async fn run(&self, jobs: &[ClaimedJob]) -> Result<BatchStats, ProcessorError> {
        if jobs.is_empty() {
            return Ok(BatchStats::default());
        }
        self.run_slice(jobs).await
    }

    fn run_slice<'a>(
        &'a self,
        jobs: &'a [ClaimedJob],
    ) -> Pin<Box<dyn Future<Output = Result<BatchStats, ProcessorError>> + Send + 'a>> {
        Box::pin(async move {
            let batch_id = Uuid::new_v4();
            let job_ids: Vec<String> = jobs.iter().map(|job| job.job_id.clone()).collect();
            self.store
                .open_batch(batch_id, jobs[0].kind, &job_ids)
                .await?;
            tracing::info!(
                event = "batch_started",
                batch_id = %batch_id,
                kind = jobs[0].kind.slug(),
                jobs = jobs.len(),
                "submitting batch to model"
            );

            match self.client.analyze(jobs).await {
                Ok(batch) => {
                    let mut stats = BatchStats::default();
                    let per_job_tokens = batch.usage.per_job(jobs.len());
                    for analysis in &batch.analyses {
                        let Some(job) = jobs.iter().find(|j| j.job_id == analysis.job_id) else {
                            // 1:1 correspondence was validated by the adapter.
                            continue;
                        };
                        if analysis.no_coherent_theme {
                            let explanation = analysis
                                .explanation
                                .as_deref()
                                .unwrap_or("subject lacks a coherent theme");
                            self.queue
                                .mark_no_theme(job.kind, &job.job_id, explanation)
                                .await?;
                            self.store
                                .record_item(
                                    batch_id,
                                    &job.job_id,
                                    ItemState::Skipped,
                                    Some(per_job_tokens),
                                    None,
                                )
                                .await?;
                            stats.no_theme += 1;
                            tracing::info!(
                                event = "job_no_theme",
                                job_id = %job.job_id,
                                "subject declared unassessable"
                            );
                            continue;
                        }
                        match self.store.persist(job, analysis, batch.usage).await {
                            Ok(()) => {
                                self.store
                                    .record_item(
                                        batch_id,
                                        &job.job_id,
                                        ItemState::Completed,
                                        Some(per_job_tokens),
                                        None,
                                    )
                                    .await?;
                                stats.completed += 1;
                            }
                            Err(err) => {
                                tracing::warn!(
                                    event = "persist_failed",
                                    job_id = %job.job_id,
                                    error = %err,
                                    "result persistence failed; applying retry policy"
                                );
                                let message = err.to_string();
                                let disposition = self
                                    .queue
                                    .record_failure(job.kind, &job.job_id, &message)
                                    .await?;
                                self.store
                                    .record_item(
                                        batch_id,
                                        &job.job_id,
                                        ItemState::Failed,
                                        None,
                                        Some(&message),
                                    )
                                    .await?;
                                match disposition {
                                    FailureDisposition::Requeued { .. } => stats.requeued += 1,
                                    FailureDisposition::Failed => stats.failed += 1,
                                }
                            }
                        }
                    }
                    self.store
                        .close_batch(batch_id, BatchState::Completed)
                        .await?;
                    Ok(stats)
                }
                Err(err) if jobs.len() > MIN_BATCH_SIZE => {
                    let message = err.to_string();
                    tracing::warn!(
                        event = "batch_bisected",
                        batch_id = %batch_id,
                        jobs = jobs.len(),
                        error = %message,
                        "batch failed; splitting and retrying halves"
                    );
                    for job in jobs {
                        self.store
                            .record_item(
                                batch_id,
                                &job.job_id,
                                ItemState::Failed,
                                None,
                                Some(&message),
                            )
                            .await?;
                    }
                    self.store.close_batch(batch_id, BatchState::Failed).await?;

                    let mid = jobs.len() / 2;
                    let left = self.run_slice(&jobs[..mid]).await?;
                    let right = self.run_slice(&jobs[mid..]).await?;
                    Ok(left + right)
                }
                Err(err) => {
                    let job = &jobs[0];
                    let message = err.to_string();
                    let disposition = self
                        .queue
                        .record_failure(job.kind, &job.job_id, &message)
                        .await?;
                    self.store
                        .record_item(batch_id, &job.job_id, ItemState::Failed, None, Some(&message))
                        .await?;
                    self.store.close_batch(batch_id, BatchState::Failed).await?;

                    let mut stats = BatchStats::default();
                    match disposition {
                        FailureDisposition::Requeued { retry_count } => {
                            tracing::warn!(
                                event = "job_requeued",
                                job_id = %job.job_id,
                                retry_count,
                                error = %message,
                                "single-job batch failed; returned to pending"
                            );
                            stats.requeued += 1;
                        }
                        FailureDisposition::Failed => {
                            tracing::warn!(
                                event = "job_failed",
                                job_id = %job.job_id,
                                error = %message,
                                "retry ceiling reached; job is terminally failed"
                            );
                            stats.failed += 1;
                        }
                    }
                    Ok(stats)
                }
            }
        })
    }
}
