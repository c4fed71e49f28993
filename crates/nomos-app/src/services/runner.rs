//! Backlog execution: component wiring, the claim/process loop, and the
//! rolled-back dry-run path.
//!
//! `drain_backlog` and `dry_run_once` take their collaborators as arguments
//! so tests can drive the real queue and store with a scripted analyst
//! client; `run_backlog` / `run_dry_run` wire the production components from
//! configuration.

use std::sync::Arc;

use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;

use crate::config::AppConfig;
use crate::error::AppError;
use crate::pipeline::subject::SubjectKind;
use crate::services::budget::BatchBudget;
use crate::services::model::{AnalystClient, HttpAnalystClient};
use crate::services::processor::{BatchProcessor, BatchStats};
use crate::services::queue::{self, ClaimOptions, PgWorkQueue, WorkQueue};
use crate::services::store;

/// Aggregate outcome of one pipeline invocation.
#[derive(Debug, Default, Clone, Copy)]
pub struct RunSummary {
    pub claimed: usize,
    pub batches: usize,
    pub stats: BatchStats,
}

/// Connect to the relational store and apply pending migrations. Failure here
/// is fatal: the process exits non-zero before any work is claimed.
pub async fn connect(cfg: &AppConfig) -> Result<PgPool, AppError> {
    let pool = PgPoolOptions::new()
        .max_connections(cfg.database.max_connections)
        .connect(&cfg.database.url)
        .await?;
    sqlx::migrate!("./migrations").run(&pool).await?;
    Ok(pool)
}

fn claim_options(
    cfg: &AppConfig,
    limit_override: Option<usize>,
    random_order: bool,
) -> ClaimOptions {
    let budget = BatchBudget::new(
        cfg.llm.context_window_tokens,
        cfg.llm.prompt_overhead_tokens,
    );
    let budget_limit = budget.claim_limit(cfg.queue.batch_size);
    let limit = limit_override
        .map(|requested| requested.clamp(1, budget_limit))
        .unwrap_or(budget_limit);
    ClaimOptions {
        limit,
        staleness_window: cfg.queue.staleness_window(),
        random_order: random_order || cfg.queue.random_order,
    }
}

/// Durably process the full backlog: recovery sweep, then claim/process until
/// every kind's claimable set is empty, then a final sweep. Per-job failures
/// never abort the run.
pub async fn run_backlog(
    cfg: &AppConfig,
    kinds: &[SubjectKind],
    limit_override: Option<usize>,
    random_order: bool,
) -> Result<RunSummary, AppError> {
    let pool = connect(cfg).await?;
    let queue = Arc::new(PgWorkQueue::new(pool.clone(), cfg.llm.max_retries));
    let client: Arc<dyn AnalystClient> = Arc::new(HttpAnalystClient::from_config(
        &cfg.llm,
        Some(HttpAnalystClient::default_limiter()),
    )?);
    let result_store = Arc::new(store::PgResultStore::new(pool.clone()));
    let processor = BatchProcessor::new(queue.clone(), client, result_store);
    let opts = claim_options(cfg, limit_override, random_order);

    drain_backlog(queue, &processor, kinds, opts).await
}

/// The claim/process loop over already-wired components.
pub async fn drain_backlog(
    queue: Arc<dyn WorkQueue>,
    processor: &BatchProcessor,
    kinds: &[SubjectKind],
    opts: ClaimOptions,
) -> Result<RunSummary, AppError> {
    queue.reset_stuck_jobs().await?;

    let mut summary = RunSummary::default();
    for kind in kinds {
        loop {
            let jobs = queue.claim_batch(*kind, opts).await?;
            if jobs.is_empty() {
                tracing::info!(
                    event = "backlog_drained",
                    kind = kind.slug(),
                    "no claimable jobs remain"
                );
                break;
            }
            summary.claimed += jobs.len();
            summary.batches += 1;
            let stats = processor.run(&jobs).await?;
            summary.stats += stats;
            tracing::info!(
                event = "batch_finished",
                kind = kind.slug(),
                claimed = jobs.len(),
                completed = stats.completed,
                no_theme = stats.no_theme,
                requeued = stats.requeued,
                failed = stats.failed,
                "batch complete"
            );
        }
    }

    queue.reset_stuck_jobs().await?;
    Ok(summary)
}

/// Exercise the full pipeline for exactly one batch on a single transaction
/// that is unconditionally rolled back: zero durable side effects, with every
/// would-be write logged for inspection.
pub async fn run_dry_run(
    cfg: &AppConfig,
    kinds: &[SubjectKind],
    limit_override: Option<usize>,
) -> Result<RunSummary, AppError> {
    let pool = connect(cfg).await?;
    let client = HttpAnalystClient::from_config(&cfg.llm, None)?;
    let opts = claim_options(cfg, limit_override, false);
    dry_run_once(&pool, &client, kinds, opts).await
}

/// One rolled-back batch over already-wired components.
pub async fn dry_run_once(
    pool: &PgPool,
    client: &dyn AnalystClient,
    kinds: &[SubjectKind],
    opts: ClaimOptions,
) -> Result<RunSummary, AppError> {
    let mut summary = RunSummary::default();
    let mut tx = pool.begin().await?;

    for kind in kinds {
        let jobs = queue::preview_on(&mut tx, *kind, opts).await?;
        if jobs.is_empty() {
            tracing::info!(event = "dry_run_empty", kind = kind.slug(), "no pending jobs");
            continue;
        }
        summary.claimed += jobs.len();
        summary.batches += 1;
        tracing::info!(
            event = "dry_run_batch",
            kind = kind.slug(),
            jobs = jobs.len(),
            "processing one batch without durable effects"
        );

        match client.analyze(&jobs).await {
            Ok(batch) => {
                for analysis in &batch.analyses {
                    let Some(job) = jobs.iter().find(|j| j.job_id == analysis.job_id) else {
                        continue;
                    };
                    if analysis.no_coherent_theme {
                        tracing::info!(
                            event = "dry_run_would_skip",
                            job_id = %job.job_id,
                            explanation = analysis.explanation.as_deref().unwrap_or(""),
                            "would mark no_theme"
                        );
                        summary.stats.no_theme += 1;
                        continue;
                    }
                    store::persist_on(&mut tx, job, analysis, batch.usage).await?;
                    let overall = analysis.overall.as_ref();
                    tracing::info!(
                        event = "dry_run_would_persist",
                        job_id = %job.job_id,
                        bias_score = overall.map(|o| o.bias_score),
                        benefit_score = overall.map(|o| o.benefit_score),
                        categories = analysis.categories.len(),
                        "would persist analysis result"
                    );
                    summary.stats.completed += 1;
                }
            }
            Err(err) => {
                tracing::warn!(
                    event = "dry_run_batch_failed",
                    kind = kind.slug(),
                    error = %err,
                    "model call failed; a real run would bisect"
                );
                summary.stats.failed += jobs.len();
            }
        }
        // Dry runs process exactly one batch.
        break;
    }

    tx.rollback().await?;
    tracing::info!(event = "dry_run_rolled_back", "all changes discarded");
    Ok(summary)
}

/// Per-status job counts for the `jobs status` command.
pub async fn jobs_status(cfg: &AppConfig) -> Result<Vec<queue::StatusCount>, AppError> {
    let pool = connect(cfg).await?;
    let queue = PgWorkQueue::new(pool, cfg.llm.max_retries);
    Ok(queue.status_counts().await?)
}

/// Manual recovery sweep for the `jobs reset` command.
pub async fn jobs_reset(cfg: &AppConfig) -> Result<u64, AppError> {
    let pool = connect(cfg).await?;
    let queue = PgWorkQueue::new(pool, cfg.llm.max_retries);
    Ok(queue.reset_stuck_jobs().await?)
}
