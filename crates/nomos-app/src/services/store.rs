//! Durable persistence of validated analysis results and batch bookkeeping.
//!
//! Persistence is idempotent under reanalysis: any previous result for the
//! job is deleted child-first before the replacement is inserted, all inside
//! one transaction, so a crash between insert and status update can always be
//! re-run. Every SQL helper takes `&mut PgConnection` so the dry-run path can
//! pin the whole run to a single rolled-back transaction.

use async_trait::async_trait;
use sqlx::types::Json;
use sqlx::{PgConnection, PgPool, Row};
use strum::{AsRefStr, EnumString};
use thiserror::Error;
use uuid::Uuid;

use crate::pipeline::analysis::JobAnalysis;
use crate::pipeline::subject::SubjectKind;
use crate::services::queue::ClaimedJob;
use crate::services::usage::TokenUsage;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error(transparent)]
    Db(#[from] sqlx::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
    #[error("analysis for job `{0}` is incomplete: {1}")]
    IncompleteAnalysis(String, String),
}

/// Per-job state within one batch attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, AsRefStr, EnumString)]
#[strum(serialize_all = "snake_case")]
pub enum ItemState {
    Pending,
    Completed,
    Failed,
    Skipped,
}

/// Terminal state of a batch attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, AsRefStr, EnumString)]
#[strum(serialize_all = "snake_case")]
pub enum BatchState {
    Completed,
    Failed,
}

#[async_trait]
pub trait ResultStore: Send + Sync {
    /// Record the start of a batch attempt: a progress row plus one item row
    /// per member job.
    async fn open_batch(
        &self,
        batch_id: Uuid,
        kind: SubjectKind,
        job_ids: &[String],
    ) -> Result<(), StoreError>;

    /// Record the outcome of one member job within a batch attempt.
    async fn record_item(
        &self,
        batch_id: Uuid,
        job_id: &str,
        state: ItemState,
        token_count: Option<u64>,
        error: Option<&str>,
    ) -> Result<(), StoreError>;

    /// Close a batch attempt, rolling up processed/failed counts.
    async fn close_batch(&self, batch_id: Uuid, state: BatchState) -> Result<(), StoreError>;

    /// Idempotently persist one validated analysis and mark the job
    /// `completed`, stamping the fingerprint that was analyzed.
    async fn persist(
        &self,
        job: &ClaimedJob,
        analysis: &JobAnalysis,
        usage: TokenUsage,
    ) -> Result<(), StoreError>;
}

#[derive(Debug, Clone)]
pub struct PgResultStore {
    pool: PgPool,
}

impl PgResultStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ResultStore for PgResultStore {
    async fn open_batch(
        &self,
        batch_id: Uuid,
        kind: SubjectKind,
        job_ids: &[String],
    ) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;
        open_batch_on(&mut tx, batch_id, kind, job_ids).await?;
        tx.commit().await?;
        Ok(())
    }

    async fn record_item(
        &self,
        batch_id: Uuid,
        job_id: &str,
        state: ItemState,
        token_count: Option<u64>,
        error: Option<&str>,
    ) -> Result<(), StoreError> {
        let mut conn = self.pool.acquire().await?;
        record_item_on(&mut conn, batch_id, job_id, state, token_count, error).await
    }

    async fn close_batch(&self, batch_id: Uuid, state: BatchState) -> Result<(), StoreError> {
        let mut conn = self.pool.acquire().await?;
        close_batch_on(&mut conn, batch_id, state).await
    }

    async fn persist(
        &self,
        job: &ClaimedJob,
        analysis: &JobAnalysis,
        usage: TokenUsage,
    ) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;
        persist_on(&mut tx, job, analysis, usage).await?;
        tx.commit().await?;
        Ok(())
    }
}

pub(crate) async fn open_batch_on(
    conn: &mut PgConnection,
    batch_id: Uuid,
    kind: SubjectKind,
    job_ids: &[String],
) -> Result<(), StoreError> {
    sqlx::query(
        r#"
        INSERT INTO batch_progress (batch_id, subject_kind, total_jobs, batch_state, started_at)
        VALUES ($1, $2, $3, 'running', now())
        "#,
    )
    .bind(batch_id)
    .bind(kind.slug())
    .bind(job_ids.len() as i32)
    .execute(&mut *conn)
    .await?;

    sqlx::query(
        r#"
        INSERT INTO batch_item (batch_id, job_id, item_state)
        SELECT $1, unnest($2::text[]), 'pending'
        "#,
    )
    .bind(batch_id)
    .bind(job_ids)
    .execute(&mut *conn)
    .await?;

    Ok(())
}

pub(crate) async fn record_item_on(
    conn: &mut PgConnection,
    batch_id: Uuid,
    job_id: &str,
    state: ItemState,
    token_count: Option<u64>,
    error: Option<&str>,
) -> Result<(), StoreError> {
    sqlx::query(
        r#"
        UPDATE batch_item
        SET item_state = $3,
            attempt_count = attempt_count + 1,
            token_count = COALESCE($4, token_count),
            last_error = $5,
            updated_at = now()
        WHERE batch_id = $1 AND job_id = $2
        "#,
    )
    .bind(batch_id)
    .bind(job_id)
    .bind(state.as_ref())
    .bind(token_count.map(|t| t as i64))
    .bind(error)
    .execute(conn)
    .await?;
    Ok(())
}

pub(crate) async fn close_batch_on(
    conn: &mut PgConnection,
    batch_id: Uuid,
    state: BatchState,
) -> Result<(), StoreError> {
    sqlx::query(
        r#"
        UPDATE batch_progress
        SET batch_state = $2,
            finished_at = now(),
            processed_jobs = (
                SELECT COUNT(*) FROM batch_item
                WHERE batch_id = $1 AND item_state = 'completed'
            ),
            failed_jobs = (
                SELECT COUNT(*) FROM batch_item
                WHERE batch_id = $1 AND item_state = 'failed'
            )
        WHERE batch_id = $1
        "#,
    )
    .bind(batch_id)
    .bind(state.as_ref())
    .execute(conn)
    .await?;
    Ok(())
}

/// Delete-then-insert of the three-level result record, then the job status
/// update, in the caller's transaction.
pub(crate) async fn persist_on(
    conn: &mut PgConnection,
    job: &ClaimedJob,
    analysis: &JobAnalysis,
    usage: TokenUsage,
) -> Result<(), StoreError> {
    let overall = analysis.overall.as_ref().ok_or_else(|| {
        StoreError::IncompleteAnalysis(
            job.job_id.clone(),
            "missing overall assessment".to_string(),
        )
    })?;

    // Children first: subgroup -> category -> result.
    sqlx::query(
        r#"
        DELETE FROM subgroup_score
        WHERE category_score_id IN (
            SELECT category_score_id FROM category_score
            WHERE result_id IN (
                SELECT result_id FROM analysis_result
                WHERE subject_kind = $1 AND job_id = $2
            )
        )
        "#,
    )
    .bind(job.kind.slug())
    .bind(&job.job_id)
    .execute(&mut *conn)
    .await?;

    sqlx::query(
        r#"
        DELETE FROM category_score
        WHERE result_id IN (
            SELECT result_id FROM analysis_result
            WHERE subject_kind = $1 AND job_id = $2
        )
        "#,
    )
    .bind(job.kind.slug())
    .bind(&job.job_id)
    .execute(&mut *conn)
    .await?;

    sqlx::query(
        r#"
        DELETE FROM analysis_result
        WHERE subject_kind = $1 AND job_id = $2
        "#,
    )
    .bind(job.kind.slug())
    .bind(&job.job_id)
    .execute(&mut *conn)
    .await?;

    let raw_reply = serde_json::to_value(analysis)?;
    let result_row = sqlx::query(
        r#"
        INSERT INTO analysis_result (
            subject_kind, job_id, bias_score, benefit_score, confidence,
            summary, raw_reply, prompt_tokens, completion_tokens
        )
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
        RETURNING result_id
        "#,
    )
    .bind(job.kind.slug())
    .bind(&job.job_id)
    .bind(overall.bias_score)
    .bind(overall.benefit_score)
    .bind(overall.confidence.as_str())
    .bind(&overall.summary)
    .bind(Json(raw_reply))
    .bind(usage.prompt_tokens as i64)
    .bind(usage.completion_tokens as i64)
    .fetch_one(&mut *conn)
    .await?;
    let result_id: i64 = result_row.get("result_id");

    for category in &analysis.categories {
        let category_row = sqlx::query(
            r#"
            INSERT INTO category_score (result_id, category, bias_score, benefit_score)
            VALUES ($1, $2, $3, $4)
            RETURNING category_score_id
            "#,
        )
        .bind(result_id)
        .bind(category.category.as_ref())
        .bind(category.bias_score)
        .bind(category.benefit_score)
        .fetch_one(&mut *conn)
        .await?;
        let category_score_id: i64 = category_row.get("category_score_id");

        for subgroup in &category.subgroups {
            sqlx::query(
                r#"
                INSERT INTO subgroup_score (
                    category_score_id, subgroup_code, bias_score, benefit_score, evidence
                )
                VALUES ($1, $2, $3, $4, $5)
                "#,
            )
            .bind(category_score_id)
            .bind(&subgroup.code)
            .bind(subgroup.bias_score)
            .bind(subgroup.benefit_score)
            .bind(&subgroup.evidence)
            .execute(&mut *conn)
            .await?;
        }
    }

    sqlx::query(
        r#"
        UPDATE analysis_job
        SET status = 'completed',
            change_fingerprint = $3,
            error_message = NULL,
            completed_at = now(),
            updated_at = now()
        WHERE subject_kind = $1 AND job_id = $2
        "#,
    )
    .bind(job.kind.slug())
    .bind(&job.job_id)
    .bind(&job.change_fingerprint)
    .execute(&mut *conn)
    .await?;

    Ok(())
}
