//! Relational work queue: claim, retry, and crash recovery.
//!
//! All cross-worker safety lives in the claim transaction's
//! `FOR UPDATE SKIP LOCKED` read; no application-level locking exists. The
//! claim commits before any model call, so a worker crash after claiming
//! leaves rows in `processing` for the recovery sweep to re-pend.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgConnection, PgPool, Row};
use thiserror::Error;

use crate::pipeline::subject::{SubjectError, SubjectKind, SubjectProfile, load_profile};

#[derive(Debug, Error)]
pub enum QueueError {
    #[error(transparent)]
    Db(#[from] sqlx::Error),
    #[error(transparent)]
    Subject(#[from] SubjectError),
    #[error("job `{0}` not found")]
    NotFound(String),
}

/// One unit of claimed work, carrying everything the prompt needs.
#[derive(Debug, Clone)]
pub struct ClaimedJob {
    pub kind: SubjectKind,
    pub job_id: String,
    pub change_fingerprint: Option<String>,
    pub retry_count: u32,
    pub profile: SubjectProfile,
}

#[derive(Debug, Clone, Copy)]
pub struct ClaimOptions {
    pub limit: usize,
    pub staleness_window: Duration,
    pub random_order: bool,
}

/// One row of the `jobs status` report.
#[derive(Debug, Clone)]
pub struct StatusCount {
    pub status: String,
    pub jobs: i64,
    pub oldest_created_at: Option<DateTime<Utc>>,
}

/// Outcome of recording a job failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureDisposition {
    /// Returned to `pending` with an incremented retry counter.
    Requeued { retry_count: u32 },
    /// Retry ceiling reached; the job is terminally `failed`.
    Failed,
}

#[async_trait]
pub trait WorkQueue: Send + Sync {
    /// Atomically claim up to `opts.limit` pending jobs, flipping them to
    /// `processing`. The claim is durable once this returns.
    async fn claim_batch(
        &self,
        kind: SubjectKind,
        opts: ClaimOptions,
    ) -> Result<Vec<ClaimedJob>, QueueError>;

    /// Return every `processing` job to `pending`. Run at startup and
    /// shutdown; assumes single-active-run semantics per deployment.
    async fn reset_stuck_jobs(&self) -> Result<u64, QueueError>;

    /// Record a failed attempt and apply the retry policy.
    async fn record_failure(
        &self,
        kind: SubjectKind,
        job_id: &str,
        error: &str,
    ) -> Result<FailureDisposition, QueueError>;

    /// Terminal state for subjects the model declared unassessable.
    async fn mark_no_theme(
        &self,
        kind: SubjectKind,
        job_id: &str,
        explanation: &str,
    ) -> Result<(), QueueError>;
}

/// Postgres-backed queue over the `analysis_job` table.
#[derive(Debug, Clone)]
pub struct PgWorkQueue {
    pool: PgPool,
    max_retries: u32,
}

impl PgWorkQueue {
    pub fn new(pool: PgPool, max_retries: u32) -> Self {
        Self { pool, max_retries }
    }

    /// Per-status job counts and oldest-created timestamps for the
    /// admin/status surface.
    pub async fn status_counts(&self) -> Result<Vec<StatusCount>, QueueError> {
        let rows = sqlx::query(
            r#"
            SELECT status, COUNT(*) AS jobs, MIN(created_at) AS oldest_created_at
            FROM analysis_job
            GROUP BY status
            ORDER BY status
            "#,
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .into_iter()
            .map(|r| StatusCount {
                status: r.get("status"),
                jobs: r.get("jobs"),
                oldest_created_at: r.get("oldest_created_at"),
            })
            .collect())
    }
}

#[async_trait]
impl WorkQueue for PgWorkQueue {
    async fn claim_batch(
        &self,
        kind: SubjectKind,
        opts: ClaimOptions,
    ) -> Result<Vec<ClaimedJob>, QueueError> {
        let mut tx = self.pool.begin().await?;
        seed_jobs_on(&mut tx, kind).await?;
        let jobs = claim_on(&mut tx, kind, opts).await?;
        tx.commit().await?;
        Ok(jobs)
    }

    async fn reset_stuck_jobs(&self) -> Result<u64, QueueError> {
        let mut conn = self.pool.acquire().await?;
        let reset = reset_stuck_on(&mut conn).await?;
        if reset > 0 {
            tracing::info!(
                event = "stuck_jobs_reset",
                jobs = reset,
                "returned interrupted jobs to pending"
            );
        }
        Ok(reset)
    }

    async fn record_failure(
        &self,
        kind: SubjectKind,
        job_id: &str,
        error: &str,
    ) -> Result<FailureDisposition, QueueError> {
        let mut conn = self.pool.acquire().await?;
        record_failure_on(&mut conn, kind, job_id, error, self.max_retries).await
    }

    async fn mark_no_theme(
        &self,
        kind: SubjectKind,
        job_id: &str,
        explanation: &str,
    ) -> Result<(), QueueError> {
        let mut conn = self.pool.acquire().await?;
        mark_no_theme_on(&mut conn, kind, job_id, explanation).await
    }
}

/// Create `pending` rows for subjects that have none yet, and re-pend jobs
/// whose subject content changed since the last analysis.
pub(crate) async fn seed_jobs_on(
    conn: &mut PgConnection,
    kind: SubjectKind,
) -> Result<(), QueueError> {
    match kind {
        SubjectKind::Bill => {
            sqlx::query(
                r#"
                INSERT INTO analysis_job (subject_kind, job_id, change_fingerprint, status)
                SELECT 'bill', b.bill_id::text, b.change_hash, 'pending'
                FROM bill b
                LEFT JOIN analysis_job j
                  ON j.subject_kind = 'bill' AND j.job_id = b.bill_id::text
                WHERE j.job_id IS NULL
                  AND (
                    array_length(regexp_split_to_array(trim(b.description), '\s+'), 1) >= 20
                    OR EXISTS (
                      SELECT 1 FROM bill_amendment ba WHERE ba.bill_id = b.bill_id
                    )
                  )
                ON CONFLICT (subject_kind, job_id) DO NOTHING
                "#,
            )
            .execute(&mut *conn)
            .await?;

            sqlx::query(
                r#"
                UPDATE analysis_job j
                SET status = 'pending',
                    change_fingerprint = b.change_hash,
                    retry_count = 0,
                    error_message = NULL,
                    updated_at = now()
                FROM bill b
                WHERE j.subject_kind = 'bill'
                  AND j.job_id = b.bill_id::text
                  AND j.status IN ('completed', 'no_theme', 'failed')
                  AND j.change_fingerprint IS DISTINCT FROM b.change_hash
                "#,
            )
            .execute(&mut *conn)
            .await?;
        }
        SubjectKind::Cluster => {
            sqlx::query(
                r#"
                INSERT INTO analysis_job (subject_kind, job_id, change_fingerprint, status)
                SELECT 'cluster', c.cluster_id::text, c.content_hash, 'pending'
                FROM bill_cluster c
                LEFT JOIN analysis_job j
                  ON j.subject_kind = 'cluster' AND j.job_id = c.cluster_id::text
                WHERE j.job_id IS NULL
                ON CONFLICT (subject_kind, job_id) DO NOTHING
                "#,
            )
            .execute(&mut *conn)
            .await?;

            sqlx::query(
                r#"
                UPDATE analysis_job j
                SET status = 'pending',
                    change_fingerprint = c.content_hash,
                    retry_count = 0,
                    error_message = NULL,
                    updated_at = now()
                FROM bill_cluster c
                WHERE j.subject_kind = 'cluster'
                  AND j.job_id = c.cluster_id::text
                  AND j.status IN ('completed', 'no_theme', 'failed')
                  AND j.change_fingerprint IS DISTINCT FROM c.content_hash
                "#,
            )
            .execute(&mut *conn)
            .await?;
        }
    }
    Ok(())
}

const CLAIM_OLDEST_FIRST: &str = r#"
WITH claimable AS (
    SELECT subject_kind, job_id
    FROM analysis_job
    WHERE subject_kind = $1
      AND status = 'pending'
      AND (retry_count = 0 OR updated_at <= now() - ($2 * interval '1 second'))
    ORDER BY created_at ASC
    LIMIT $3
    FOR UPDATE SKIP LOCKED
)
UPDATE analysis_job j
SET status = 'processing', started_at = now(), updated_at = now()
FROM claimable c
WHERE j.subject_kind = c.subject_kind AND j.job_id = c.job_id
RETURNING j.job_id, j.change_fingerprint, j.retry_count
"#;

const CLAIM_RANDOM: &str = r#"
WITH claimable AS (
    SELECT subject_kind, job_id
    FROM analysis_job
    WHERE subject_kind = $1
      AND status = 'pending'
      AND (retry_count = 0 OR updated_at <= now() - ($2 * interval '1 second'))
    ORDER BY random()
    LIMIT $3
    FOR UPDATE SKIP LOCKED
)
UPDATE analysis_job j
SET status = 'processing', started_at = now(), updated_at = now()
FROM claimable c
WHERE j.subject_kind = c.subject_kind AND j.job_id = c.job_id
RETURNING j.job_id, j.change_fingerprint, j.retry_count
"#;

/// Flip up to `opts.limit` claimable jobs to `processing` and load their
/// subject profiles. Jobs whose subject row has vanished are failed in place
/// rather than aborting the claim.
pub(crate) async fn claim_on(
    conn: &mut PgConnection,
    kind: SubjectKind,
    opts: ClaimOptions,
) -> Result<Vec<ClaimedJob>, QueueError> {
    let query = if opts.random_order {
        CLAIM_RANDOM
    } else {
        CLAIM_OLDEST_FIRST
    };
    let rows = sqlx::query(query)
        .bind(kind.slug())
        .bind(opts.staleness_window.as_secs_f64())
        .bind(opts.limit as i64)
        .fetch_all(&mut *conn)
        .await?;

    let mut jobs = Vec::with_capacity(rows.len());
    for row in rows {
        let job_id: String = row.get("job_id");
        match load_profile(&mut *conn, kind, &job_id).await {
            Ok(profile) => jobs.push(ClaimedJob {
                kind,
                job_id,
                change_fingerprint: row.get("change_fingerprint"),
                retry_count: row.get::<i32, _>("retry_count") as u32,
                profile,
            }),
            Err(err @ (SubjectError::NotFound { .. } | SubjectError::InvalidId { .. })) => {
                tracing::warn!(
                    event = "claim_subject_missing",
                    kind = kind.slug(),
                    job_id = %job_id,
                    error = %err,
                    "claimed job has no loadable subject; marking failed"
                );
                sqlx::query(
                    r#"
                    UPDATE analysis_job
                    SET status = 'failed', error_message = $3,
                        completed_at = now(), updated_at = now()
                    WHERE subject_kind = $1 AND job_id = $2
                    "#,
                )
                .bind(kind.slug())
                .bind(&job_id)
                .bind(err.to_string())
                .execute(&mut *conn)
                .await?;
            }
            Err(err) => return Err(err.into()),
        }
    }
    Ok(jobs)
}

/// Read the claimable set without mutating status. Dry-run only.
pub(crate) async fn preview_on(
    conn: &mut PgConnection,
    kind: SubjectKind,
    opts: ClaimOptions,
) -> Result<Vec<ClaimedJob>, QueueError> {
    let rows = sqlx::query(
        r#"
        SELECT job_id, change_fingerprint, retry_count
        FROM analysis_job
        WHERE subject_kind = $1
          AND status = 'pending'
          AND (retry_count = 0 OR updated_at <= now() - ($2 * interval '1 second'))
        ORDER BY created_at ASC
        LIMIT $3
        "#,
    )
    .bind(kind.slug())
    .bind(opts.staleness_window.as_secs_f64())
    .bind(opts.limit as i64)
    .fetch_all(&mut *conn)
    .await?;

    let mut jobs = Vec::with_capacity(rows.len());
    for row in rows {
        let job_id: String = row.get("job_id");
        match load_profile(&mut *conn, kind, &job_id).await {
            Ok(profile) => jobs.push(ClaimedJob {
                kind,
                job_id,
                change_fingerprint: row.get("change_fingerprint"),
                retry_count: row.get::<i32, _>("retry_count") as u32,
                profile,
            }),
            Err(SubjectError::NotFound { .. } | SubjectError::InvalidId { .. }) => continue,
            Err(err) => return Err(err.into()),
        }
    }
    Ok(jobs)
}

pub(crate) async fn reset_stuck_on(conn: &mut PgConnection) -> Result<u64, QueueError> {
    let result = sqlx::query(
        r#"
        UPDATE analysis_job
        SET status = 'pending',
            error_message = 'analysis reset after interrupted run',
            updated_at = now()
        WHERE status = 'processing'
        "#,
    )
    .execute(conn)
    .await?;
    Ok(result.rows_affected())
}

pub(crate) async fn record_failure_on(
    conn: &mut PgConnection,
    kind: SubjectKind,
    job_id: &str,
    error: &str,
    max_retries: u32,
) -> Result<FailureDisposition, QueueError> {
    let row = sqlx::query(
        r#"
        UPDATE analysis_job
        SET retry_count = retry_count + 1,
            status = CASE WHEN retry_count + 1 < $3 THEN 'pending' ELSE 'failed' END,
            error_message = $4,
            completed_at = CASE WHEN retry_count + 1 < $3 THEN completed_at ELSE now() END,
            updated_at = now()
        WHERE subject_kind = $1 AND job_id = $2
        RETURNING status, retry_count
        "#,
    )
    .bind(kind.slug())
    .bind(job_id)
    .bind(max_retries as i32)
    .bind(error)
    .fetch_optional(&mut *conn)
    .await?
    .ok_or_else(|| QueueError::NotFound(job_id.to_string()))?;

    let status: String = row.get("status");
    if status == "failed" {
        Ok(FailureDisposition::Failed)
    } else {
        Ok(FailureDisposition::Requeued {
            retry_count: row.get::<i32, _>("retry_count") as u32,
        })
    }
}

pub(crate) async fn mark_no_theme_on(
    conn: &mut PgConnection,
    kind: SubjectKind,
    job_id: &str,
    explanation: &str,
) -> Result<(), QueueError> {
    let result = sqlx::query(
        r#"
        UPDATE analysis_job
        SET status = 'no_theme',
            error_message = $3,
            completed_at = now(),
            updated_at = now()
        WHERE subject_kind = $1 AND job_id = $2
        "#,
    )
    .bind(kind.slug())
    .bind(job_id)
    .bind(explanation)
    .execute(conn)
    .await?;
    if result.rows_affected() == 0 {
        return Err(QueueError::NotFound(job_id.to_string()));
    }
    Ok(())
}
