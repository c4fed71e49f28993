//! End-to-end pipeline tests against a live Postgres instance.
//!
//! Gated on `NOMOS_TEST_DATABASE_URL`; every test is skipped when the
//! variable is unset so the default `cargo test` run needs no
//! infrastructure. Tests share one database and serialize on a lock.

use std::sync::{Arc, OnceLock};
use std::time::Duration;

use async_trait::async_trait;
use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;
use uuid::Uuid;

use nomos_app::pipeline::analysis::{
    CategoryAssessment, ConfidenceLabel, DemographicCategory, JobAnalysis, OverallAssessment,
    SubgroupAssessment,
};
use nomos_app::pipeline::subject::SubjectKind;
use nomos_app::services::model::{AnalystClient, BatchAnalysis, ModelError};
use nomos_app::services::processor::BatchProcessor;
use nomos_app::services::queue::{ClaimOptions, ClaimedJob, PgWorkQueue, WorkQueue};
use nomos_app::services::store::{PgResultStore, ResultStore};
use nomos_app::services::usage::TokenUsage;
use nomos_app::services::{drain_backlog, dry_run_once};

static DB_LOCK: OnceLock<tokio::sync::Mutex<()>> = OnceLock::new();

fn db_lock() -> &'static tokio::sync::Mutex<()> {
    DB_LOCK.get_or_init(|| tokio::sync::Mutex::new(()))
}

fn test_database_url() -> Option<String> {
    match std::env::var("NOMOS_TEST_DATABASE_URL") {
        Ok(url) if !url.trim().is_empty() => Some(url),
        _ => {
            eprintln!("skipping: NOMOS_TEST_DATABASE_URL not set");
            None
        }
    }
}

const SUBJECT_SCHEMA: &[&str] = &[
    r#"CREATE TABLE IF NOT EXISTS bill (
        bill_id BIGINT PRIMARY KEY,
        state TEXT NOT NULL,
        status TEXT NOT NULL,
        session_year_start INT,
        session_year_end INT,
        title TEXT NOT NULL,
        description TEXT NOT NULL,
        change_hash TEXT NOT NULL
    )"#,
    r#"CREATE TABLE IF NOT EXISTS bill_sponsor (
        bill_id BIGINT NOT NULL,
        name TEXT NOT NULL,
        party TEXT,
        sponsor_order INT NOT NULL
    )"#,
    r#"CREATE TABLE IF NOT EXISTS bill_subject (
        bill_id BIGINT NOT NULL,
        subject_name TEXT NOT NULL
    )"#,
    r#"CREATE TABLE IF NOT EXISTS bill_amendment (
        amendment_id BIGSERIAL PRIMARY KEY,
        bill_id BIGINT NOT NULL,
        title TEXT NOT NULL,
        description TEXT,
        adopted BOOLEAN NOT NULL DEFAULT false
    )"#,
    r#"CREATE TABLE IF NOT EXISTS bill_cluster (
        cluster_id UUID PRIMARY KEY,
        content_hash TEXT NOT NULL
    )"#,
    r#"CREATE TABLE IF NOT EXISTS cluster_bill (
        cluster_id UUID NOT NULL,
        bill_id BIGINT NOT NULL
    )"#,
    r#"CREATE TABLE IF NOT EXISTS bill_summary (
        bill_id BIGINT PRIMARY KEY,
        bill_number TEXT NOT NULL,
        state TEXT NOT NULL,
        title TEXT NOT NULL,
        description TEXT,
        status TEXT NOT NULL,
        primary_sponsor TEXT,
        sponsor_party TEXT,
        last_action TEXT
    )"#,
];

async fn setup(pool: &PgPool) {
    sqlx::migrate!("./migrations")
        .run(pool)
        .await
        .expect("migrations apply");
    for stmt in SUBJECT_SCHEMA {
        sqlx::query(stmt).execute(pool).await.expect("subject schema");
    }
    sqlx::query(
        r#"
        TRUNCATE analysis_job, batch_item, batch_progress,
                 subgroup_score, category_score, analysis_result,
                 bill, bill_sponsor, bill_subject, bill_amendment,
                 bill_cluster, cluster_bill, bill_summary
        RESTART IDENTITY CASCADE
        "#,
    )
    .execute(pool)
    .await
    .expect("truncate state");
}

async fn connect(url: &str) -> PgPool {
    PgPoolOptions::new()
        .max_connections(8)
        .connect(url)
        .await
        .expect("connect to test database")
}

const LONG_DESCRIPTION: &str = "An act relating to the establishment of a municipal broadband \
authority and the provision of construction grants to underserved rural communities throughout \
the state for open-access network deployment";

async fn seed_bill(pool: &PgPool, bill_id: i64, change_hash: &str) {
    sqlx::query(
        r#"
        INSERT INTO bill (bill_id, state, status, session_year_start, session_year_end,
                          title, description, change_hash)
        VALUES ($1, 'VT', 'Introduced', 2025, 2026, $2, $3, $4)
        "#,
    )
    .bind(bill_id)
    .bind(format!("H.{bill_id}"))
    .bind(LONG_DESCRIPTION)
    .bind(change_hash)
    .execute(pool)
    .await
    .expect("seed bill");
}

fn opts(limit: usize) -> ClaimOptions {
    ClaimOptions {
        limit,
        staleness_window: Duration::from_secs(3_600),
        random_order: false,
    }
}

fn scored_analysis(job_id: &str, bias: f64) -> JobAnalysis {
    JobAnalysis {
        job_id: job_id.to_string(),
        no_coherent_theme: false,
        explanation: None,
        overall: Some(OverallAssessment {
            bias_score: bias,
            benefit_score: 0.6,
            confidence: ConfidenceLabel::High,
            summary: "Expands rural broadband access.".to_string(),
        }),
        categories: vec![CategoryAssessment {
            category: DemographicCategory::Socioeconomic,
            bias_score: 0.1,
            benefit_score: 0.7,
            subgroups: vec![SubgroupAssessment {
                code: "LI".to_string(),
                bias_score: 0.1,
                benefit_score: 0.8,
                evidence: "Grant formula weights median household income.".to_string(),
            }],
        }],
    }
}

/// Success-only analyst echoing one scored analysis per claimed job.
struct EchoAnalyst;

#[async_trait]
impl AnalystClient for EchoAnalyst {
    async fn analyze(&self, batch: &[ClaimedJob]) -> Result<BatchAnalysis, ModelError> {
        Ok(BatchAnalysis {
            analyses: batch
                .iter()
                .map(|job| scored_analysis(&job.job_id, 0.2))
                .collect(),
            usage: TokenUsage::new(batch.len() as u64 * 120, batch.len() as u64 * 30),
        })
    }
}

async fn count(pool: &PgPool, sql: &str) -> i64 {
    sqlx::query_scalar(sql).fetch_one(pool).await.expect("count query")
}

async fn job_snapshot(pool: &PgPool) -> Vec<(String, String, i32)> {
    sqlx::query_as(
        r#"
        SELECT job_id, status, retry_count
        FROM analysis_job
        ORDER BY subject_kind, job_id
        "#,
    )
    .fetch_all(pool)
    .await
    .expect("job snapshot")
}

#[tokio::test]
async fn concurrent_claims_never_overlap() {
    let Some(url) = test_database_url() else { return };
    let _guard = db_lock().lock().await;
    let pool = connect(&url).await;
    setup(&pool).await;

    for bill_id in 1..=10 {
        seed_bill(&pool, bill_id, "h1").await;
    }
    let queue = PgWorkQueue::new(pool.clone(), 3);
    // Seed job rows up front so the concurrent claims race only on the
    // locked read, not on job creation.
    let seeded = queue
        .claim_batch(SubjectKind::Bill, opts(0))
        .await
        .expect("seeding claim");
    assert!(seeded.is_empty());

    let (left, right) = tokio::join!(
        queue.claim_batch(SubjectKind::Bill, opts(5)),
        queue.claim_batch(SubjectKind::Bill, opts(5)),
    );
    let left = left.expect("first claim");
    let right = right.expect("second claim");

    assert_eq!(left.len() + right.len(), 10);
    let mut all: Vec<&str> = left
        .iter()
        .chain(right.iter())
        .map(|job| job.job_id.as_str())
        .collect();
    all.sort_unstable();
    all.dedup();
    assert_eq!(all.len(), 10, "no job may be claimed twice");

    let processing = count(
        &pool,
        "SELECT COUNT(*) FROM analysis_job WHERE status = 'processing'",
    )
    .await;
    assert_eq!(processing, 10);
}

#[tokio::test]
async fn recovery_sweep_repends_without_counting_a_retry() {
    let Some(url) = test_database_url() else { return };
    let _guard = db_lock().lock().await;
    let pool = connect(&url).await;
    setup(&pool).await;

    seed_bill(&pool, 1, "h1").await;
    let queue = PgWorkQueue::new(pool.clone(), 3);
    let claimed = queue
        .claim_batch(SubjectKind::Bill, opts(5))
        .await
        .expect("claim");
    assert_eq!(claimed.len(), 1);

    // Simulated crash: the worker vanishes between claim and completion.
    let reset = queue.reset_stuck_jobs().await.expect("sweep");
    assert_eq!(reset, 1);

    let rows = job_snapshot(&pool).await;
    assert_eq!(rows.len(), 1);
    let (_, status, retry_count) = &rows[0];
    assert_eq!(status, "pending");
    assert_eq!(*retry_count, 0, "recovery is not a retry");

    let reclaimed = queue
        .claim_batch(SubjectKind::Bill, opts(5))
        .await
        .expect("reclaim");
    assert_eq!(reclaimed.len(), 1);
}

#[tokio::test]
async fn persist_twice_leaves_exactly_one_result_tree() {
    let Some(url) = test_database_url() else { return };
    let _guard = db_lock().lock().await;
    let pool = connect(&url).await;
    setup(&pool).await;

    seed_bill(&pool, 1, "h1").await;
    let queue = PgWorkQueue::new(pool.clone(), 3);
    let store = PgResultStore::new(pool.clone());
    let job = queue
        .claim_batch(SubjectKind::Bill, opts(5))
        .await
        .expect("claim")
        .pop()
        .expect("one job");

    let mut first = scored_analysis(&job.job_id, 0.9);
    first.categories.push(CategoryAssessment {
        category: DemographicCategory::Age,
        bias_score: 0.3,
        benefit_score: 0.4,
        subgroups: vec![SubgroupAssessment {
            code: "OA".to_string(),
            bias_score: 0.2,
            benefit_score: 0.5,
            evidence: "Senior broadband discounts in section 7.".to_string(),
        }],
    });
    store
        .persist(&job, &first, TokenUsage::new(100, 20))
        .await
        .expect("first persist");

    let second = scored_analysis(&job.job_id, 0.2);
    store
        .persist(&job, &second, TokenUsage::new(90, 15))
        .await
        .expect("second persist");

    assert_eq!(count(&pool, "SELECT COUNT(*) FROM analysis_result").await, 1);
    assert_eq!(count(&pool, "SELECT COUNT(*) FROM category_score").await, 1);
    assert_eq!(count(&pool, "SELECT COUNT(*) FROM subgroup_score").await, 1);

    let bias: f64 = sqlx::query_scalar("SELECT bias_score FROM analysis_result")
        .fetch_one(&pool)
        .await
        .expect("bias score");
    assert!((bias - 0.2).abs() < f64::EPSILON, "second result wins");

    let rows = job_snapshot(&pool).await;
    assert_eq!(rows[0].1, "completed");
}

#[tokio::test]
async fn dry_run_leaves_database_byte_identical() {
    let Some(url) = test_database_url() else { return };
    let _guard = db_lock().lock().await;
    let pool = connect(&url).await;
    setup(&pool).await;

    seed_bill(&pool, 1, "h1").await;
    seed_bill(&pool, 2, "h2").await;
    let queue = PgWorkQueue::new(pool.clone(), 3);
    // Seed job rows durably; the dry run itself must not create any.
    queue
        .claim_batch(SubjectKind::Bill, opts(0))
        .await
        .expect("seeding claim");

    let before = job_snapshot(&pool).await;
    assert_eq!(before.len(), 2);

    let summary = dry_run_once(&pool, &EchoAnalyst, &[SubjectKind::Bill], opts(5))
        .await
        .expect("dry run");
    assert_eq!(summary.claimed, 2);
    assert_eq!(summary.stats.completed, 2);

    let after = job_snapshot(&pool).await;
    assert_eq!(before, after, "job statuses must be untouched");
    assert_eq!(count(&pool, "SELECT COUNT(*) FROM analysis_result").await, 0);
    assert_eq!(count(&pool, "SELECT COUNT(*) FROM batch_progress").await, 0);
    assert_eq!(count(&pool, "SELECT COUNT(*) FROM batch_item").await, 0);
}

#[tokio::test]
async fn backlog_drain_completes_every_bill() {
    let Some(url) = test_database_url() else { return };
    let _guard = db_lock().lock().await;
    let pool = connect(&url).await;
    setup(&pool).await;

    for bill_id in 1..=3 {
        seed_bill(&pool, bill_id, "h1").await;
    }
    let queue = Arc::new(PgWorkQueue::new(pool.clone(), 3));
    let store = Arc::new(PgResultStore::new(pool.clone()));
    let processor = BatchProcessor::new(queue.clone(), Arc::new(EchoAnalyst), store);

    let summary = drain_backlog(queue, &processor, &[SubjectKind::Bill], opts(2))
        .await
        .expect("drain");

    assert_eq!(summary.claimed, 3);
    assert_eq!(summary.batches, 2);
    assert_eq!(summary.stats.completed, 3);

    let completed = count(
        &pool,
        "SELECT COUNT(*) FROM analysis_job WHERE status = 'completed'",
    )
    .await;
    assert_eq!(completed, 3);
    assert_eq!(count(&pool, "SELECT COUNT(*) FROM analysis_result").await, 3);
    let closed_batches = count(
        &pool,
        "SELECT COUNT(*) FROM batch_progress WHERE batch_state = 'completed'",
    )
    .await;
    assert_eq!(closed_batches, 2);
}

#[tokio::test]
async fn staleness_window_excludes_recent_failures() {
    let Some(url) = test_database_url() else { return };
    let _guard = db_lock().lock().await;
    let pool = connect(&url).await;
    setup(&pool).await;

    seed_bill(&pool, 1, "h1").await;
    let queue = PgWorkQueue::new(pool.clone(), 3);
    let job = queue
        .claim_batch(SubjectKind::Bill, opts(5))
        .await
        .expect("claim")
        .pop()
        .expect("one job");
    queue
        .record_failure(SubjectKind::Bill, &job.job_id, "endpoint timeout")
        .await
        .expect("record failure");

    // Freshly failed: excluded while the window is open.
    let within_window = queue
        .claim_batch(SubjectKind::Bill, opts(5))
        .await
        .expect("claim within window");
    assert!(within_window.is_empty());

    // A zero-length window readmits it immediately.
    let zero_window = ClaimOptions {
        staleness_window: Duration::ZERO,
        ..opts(5)
    };
    let reclaimed = queue
        .claim_batch(SubjectKind::Bill, zero_window)
        .await
        .expect("claim with zero window");
    assert_eq!(reclaimed.len(), 1);
    assert_eq!(reclaimed[0].retry_count, 1);
}

#[tokio::test]
async fn changed_fingerprint_repends_completed_job() {
    let Some(url) = test_database_url() else { return };
    let _guard = db_lock().lock().await;
    let pool = connect(&url).await;
    setup(&pool).await;

    seed_bill(&pool, 1, "h1").await;
    let queue = PgWorkQueue::new(pool.clone(), 3);
    let store = PgResultStore::new(pool.clone());
    let job = queue
        .claim_batch(SubjectKind::Bill, opts(5))
        .await
        .expect("claim")
        .pop()
        .expect("one job");
    store
        .persist(&job, &scored_analysis(&job.job_id, 0.2), TokenUsage::default())
        .await
        .expect("persist");

    // Same content: nothing to reclaim.
    let unchanged = queue
        .claim_batch(SubjectKind::Bill, opts(5))
        .await
        .expect("claim unchanged");
    assert!(unchanged.is_empty());

    // The subject changed upstream; the next claim re-pends and re-claims it.
    sqlx::query("UPDATE bill SET change_hash = 'h2' WHERE bill_id = 1")
        .execute(&pool)
        .await
        .expect("update hash");
    let reclaimed = queue
        .claim_batch(SubjectKind::Bill, opts(5))
        .await
        .expect("claim changed");
    assert_eq!(reclaimed.len(), 1);
    assert_eq!(reclaimed[0].change_fingerprint.as_deref(), Some("h2"));
}

#[tokio::test]
async fn cluster_backlog_round_trips() {
    let Some(url) = test_database_url() else { return };
    let _guard = db_lock().lock().await;
    let pool = connect(&url).await;
    setup(&pool).await;

    let cluster_id = Uuid::new_v4();
    sqlx::query("INSERT INTO bill_cluster (cluster_id, content_hash) VALUES ($1, 'c1')")
        .bind(cluster_id)
        .execute(&pool)
        .await
        .expect("seed cluster");
    for bill_id in 1..=2_i64 {
        sqlx::query(
            r#"
            INSERT INTO bill_summary (bill_id, bill_number, state, title, description,
                                      status, primary_sponsor, sponsor_party, last_action)
            VALUES ($1, $2, 'VT', 'An act relating to broadband', NULL,
                    'Introduced', 'A. Smith', 'D', 'Referred to committee')
            "#,
        )
        .bind(bill_id)
        .bind(format!("H.{bill_id}"))
        .execute(&pool)
        .await
        .expect("seed summary");
        sqlx::query("INSERT INTO cluster_bill (cluster_id, bill_id) VALUES ($1, $2)")
            .bind(cluster_id)
            .bind(bill_id)
            .execute(&pool)
            .await
            .expect("seed membership");
    }

    let queue = Arc::new(PgWorkQueue::new(pool.clone(), 3));
    let store = Arc::new(PgResultStore::new(pool.clone()));
    let processor = BatchProcessor::new(queue.clone(), Arc::new(EchoAnalyst), store);

    let summary = drain_backlog(queue, &processor, &[SubjectKind::Cluster], opts(5))
        .await
        .expect("drain clusters");

    assert_eq!(summary.claimed, 1);
    assert_eq!(summary.stats.completed, 1);
    let completed = count(
        &pool,
        "SELECT COUNT(*) FROM analysis_job WHERE subject_kind = 'cluster' AND status = 'completed'",
    )
    .await;
    assert_eq!(completed, 1);
}
