//! Read-only subject profiles.
//!
//! The pipeline analyzes two kinds of subject: individual bills and clusters
//! of related bills. Subject tables are owned by the surrounding application;
//! everything here reads them and never writes.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use sqlx::{PgConnection, Row};
use strum::{AsRefStr, EnumIter, EnumString};
use uuid::Uuid;

/// Which subject table a job points at.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, EnumString, AsRefStr, EnumIter, Serialize, Deserialize,
)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum SubjectKind {
    Bill,
    Cluster,
}

impl SubjectKind {
    pub fn slug(self) -> &'static str {
        match self {
            SubjectKind::Bill => "bill",
            SubjectKind::Cluster => "cluster",
        }
    }
}

/// Serialized into the user message of the completion request, one entry per
/// job in the batch.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SubjectProfile {
    Bill(BillProfile),
    Cluster(ClusterProfile),
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct BillProfile {
    pub bill_id: String,
    pub state: String,
    pub status: String,
    pub session_year_start: Option<i32>,
    pub session_year_end: Option<i32>,
    pub title: String,
    pub description: String,
    pub sponsors: Vec<SponsorRef>,
    pub subjects: Vec<String>,
    pub amendments: Vec<AmendmentRef>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct SponsorRef {
    pub name: String,
    pub party: Option<String>,
    pub role: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct AmendmentRef {
    pub title: String,
    pub description: Option<String>,
    pub adopted: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct ClusterProfile {
    pub cluster_id: String,
    pub bills: Vec<ClusterBillRef>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct ClusterBillRef {
    pub bill_number: String,
    pub state: String,
    pub title: String,
    pub description: Option<String>,
    pub status: String,
    pub primary_sponsor: Option<String>,
    pub sponsor_party: Option<String>,
    pub last_action: Option<String>,
}

#[derive(Debug, thiserror::Error)]
pub enum SubjectError {
    #[error(transparent)]
    Db(#[from] sqlx::Error),
    #[error("subject `{kind}/{job_id}` not found")]
    NotFound { kind: &'static str, job_id: String },
    #[error("invalid {kind} id `{job_id}`")]
    InvalidId { kind: &'static str, job_id: String },
}

/// Load the profile backing a claimed job.
pub async fn load_profile(
    conn: &mut PgConnection,
    kind: SubjectKind,
    job_id: &str,
) -> Result<SubjectProfile, SubjectError> {
    match kind {
        SubjectKind::Bill => load_bill_profile(conn, job_id).await.map(SubjectProfile::Bill),
        SubjectKind::Cluster => load_cluster_profile(conn, job_id)
            .await
            .map(SubjectProfile::Cluster),
    }
}

async fn load_bill_profile(
    conn: &mut PgConnection,
    job_id: &str,
) -> Result<BillProfile, SubjectError> {
    let bill_id: i64 = job_id.parse().map_err(|_| SubjectError::InvalidId {
        kind: "bill",
        job_id: job_id.to_string(),
    })?;

    let row = sqlx::query(
        r#"
        SELECT state, status, session_year_start, session_year_end, title, description
        FROM bill
        WHERE bill_id = $1
        "#,
    )
    .bind(bill_id)
    .fetch_optional(&mut *conn)
    .await?
    .ok_or_else(|| SubjectError::NotFound {
        kind: "bill",
        job_id: job_id.to_string(),
    })?;

    let sponsors = sqlx::query(
        r#"
        SELECT name, party, sponsor_order
        FROM bill_sponsor
        WHERE bill_id = $1
        ORDER BY sponsor_order ASC
        "#,
    )
    .bind(bill_id)
    .fetch_all(&mut *conn)
    .await?
    .into_iter()
    .map(|r| SponsorRef {
        name: r.get("name"),
        party: r.get("party"),
        role: if r.get::<i32, _>("sponsor_order") == 1 {
            "primary_sponsor".to_string()
        } else {
            "co_sponsor".to_string()
        },
    })
    .collect();

    let subjects = sqlx::query(
        r#"
        SELECT subject_name
        FROM bill_subject
        WHERE bill_id = $1
        ORDER BY subject_name ASC
        "#,
    )
    .bind(bill_id)
    .fetch_all(&mut *conn)
    .await?
    .into_iter()
    .map(|r| r.get("subject_name"))
    .collect();

    let amendments = sqlx::query(
        r#"
        SELECT title, description, adopted
        FROM bill_amendment
        WHERE bill_id = $1
        ORDER BY amendment_id ASC
        "#,
    )
    .bind(bill_id)
    .fetch_all(&mut *conn)
    .await?
    .into_iter()
    .map(|r| AmendmentRef {
        title: r.get("title"),
        description: r.get("description"),
        adopted: r.get("adopted"),
    })
    .collect();

    Ok(BillProfile {
        bill_id: job_id.to_string(),
        state: row.get("state"),
        status: row.get("status"),
        session_year_start: row.get("session_year_start"),
        session_year_end: row.get("session_year_end"),
        title: row.get("title"),
        description: row.get("description"),
        sponsors,
        subjects,
        amendments,
    })
}

async fn load_cluster_profile(
    conn: &mut PgConnection,
    job_id: &str,
) -> Result<ClusterProfile, SubjectError> {
    let cluster_id: Uuid = job_id.parse().map_err(|_| SubjectError::InvalidId {
        kind: "cluster",
        job_id: job_id.to_string(),
    })?;

    let rows = sqlx::query(
        r#"
        SELECT b.bill_number, b.state, b.title,
               NULLIF(b.description, b.title) AS description,
               b.status, b.primary_sponsor, b.sponsor_party, b.last_action
        FROM cluster_bill cb
        JOIN bill_summary b ON b.bill_id = cb.bill_id
        WHERE cb.cluster_id = $1
        ORDER BY b.state, b.bill_number
        "#,
    )
    .bind(cluster_id)
    .fetch_all(&mut *conn)
    .await?;

    if rows.is_empty() {
        return Err(SubjectError::NotFound {
            kind: "cluster",
            job_id: job_id.to_string(),
        });
    }

    let bills = rows
        .into_iter()
        .map(|r| ClusterBillRef {
            bill_number: r.get("bill_number"),
            state: r.get("state"),
            title: r.get("title"),
            description: r.get("description"),
            status: r.get("status"),
            primary_sponsor: r.get("primary_sponsor"),
            sponsor_party: r.get("sponsor_party"),
            last_action: r.get("last_action"),
        })
        .collect();

    Ok(ClusterProfile {
        cluster_id: job_id.to_string(),
        bills,
    })
}
