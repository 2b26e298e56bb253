//! Job repository.
//!
//! Every job write goes through [`JobRepo::compare_and_swap`], which only
//! succeeds when the stored version still matches the version the caller
//! read. Competing writers (the scheduler claiming, a callback completing,
//! a user canceling) detect each other through `DbError::Conflict`.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use hangar_core::ResourceId;
use hangar_core::job::{Job, UnitAssignment};
use sqlx::PgPool;

use crate::{DbError, DbResult};

/// A job row.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct JobRow {
    pub id: uuid::Uuid,
    pub build_id: uuid::Uuid,
    pub number: i32,
    pub status: String,
    pub created_at: DateTime<Utc>,
    pub start_time: Option<DateTime<Utc>>,
    pub finish_time: Option<DateTime<Utc>>,
    pub slots: i32,
    pub unit_id: Option<String>,
    pub unit_class: Option<String>,
    pub env: Option<String>,
    pub run_deploy: bool,
    pub version: i64,
}

impl TryFrom<JobRow> for Job {
    type Error = DbError;

    fn try_from(row: JobRow) -> DbResult<Self> {
        let unit = match (row.unit_id, row.unit_class) {
            (Some(id), Some(instance_class)) => Some(UnitAssignment {
                id: id.into(),
                instance_class,
            }),
            _ => None,
        };
        Ok(Job {
            id: row.id.into(),
            build_id: row.build_id.into(),
            number: u32::try_from(row.number).unwrap_or_default(),
            status: row.status.parse()?,
            created_at: row.created_at,
            start_time: row.start_time,
            finish_time: row.finish_time,
            slots: u32::try_from(row.slots).unwrap_or(1).max(1),
            unit,
            env: row.env,
            run_deploy: row.run_deploy,
            version: u64::try_from(row.version).unwrap_or_default(),
        })
    }
}

#[async_trait]
pub trait JobRepo: Send + Sync {
    async fn get_job(&self, id: ResourceId) -> DbResult<Job>;

    /// Queued jobs asking for at most `max_slots`, oldest build first, then
    /// by job number.
    async fn queued_jobs(&self, max_slots: u32, limit: usize) -> DbResult<Vec<Job>>;

    /// Jobs in `starting` or `running`.
    async fn active_jobs(&self) -> DbResult<Vec<Job>>;

    /// Write `job` if the stored version is still `expected_version`.
    ///
    /// Returns the stored job with its bumped version, `Conflict` when
    /// someone else wrote first.
    async fn compare_and_swap(&self, job: &Job, expected_version: u64) -> DbResult<Job>;
}

/// PostgreSQL implementation of JobRepo.
pub struct PgJobRepo {
    pool: PgPool,
}

impl PgJobRepo {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl JobRepo for PgJobRepo {
    async fn get_job(&self, id: ResourceId) -> DbResult<Job> {
        sqlx::query_as::<_, JobRow>("SELECT * FROM jobs WHERE id = $1")
            .bind(id.as_uuid())
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| DbError::NotFound(format!("job {}", id)))?
            .try_into()
    }

    async fn queued_jobs(&self, max_slots: u32, limit: usize) -> DbResult<Vec<Job>> {
        let rows = sqlx::query_as::<_, JobRow>(
            r#"
            SELECT j.* FROM jobs j
            JOIN builds b ON b.id = j.build_id
            WHERE j.status = 'queued' AND j.slots <= $1
            ORDER BY b.created_at ASC, b.number ASC, j.number ASC
            LIMIT $2
            "#,
        )
        .bind(i32::try_from(max_slots).unwrap_or(i32::MAX))
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(Job::try_from).collect()
    }

    async fn active_jobs(&self) -> DbResult<Vec<Job>> {
        let rows = sqlx::query_as::<_, JobRow>(
            "SELECT * FROM jobs WHERE status IN ('starting', 'running') ORDER BY created_at",
        )
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(Job::try_from).collect()
    }

    async fn compare_and_swap(&self, job: &Job, expected_version: u64) -> DbResult<Job> {
        let (unit_id, unit_class) = match &job.unit {
            Some(unit) => (Some(unit.id.as_str()), Some(unit.instance_class.as_str())),
            None => (None, None),
        };

        let row = sqlx::query_as::<_, JobRow>(
            r#"
            UPDATE jobs
            SET status = $3, start_time = $4, finish_time = $5, slots = $6,
                unit_id = $7, unit_class = $8, env = $9, run_deploy = $10,
                version = version + 1
            WHERE id = $1 AND version = $2
            RETURNING *
            "#,
        )
        .bind(job.id.as_uuid())
        .bind(i64::try_from(expected_version).unwrap_or(i64::MAX))
        .bind(job.status.as_str())
        .bind(job.start_time)
        .bind(job.finish_time)
        .bind(i32::try_from(job.slots).unwrap_or(i32::MAX))
        .bind(unit_id)
        .bind(unit_class)
        .bind(&job.env)
        .bind(job.run_deploy)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => row.try_into(),
            None => {
                let exists: Option<(i64,)> =
                    sqlx::query_as("SELECT version FROM jobs WHERE id = $1")
                        .bind(job.id.as_uuid())
                        .fetch_optional(&self.pool)
                        .await?;
                match exists {
                    Some((current,)) => Err(DbError::Conflict(format!(
                        "job {} is at version {}, expected {}",
                        job.id, current, expected_version
                    ))),
                    None => Err(DbError::NotFound(format!("job {}", job.id))),
                }
            }
        }
    }
}
