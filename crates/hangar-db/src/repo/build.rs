//! Build repository.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use hangar_core::ResourceId;
use hangar_core::build::{Build, Commit, PullRequest};
use hangar_core::job::Job;
use hangar_core::query::BuildQuery;
use sqlx::PgPool;
use std::collections::HashMap;

use super::job::JobRow;
use crate::error::classify;
use crate::{DbError, DbResult};

/// A build row, without its jobs.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct BuildRow {
    pub id: uuid::Uuid,
    pub project_id: uuid::Uuid,
    pub number: i64,
    pub created_at: DateTime<Utc>,
    pub commit_branch: String,
    pub commit_sha: String,
    pub commit_author: String,
    pub commit_url: String,
    pub commit_tag: Option<String>,
    pub pr_number: Option<i64>,
    pub pr_branch: Option<String>,
    pub pr_slug: Option<String>,
    pub pr_url: Option<String>,
    pub env: Option<String>,
}

impl BuildRow {
    fn into_build(self, jobs: Vec<Job>) -> Build {
        let pull_request = self.pr_number.map(|number| PullRequest {
            number: u64::try_from(number).unwrap_or_default(),
            branch: self.pr_branch.unwrap_or_default(),
            slug: self.pr_slug.unwrap_or_default(),
            url: self.pr_url.unwrap_or_default(),
        });
        Build {
            id: self.id.into(),
            project_id: self.project_id.into(),
            number: u64::try_from(self.number).unwrap_or_default(),
            created_at: self.created_at,
            commit: Commit {
                branch: self.commit_branch,
                sha: self.commit_sha,
                author: self.commit_author,
                url: self.commit_url,
                tag: self.commit_tag,
            },
            pull_request,
            env: self.env,
            jobs,
        }
    }
}

#[async_trait]
pub trait BuildRepo: Send + Sync {
    /// Persist a build together with its jobs.
    ///
    /// Fails with `Duplicate` when the project already has a build with
    /// the same number.
    async fn create_build(&self, build: &Build) -> DbResult<()>;
    async fn get_build(&self, id: ResourceId) -> DbResult<Build>;
    async fn get_build_by_number(&self, project_id: ResourceId, number: u64) -> DbResult<Build>;
    /// Builds matching `query`, newest first.
    async fn list_builds(&self, project_id: ResourceId, query: &BuildQuery) -> DbResult<Vec<Build>>;
    async fn next_build_number(&self, project_id: ResourceId) -> DbResult<u64>;
    async fn latest_build(&self, project_id: ResourceId) -> DbResult<Option<Build>>;
}

/// PostgreSQL implementation of BuildRepo.
pub struct PgBuildRepo {
    pool: PgPool,
}

impl PgBuildRepo {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn attach_jobs(&self, rows: Vec<BuildRow>) -> DbResult<Vec<Build>> {
        if rows.is_empty() {
            return Ok(Vec::new());
        }

        let ids: Vec<uuid::Uuid> = rows.iter().map(|r| r.id).collect();
        let job_rows = sqlx::query_as::<_, JobRow>(
            "SELECT * FROM jobs WHERE build_id = ANY($1) ORDER BY build_id, number",
        )
        .bind(ids)
        .fetch_all(&self.pool)
        .await?;

        let mut by_build: HashMap<uuid::Uuid, Vec<Job>> = HashMap::new();
        for row in job_rows {
            let build_id = row.build_id;
            by_build.entry(build_id).or_default().push(row.try_into()?);
        }

        Ok(rows
            .into_iter()
            .map(|row| {
                let jobs = by_build.remove(&row.id).unwrap_or_default();
                row.into_build(jobs)
            })
            .collect())
    }

    async fn single(&self, row: Option<BuildRow>, what: impl FnOnce() -> String) -> DbResult<Build> {
        let row = row.ok_or_else(|| DbError::NotFound(what()))?;
        self.attach_jobs(vec![row])
            .await?
            .pop()
            .ok_or_else(|| DbError::NotFound("build vanished while loading jobs".to_string()))
    }
}

#[async_trait]
impl BuildRepo for PgBuildRepo {
    async fn create_build(&self, build: &Build) -> DbResult<()> {
        let mut tx = self.pool.begin().await?;
        let pr = build.pull_request.as_ref();

        sqlx::query(
            r#"
            INSERT INTO builds (id, project_id, number, created_at, commit_branch, commit_sha,
                                commit_author, commit_url, commit_tag, pr_number, pr_branch,
                                pr_slug, pr_url, env)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)
            "#,
        )
        .bind(build.id.as_uuid())
        .bind(build.project_id.as_uuid())
        .bind(i64::try_from(build.number).unwrap_or(i64::MAX))
        .bind(build.created_at)
        .bind(&build.commit.branch)
        .bind(&build.commit.sha)
        .bind(&build.commit.author)
        .bind(&build.commit.url)
        .bind(&build.commit.tag)
        .bind(pr.map(|p| i64::try_from(p.number).unwrap_or(i64::MAX)))
        .bind(pr.map(|p| p.branch.as_str()))
        .bind(pr.map(|p| p.slug.as_str()))
        .bind(pr.map(|p| p.url.as_str()))
        .bind(&build.env)
        .execute(&mut *tx)
        .await
        .map_err(|e| classify(e, || format!("build #{} of project {}", build.number, build.project_id)))?;

        for job in &build.jobs {
            sqlx::query(
                r#"
                INSERT INTO jobs (id, build_id, number, status, created_at, start_time,
                                  finish_time, slots, unit_id, unit_class, env, run_deploy, version)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
                "#,
            )
            .bind(job.id.as_uuid())
            .bind(build.id.as_uuid())
            .bind(i32::try_from(job.number).unwrap_or(i32::MAX))
            .bind(job.status.as_str())
            .bind(job.created_at)
            .bind(job.start_time)
            .bind(job.finish_time)
            .bind(i32::try_from(job.slots).unwrap_or(i32::MAX))
            .bind(job.unit.as_ref().map(|u| u.id.as_str()))
            .bind(job.unit.as_ref().map(|u| u.instance_class.as_str()))
            .bind(&job.env)
            .bind(job.run_deploy)
            .bind(i64::try_from(job.version).unwrap_or_default())
            .execute(&mut *tx)
            .await
            .map_err(|e| classify(e, || format!("job {} of build {}", job.number, build.id)))?;
        }

        tx.commit().await?;
        Ok(())
    }

    async fn get_build(&self, id: ResourceId) -> DbResult<Build> {
        let row = sqlx::query_as::<_, BuildRow>("SELECT * FROM builds WHERE id = $1")
            .bind(id.as_uuid())
            .fetch_optional(&self.pool)
            .await?;
        self.single(row, || format!("build {}", id)).await
    }

    async fn get_build_by_number(&self, project_id: ResourceId, number: u64) -> DbResult<Build> {
        let row = sqlx::query_as::<_, BuildRow>(
            "SELECT * FROM builds WHERE project_id = $1 AND number = $2",
        )
        .bind(project_id.as_uuid())
        .bind(i64::try_from(number).unwrap_or(i64::MAX))
        .fetch_optional(&self.pool)
        .await?;
        self.single(row, || format!("build #{} of project {}", number, project_id))
            .await
    }

    async fn list_builds(&self, project_id: ResourceId, query: &BuildQuery) -> DbResult<Vec<Build>> {
        // Derived status mirrors hangar_core::build::aggregate_status.
        let rows = sqlx::query_as::<_, BuildRow>(
            r#"
            WITH derived AS (
                SELECT b.*,
                    CASE
                        WHEN bool_or(j.status IN ('failure', 'error')) THEN 'failure'
                        WHEN bool_or(j.status IN ('starting', 'running')) THEN 'running'
                        WHEN bool_or(j.status = 'queued') THEN 'queued'
                        ELSE 'success'
                    END AS derived_status
                FROM builds b
                LEFT JOIN jobs j ON j.build_id = b.id
                WHERE b.project_id = $1
                GROUP BY b.id
            )
            SELECT * FROM derived
            WHERE ($2::text IS NULL OR commit_branch = $2)
              AND ($3::text IS NULL OR derived_status = $3)
              AND ($4::bigint IS NULL OR pr_number = $4)
            ORDER BY number DESC
            LIMIT $5 OFFSET $6
            "#,
        )
        .bind(project_id.as_uuid())
        .bind(query.branch.as_deref())
        .bind(query.status.map(|s| s.as_str()))
        .bind(query.pull_request.map(|n| i64::try_from(n).unwrap_or(i64::MAX)))
        .bind(i64::from(query.count))
        .bind(i64::try_from(query.offset()).unwrap_or(i64::MAX))
        .fetch_all(&self.pool)
        .await?;

        self.attach_jobs(rows).await
    }

    async fn next_build_number(&self, project_id: ResourceId) -> DbResult<u64> {
        let (max,): (Option<i64>,) =
            sqlx::query_as("SELECT MAX(number) FROM builds WHERE project_id = $1")
                .bind(project_id.as_uuid())
                .fetch_one(&self.pool)
                .await?;
        Ok(max.map(|n| u64::try_from(n).unwrap_or_default()).unwrap_or(0) + 1)
    }

    async fn latest_build(&self, project_id: ResourceId) -> DbResult<Option<Build>> {
        let row = sqlx::query_as::<_, BuildRow>(
            "SELECT * FROM builds WHERE project_id = $1 ORDER BY number DESC LIMIT 1",
        )
        .bind(project_id.as_uuid())
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => Ok(self.attach_jobs(vec![row]).await?.pop()),
            None => Ok(None),
        }
    }
}
