//! Project repository.

use async_trait::async_trait;
use hangar_core::ResourceId;
use hangar_core::project::{Project, SourceHost, Webhook};
use sqlx::PgPool;

use crate::error::classify;
use crate::{DbError, DbResult};

/// A project row.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct ProjectRow {
    pub id: uuid::Uuid,
    pub account_id: uuid::Uuid,
    pub host: String,
    pub owner: String,
    pub name: String,
    pub remote_id: i64,
    pub default_branch: String,
    pub private: bool,
    pub secret_env: Option<String>,
    pub deploy_on: String,
    pub deploy_branch: String,
    pub active: bool,
    pub webhook_id: Option<String>,
    pub webhook_secret: Option<String>,
}

impl TryFrom<ProjectRow> for Project {
    type Error = DbError;

    fn try_from(row: ProjectRow) -> DbResult<Self> {
        let webhook = match (row.webhook_id, row.webhook_secret) {
            (Some(id), Some(secret)) => Some(Webhook { id, secret }),
            _ => None,
        };
        Ok(Project {
            id: row.id.into(),
            account_id: row.account_id.into(),
            host: row.host.parse()?,
            owner: row.owner,
            name: row.name,
            remote_id: row.remote_id,
            default_branch: row.default_branch,
            private: row.private,
            secret_env: row.secret_env,
            deploy_on: row.deploy_on.parse()?,
            deploy_branch: row.deploy_branch,
            active: row.active,
            webhook,
        })
    }
}

#[async_trait]
pub trait ProjectRepo: Send + Sync {
    async fn create_project(&self, project: &Project) -> DbResult<()>;
    async fn get_project(&self, id: ResourceId) -> DbResult<Project>;
    async fn get_project_by_remote(&self, host: SourceHost, remote_id: i64) -> DbResult<Project>;
    /// Overwrite the mutable project fields: names, branch, privacy, secrets,
    /// deploy policy and webhook.
    async fn update_project(&self, project: &Project) -> DbResult<()>;
    async fn list_projects(&self) -> DbResult<Vec<Project>>;
}

/// PostgreSQL implementation of ProjectRepo.
pub struct PgProjectRepo {
    pool: PgPool,
}

impl PgProjectRepo {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ProjectRepo for PgProjectRepo {
    async fn create_project(&self, project: &Project) -> DbResult<()> {
        sqlx::query(
            r#"
            INSERT INTO projects (id, account_id, host, owner, name, remote_id, default_branch,
                                  private, secret_env, deploy_on, deploy_branch,
                                  active, webhook_id, webhook_secret)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)
            "#,
        )
        .bind(project.id.as_uuid())
        .bind(project.account_id.as_uuid())
        .bind(project.host.tag())
        .bind(&project.owner)
        .bind(&project.name)
        .bind(project.remote_id)
        .bind(&project.default_branch)
        .bind(project.private)
        .bind(&project.secret_env)
        .bind(project.deploy_on.as_str())
        .bind(&project.deploy_branch)
        .bind(project.active)
        .bind(project.webhook.as_ref().map(|w| &w.id))
        .bind(project.webhook.as_ref().map(|w| &w.secret))
        .execute(&self.pool)
        .await
        .map_err(|e| classify(e, || format!("project {}", project.slug())))?;
        Ok(())
    }

    async fn get_project(&self, id: ResourceId) -> DbResult<Project> {
        sqlx::query_as::<_, ProjectRow>("SELECT * FROM projects WHERE id = $1")
            .bind(id.as_uuid())
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| DbError::NotFound(format!("project {}", id)))?
            .try_into()
    }

    async fn get_project_by_remote(&self, host: SourceHost, remote_id: i64) -> DbResult<Project> {
        sqlx::query_as::<_, ProjectRow>("SELECT * FROM projects WHERE host = $1 AND remote_id = $2")
            .bind(host.tag())
            .bind(remote_id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| DbError::NotFound(format!("project {}:{}", host, remote_id)))?
            .try_into()
    }

    async fn update_project(&self, project: &Project) -> DbResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE projects
            SET owner = $2, name = $3, default_branch = $4, private = $5,
                secret_env = $6, deploy_on = $7, deploy_branch = $8,
                active = $9, webhook_id = $10, webhook_secret = $11
            WHERE id = $1
            "#,
        )
        .bind(project.id.as_uuid())
        .bind(&project.owner)
        .bind(&project.name)
        .bind(&project.default_branch)
        .bind(project.private)
        .bind(&project.secret_env)
        .bind(project.deploy_on.as_str())
        .bind(&project.deploy_branch)
        .bind(project.active)
        .bind(project.webhook.as_ref().map(|w| &w.id))
        .bind(project.webhook.as_ref().map(|w| &w.secret))
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(DbError::NotFound(format!("project {}", project.id)));
        }
        Ok(())
    }

    async fn list_projects(&self) -> DbResult<Vec<Project>> {
        let rows = sqlx::query_as::<_, ProjectRow>("SELECT * FROM projects ORDER BY owner, name")
            .fetch_all(&self.pool)
            .await?;
        rows.into_iter().map(Project::try_from).collect()
    }
}
