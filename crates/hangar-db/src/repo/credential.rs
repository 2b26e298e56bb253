//! PostgreSQL-backed credential store.

use async_trait::async_trait;
use hangar_core::credential::{CredentialKey, CredentialStore};
use sqlx::PgPool;
use tracing::error;

pub struct PgCredentialStore {
    pool: PgPool,
}

impl PgCredentialStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

// Storage failures are logged and treated as a missing credential, so
// callers fail fast with an auth error instead of hanging on retries.
#[async_trait]
impl CredentialStore for PgCredentialStore {
    async fn token(&self, key: &CredentialKey) -> Option<String> {
        let result: Result<Option<(String,)>, sqlx::Error> =
            sqlx::query_as("SELECT token FROM credentials WHERE key = $1")
                .bind(key.to_string())
                .fetch_optional(&self.pool)
                .await;
        match result {
            Ok(row) => row.map(|(token,)| token),
            Err(e) => {
                error!(credential = %key, error = %e, "failed to load credential");
                None
            }
        }
    }

    async fn set(&self, key: CredentialKey, token: String) {
        let result = sqlx::query(
            r#"
            INSERT INTO credentials (key, token, updated_at)
            VALUES ($1, $2, NOW())
            ON CONFLICT (key) DO UPDATE SET token = EXCLUDED.token, updated_at = NOW()
            "#,
        )
        .bind(key.to_string())
        .bind(token)
        .execute(&self.pool)
        .await;
        if let Err(e) = result {
            error!(credential = %key, error = %e, "failed to store credential");
        }
    }

    async fn invalidate(&self, key: &CredentialKey) {
        let result = sqlx::query("DELETE FROM credentials WHERE key = $1")
            .bind(key.to_string())
            .execute(&self.pool)
            .await;
        if let Err(e) = result {
            error!(credential = %key, error = %e, "failed to invalidate credential");
        }
    }
}
