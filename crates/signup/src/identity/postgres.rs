//! `PostgreSQL` identity store.

use async_trait::async_trait;
use tokio_postgres::{Client, NoTls};
use tracing::{debug, error, info};

use super::{IdentityStore, RegistrationRequest};
use crate::error::StoreError;

/// No unique constraint on `openid`. Duplicates are kept out by the coordinator.
const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS users (
    id BIGSERIAL PRIMARY KEY,
    openid TEXT NOT NULL,
    username TEXT NOT NULL,
    password TEXT NOT NULL,
    created_at TIMESTAMPTZ NOT NULL DEFAULT now()
);
CREATE INDEX IF NOT EXISTS users_openid_idx ON users (openid);
";

const EXISTS_SQL: &str = "SELECT 1 FROM users WHERE openid = $1 LIMIT 1";
const INSERT_SQL: &str =
    "INSERT INTO users (openid, username, password) VALUES ($1, $2, $3) RETURNING id";

/// Identity store backed by a `users` table.
///
/// A single [`Client`] pipelines concurrent queries over one connection, so
/// it is shared across requests without a separate pool.
pub struct PgIdentityStore {
    client: Client,
}

impl PgIdentityStore {
    /// Connect and spawn the connection driver task.
    pub async fn connect(config: &tokio_postgres::Config) -> Result<Self, StoreError> {
        let (client, connection) = config
            .connect(NoTls)
            .await
            .map_err(|e| StoreError::Unreachable(e.to_string()))?;

        tokio::spawn(async move {
            if let Err(e) = connection.await {
                error!(error = %e, "Identity store connection closed");
            }
        });

        info!("Connected to identity store");
        Ok(Self { client })
    }

    /// Create the `users` table if it does not exist.
    pub async fn ensure_schema(&self) -> Result<(), StoreError> {
        self.client.batch_execute(SCHEMA).await?;
        debug!("Identity store schema ready");
        Ok(())
    }
}

#[async_trait]
impl IdentityStore for PgIdentityStore {
    fn backend(&self) -> &'static str {
        "postgres"
    }

    async fn exists(&self, openid: &str) -> Result<bool, StoreError> {
        let row = self.client.query_opt(EXISTS_SQL, &[&openid]).await?;
        Ok(row.is_some())
    }

    async fn create(&self, user: &RegistrationRequest) -> Result<i64, StoreError> {
        let row = self
            .client
            .query_one(INSERT_SQL, &[&user.openid, &user.username, &user.password])
            .await?;
        Ok(row.try_get(0)?)
    }
}
