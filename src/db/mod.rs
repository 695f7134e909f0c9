//! Transactional-store access.
//!
//! The gateway reads accounts, keys, and deployments; the only writer is
//! the settlement path in [`settlement`].

mod api_keys;
mod deployments;
mod settlement;

pub use api_keys::{ApiKeyStore, PgApiKeyStore};
pub use deployments::{DeploymentRow, PgDeploymentStore};
pub use settlement::SettlementWriter;
use thiserror::Error;

pub type DbPool = sqlx::PgPool;

#[derive(Debug, Error)]
pub enum DbError {
    #[error("Database error: {0}")]
    Sqlx(#[from] sqlx::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type DbResult<T> = Result<T, DbError>;

/// Connect a pool and run pending migrations.
pub async fn connect(database_url: &str) -> DbResult<DbPool> {
    let pool = sqlx::postgres::PgPoolOptions::new()
        .max_connections(10)
        .connect(database_url)
        .await?;
    sqlx::migrate!("./migrations").run(&pool).await.map_err(sqlx::Error::from)?;
    Ok(pool)
}
