use async_trait::async_trait;

use super::{DbPool, DbResult};
use crate::models::{Account, ApiKey};

/// Resolver from a key hash to the key record and its owning account.
#[async_trait]
pub trait ApiKeyStore: Send + Sync {
    /// Look up an API key by the lowercase SHA-256 hex of its token.
    /// Returns None for unknown hashes; inactive keys are returned so the
    /// caller can distinguish "revoked" from "never existed".
    async fn find_by_hash(&self, key_hash: &str) -> DbResult<Option<(ApiKey, Account)>>;
}

pub struct PgApiKeyStore {
    pool: DbPool,
}

impl PgApiKeyStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

#[derive(sqlx::FromRow)]
struct KeyWithAccountRow {
    key_id: i64,
    account_id: i64,
    active: bool,
    key_budget_limit: Option<rust_decimal::Decimal>,
    key_budget_used: rust_decimal::Decimal,
    key_rate_limit_rpm: Option<i32>,
    key_rate_limit_tpm: Option<i32>,
    metadata: serde_json::Value,
    tier: String,
    account_budget_limit: Option<rust_decimal::Decimal>,
    account_budget_used: rust_decimal::Decimal,
    credits: rust_decimal::Decimal,
    account_rate_limit_rpm: Option<i32>,
    account_rate_limit_tpm: Option<i32>,
}

#[async_trait]
impl ApiKeyStore for PgApiKeyStore {
    async fn find_by_hash(&self, key_hash: &str) -> DbResult<Option<(ApiKey, Account)>> {
        let row: Option<KeyWithAccountRow> = sqlx::query_as(
            r#"
            SELECT
                k.id AS key_id,
                k.account_id,
                k.active,
                k.budget_limit AS key_budget_limit,
                k.budget_used AS key_budget_used,
                k.rate_limit_rpm AS key_rate_limit_rpm,
                k.rate_limit_tpm AS key_rate_limit_tpm,
                COALESCE(k.metadata, '{}'::jsonb) AS metadata,
                a.tier,
                a.budget_limit AS account_budget_limit,
                a.budget_used AS account_budget_used,
                a.credits,
                a.rate_limit_rpm AS account_rate_limit_rpm,
                a.rate_limit_tpm AS account_rate_limit_tpm
            FROM api_keys k
            JOIN accounts a ON a.id = k.account_id
            WHERE k.api_key_hash = $1
            "#,
        )
        .bind(key_hash)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|r| {
            let key = ApiKey {
                id: r.key_id,
                account_id: r.account_id,
                active: r.active,
                budget_limit: r.key_budget_limit,
                budget_used: r.key_budget_used,
                rate_limit_rpm: r.key_rate_limit_rpm,
                rate_limit_tpm: r.key_rate_limit_tpm,
                metadata: r.metadata,
            };
            let account = Account {
                id: r.account_id,
                tier: r.tier,
                budget_limit: r.account_budget_limit,
                budget_used: r.account_budget_used,
                credits: r.credits,
                rate_limit_rpm: r.account_rate_limit_rpm,
                rate_limit_tpm: r.account_rate_limit_tpm,
            };
            (key, account)
        }))
    }
}
