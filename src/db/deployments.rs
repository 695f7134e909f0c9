use super::{DbPool, DbResult};

/// Raw deployment row before config decryption. One query resolves a model
/// identifier or alias to its active deployment.
#[derive(Debug, sqlx::FromRow)]
pub struct DeploymentRow {
    pub id: i64,
    pub model_id: String,
    pub provider_name: String,
    pub deployment_name: String,
    pub config: serde_json::Value,
    pub input_cost_per_token: rust_decimal::Decimal,
    pub output_cost_per_token: rust_decimal::Decimal,
}

pub struct PgDeploymentStore {
    pool: DbPool,
}

impl PgDeploymentStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    /// Resolve by canonical model id or alias. All three relations must be
    /// active; at most one deployment matches.
    pub async fn resolve(&self, model_or_alias: &str) -> DbResult<Option<DeploymentRow>> {
        let row = sqlx::query_as(
            r#"
            SELECT
                d.id,
                m.model_id,
                d.provider_name,
                d.deployment_name,
                d.config,
                d.input_cost_per_token,
                d.output_cost_per_token
            FROM deployments d
            JOIN models m ON m.id = d.model_id
            LEFT JOIN model_aliases al ON al.model_id = m.id AND al.active
            WHERE d.active
              AND m.active
              AND (m.model_id = $1 OR al.alias = $1)
            LIMIT 1
            "#,
        )
        .bind(model_or_alias)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    /// Active deployments for the model listing, optionally filtered by
    /// provider.
    pub async fn list_active(&self, provider: Option<&str>) -> DbResult<Vec<(String, String)>> {
        let rows: Vec<(String, String)> = sqlx::query_as(
            r#"
            SELECT m.model_id, d.provider_name
            FROM deployments d
            JOIN models m ON m.id = d.model_id
            WHERE d.active AND m.active
              AND ($1::text IS NULL OR d.provider_name = $1)
            ORDER BY m.model_id
            "#,
        )
        .bind(provider)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }
}
