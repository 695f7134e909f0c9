//! Deployment resolution.
//!
//! Read-through cache from a model identifier (canonical or alias) to its
//! deployment snapshot. Hits live 24 hours; misses are negatively cached
//! for 5 minutes so unknown-model storms never reach the database.

use std::sync::Arc;

use crate::{
    cache::{Cache, CacheKeys},
    db::{DbResult, DeploymentRow, PgDeploymentStore},
    models::{Deployment, ProviderConfig},
    secrets::SecretBox,
};

const HIT_TTL_SECS: u64 = 24 * 60 * 60;
const MISS_TTL_SECS: u64 = 5 * 60;

/// Sentinel cached for models with no active deployment.
const NEGATIVE_SENTINEL: &str = "__none__";

pub struct DeploymentResolver {
    store: PgDeploymentStore,
    cache: Cache,
    secrets: SecretBox,
}

impl DeploymentResolver {
    pub fn new(store: PgDeploymentStore, cache: Cache, secrets: SecretBox) -> Self {
        Self {
            store,
            cache,
            secrets,
        }
    }

    /// Resolve a model or alias to its deployment. Cache errors degrade to
    /// a direct database read.
    pub async fn resolve(&self, model_or_alias: &str) -> DbResult<Option<Arc<Deployment>>> {
        let cache_key = CacheKeys::deployment(model_or_alias);

        match self.cache.get_string(&cache_key).await {
            Ok(Some(raw)) if raw == NEGATIVE_SENTINEL => return Ok(None),
            Ok(Some(raw)) => match serde_json::from_str::<Deployment>(&raw) {
                Ok(deployment) => return Ok(Some(Arc::new(deployment))),
                Err(e) => {
                    tracing::warn!(model = %model_or_alias, error = %e, "Evicting undecodable deployment cache entry");
                }
            },
            Ok(None) => {}
            Err(e) => {
                tracing::warn!(model = %model_or_alias, error = %e, "Deployment cache read failed; falling through to database");
            }
        }

        let row = self.store.resolve(model_or_alias).await?;
        match row {
            Some(row) => {
                let deployment = Arc::new(self.materialize(row));
                if let Ok(raw) = serde_json::to_string(deployment.as_ref())
                    && let Err(e) = self.cache.set_string(&cache_key, &raw, HIT_TTL_SECS).await
                {
                    tracing::warn!(model = %model_or_alias, error = %e, "Deployment cache write failed");
                }
                Ok(Some(deployment))
            }
            None => {
                if let Err(e) = self
                    .cache
                    .set_string(&cache_key, NEGATIVE_SENTINEL, MISS_TTL_SECS)
                    .await
                {
                    tracing::warn!(model = %model_or_alias, error = %e, "Negative cache write failed");
                }
                Ok(None)
            }
        }
    }

    /// Decrypt `encrypted_*` config fields and lift the row into the typed
    /// deployment snapshot.
    fn materialize(&self, row: DeploymentRow) -> Deployment {
        let raw_config = match row.config {
            serde_json::Value::Object(map) => map,
            _ => serde_json::Map::new(),
        };
        let decrypted = self.secrets.decrypt_config(raw_config);
        Deployment {
            id: row.id,
            model_id: row.model_id,
            provider: row.provider_name.clone(),
            deployment_name: row.deployment_name,
            input_cost_per_token: row.input_cost_per_token,
            output_cost_per_token: row.output_cost_per_token,
            config: ProviderConfig::from_parts(&row.provider_name, decrypted),
        }
    }

    /// Wildcard invalidation over every model-related cache namespace.
    pub async fn invalidate(&self) -> u64 {
        let mut removed = 0;
        for pattern in CacheKeys::INVALIDATION_PATTERNS {
            match self.cache.delete_pattern(pattern).await {
                Ok(n) => removed += n,
                Err(e) => {
                    tracing::warn!(pattern, error = %e, "Cache invalidation failed");
                }
            }
        }
        removed
    }
}
