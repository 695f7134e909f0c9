//! Usage settlement pipeline.
//!
//! Records flow extractor -> queue -> worker -> (budgets, analytical
//! store). The queue is a redis list so any replica can enqueue and a
//! single leased worker drains.

mod sink;
mod worker;

use async_trait::async_trait;
use base64::{Engine, engine::general_purpose::STANDARD as BASE64};
pub use sink::ClickHouseSink;
use thiserror::Error;
pub use worker::SpendWorker;

use crate::{
    cache::{Cache, CacheKeys},
    models::UsageRecord,
};

#[derive(Debug, Error)]
pub enum SpendError {
    #[error("Encode error: {0}")]
    Encode(#[from] rmp_serde::encode::Error),

    #[error("Decode error: {0}")]
    Decode(#[from] rmp_serde::decode::Error),

    #[error("Invalid base64: {0}")]
    Base64(#[from] base64::DecodeError),

    #[error("Cache error: {0}")]
    Cache(#[from] crate::cache::CacheError),
}

/// Accepts usage records for asynchronous settlement. The extractor calls
/// this from stream flush paths, so implementations must never fail the
/// request: errors are logged and the record is dropped.
#[async_trait]
pub trait UsageEnqueue: Send + Sync {
    async fn enqueue(&self, record: UsageRecord);
}

/// Durable FIFO in the shared key-value store.
pub struct SpendQueue {
    cache: Cache,
}

impl SpendQueue {
    pub fn new(cache: Cache) -> Self {
        Self { cache }
    }

    pub fn encode(record: &UsageRecord) -> Result<String, SpendError> {
        let packed = rmp_serde::to_vec(record)?;
        Ok(BASE64.encode(packed))
    }

    pub fn decode(raw: &str) -> Result<UsageRecord, SpendError> {
        let packed = BASE64.decode(raw)?;
        Ok(rmp_serde::from_slice(&packed)?)
    }

    async fn push(&self, record: &UsageRecord) -> Result<(), SpendError> {
        let encoded = Self::encode(record)?;
        self.cache.lpush(CacheKeys::SPEND_QUEUE, &encoded).await?;
        Ok(())
    }
}

#[async_trait]
impl UsageEnqueue for SpendQueue {
    async fn enqueue(&self, record: UsageRecord) {
        if let Err(e) = self.push(&record).await {
            tracing::warn!(
                error = %e,
                model = %record.model,
                key_id = ?record.key_id,
                "Failed to enqueue usage record; dropping"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use rust_decimal::dec;

    use super::*;
    use crate::models::SpendMode;

    #[test]
    fn records_survive_the_wire_encoding() {
        let record = UsageRecord {
            timestamp_ms: 1_730_000_000_123,
            endpoint: "/v1/messages".to_string(),
            status: 200,
            duration_ms: 840,
            input_tokens: 1200,
            output_tokens: 64,
            account_id: Some(7),
            key_id: Some(21),
            deployment_id: 3,
            provider: "openrouter".to_string(),
            model: "openrouter/llama".to_string(),
            input_cost_per_token: dec!(0.0000002),
            output_cost_per_token: dec!(0.0000009),
            spend_mode: SpendMode::SubscriptionOverflow,
        };
        let decoded = SpendQueue::decode(&SpendQueue::encode(&record).unwrap()).unwrap();
        assert_eq!(decoded.timestamp_ms, record.timestamp_ms);
        assert_eq!(decoded.input_tokens, 1200);
        assert_eq!(decoded.input_cost_per_token, dec!(0.0000002));
        assert_eq!(decoded.spend_mode, SpendMode::SubscriptionOverflow);
        assert_eq!(decoded.cost(), record.cost());
    }

    #[test]
    fn decode_rejects_garbage() {
        assert!(SpendQueue::decode("!!!not-base64!!!").is_err());
        assert!(SpendQueue::decode(&BASE64.encode(b"not msgpack")).is_err());
    }
}
