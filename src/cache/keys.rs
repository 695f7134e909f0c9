//! Every redis key format in one place.

pub struct CacheKeys;

impl CacheKeys {
    /// Deployment resolution cache: model-deployment:{model_or_alias}
    pub fn deployment(model: &str) -> String {
        format!("model-deployment:{model}")
    }

    /// Rate-limit window counter: ratelimit:{account_id}:{window_index}
    pub fn rate_window(account_id: i64, window: u64) -> String {
        format!("ratelimit:{account_id}:{window}")
    }

    /// Durable FIFO of encoded usage records.
    pub const SPEND_QUEUE: &'static str = "spend:queue";

    /// Drain lease for the spend worker.
    pub const SPEND_LOCK: &'static str = "spend:lock";

    /// Patterns cleared when model configuration changes.
    pub const INVALIDATION_PATTERNS: [&'static str; 3] =
        ["models:*", "embedding-models:*", "model-deployment:*"];
}
