//! Domain records: accounts, API keys, deployments, and the per-request
//! context the admission layer assembles.

use std::sync::Arc;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::FromRow;

/// Account tier treated as exempt from rate limiting.
pub const ENTERPRISE_TIER: &str = "ENTERPRISE";

#[derive(Debug, Clone, FromRow)]
pub struct Account {
    pub id: i64,
    pub tier: String,
    /// None means unlimited.
    pub budget_limit: Option<Decimal>,
    pub budget_used: Decimal,
    pub credits: Decimal,
    pub rate_limit_rpm: Option<i32>,
    /// Token-rate override; tracked in the schema, not enforced here.
    #[allow(dead_code)]
    pub rate_limit_tpm: Option<i32>,
}

impl Account {
    pub fn is_enterprise(&self) -> bool {
        self.tier == ENTERPRISE_TIER
    }

    pub fn over_budget(&self) -> bool {
        matches!(self.budget_limit, Some(limit) if self.budget_used >= limit)
    }
}

#[derive(Debug, Clone, FromRow)]
pub struct ApiKey {
    pub id: i64,
    #[allow(dead_code)]
    pub account_id: i64,
    pub active: bool,
    pub budget_limit: Option<Decimal>,
    pub budget_used: Decimal,
    /// Per-key rate overrides; tracked in the schema, limits key off the
    /// owning account.
    #[allow(dead_code)]
    pub rate_limit_rpm: Option<i32>,
    #[allow(dead_code)]
    pub rate_limit_tpm: Option<i32>,
    /// Opaque metadata map. The recognized flag is `type = "subscription"`.
    pub metadata: Value,
}

impl ApiKey {
    pub fn is_subscription(&self) -> bool {
        self.metadata.get("type").and_then(Value::as_str) == Some("subscription")
    }

    pub fn over_budget(&self) -> bool {
        matches!(self.budget_limit, Some(limit) if self.budget_used >= limit)
    }

    /// Subscription quota remaining on the key itself.
    pub fn under_subscription_quota(&self) -> bool {
        match self.budget_limit {
            Some(limit) => self.budget_used < limit,
            None => true,
        }
    }
}

/// The concrete upstream endpoint serving a logical model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Deployment {
    pub id: i64,
    /// Canonical model identifier.
    pub model_id: String,
    pub provider: String,
    /// Name the upstream knows the model by.
    pub deployment_name: String,
    pub input_cost_per_token: Decimal,
    pub output_cost_per_token: Decimal,
    pub config: ProviderConfig,
}

impl Deployment {
    /// Providers that natively speak the Anthropic Messages dialect.
    pub fn speaks_anthropic(&self) -> bool {
        matches!(self.config, ProviderConfig::Anthropic(_))
    }

    /// Confidential-enclave providers whose requests get fingerprinted for
    /// the signature endpoints.
    pub fn is_enclave(&self) -> bool {
        matches!(self.config, ProviderConfig::Phala(_))
    }

    pub fn endpoint(&self) -> &EndpointConfig {
        match &self.config {
            ProviderConfig::Anthropic(e)
            | ProviderConfig::OpenAiCompatible(e)
            | ProviderConfig::Phala(e) => e,
        }
    }
}

/// Typed view of a deployment's `config` JSON, keyed by provider family.
/// Fields the type does not know about survive in `extra`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "family", rename_all = "snake_case")]
pub enum ProviderConfig {
    Anthropic(EndpointConfig),
    OpenAiCompatible(EndpointConfig),
    /// Phala-family confidential-enclave endpoints; OpenAI dialect.
    Phala(EndpointConfig),
}

impl ProviderConfig {
    /// Build the typed config from a provider name and its decrypted
    /// config map. `base_url` and `api_key` are lifted out; the rest stays
    /// in the open map.
    pub fn from_parts(provider: &str, mut config: serde_json::Map<String, Value>) -> Self {
        let base_url = take_string(&mut config, "base_url");
        let api_key = take_string(&mut config, "api_key");
        let endpoint = EndpointConfig {
            base_url,
            api_key,
            extra: config,
        };
        let lower = provider.to_ascii_lowercase();
        if lower.contains("anthropic") {
            ProviderConfig::Anthropic(endpoint)
        } else if lower.starts_with("phala") {
            ProviderConfig::Phala(endpoint)
        } else {
            ProviderConfig::OpenAiCompatible(endpoint)
        }
    }
}

fn take_string(map: &mut serde_json::Map<String, Value>, key: &str) -> String {
    match map.remove(key) {
        Some(Value::String(s)) => s,
        _ => String::new(),
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EndpointConfig {
    pub base_url: String,
    /// Upstream credential, already decrypted.
    pub api_key: String,
    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    pub extra: serde_json::Map<String, Value>,
}

/// Which budget counters and credit pools a settlement affects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SpendMode {
    /// Charge the key and the account (budget and credits).
    Regular,
    /// Charge only the key's subscription budget.
    Subscription,
    /// Subscription key past quota, burning account credits.
    SubscriptionOverflow,
}

/// Everything the request path needs once admission has run.
#[derive(Debug, Clone)]
pub struct RequestContext {
    pub account: Option<Account>,
    pub key: Option<ApiKey>,
    pub deployment: Arc<Deployment>,
    /// Model string exactly as the caller sent it.
    pub requested_model: String,
    pub spend_mode: SpendMode,
    /// SHA-256 hex of the raw body, set for enclave-provider POSTs.
    pub request_hash: Option<String>,
}

/// One settled unit of usage, produced by the extractor and drained by the
/// spend worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UsageRecord {
    pub timestamp_ms: i64,
    pub endpoint: String,
    pub status: u16,
    pub duration_ms: i64,
    pub input_tokens: i64,
    pub output_tokens: i64,
    pub account_id: Option<i64>,
    pub key_id: Option<i64>,
    pub deployment_id: i64,
    pub provider: String,
    pub model: String,
    pub input_cost_per_token: Decimal,
    pub output_cost_per_token: Decimal,
    pub spend_mode: SpendMode,
}

impl UsageRecord {
    /// Cost in account currency units, exact decimal arithmetic.
    pub fn cost(&self) -> Decimal {
        Decimal::from(self.input_tokens) * self.input_cost_per_token
            + Decimal::from(self.output_tokens) * self.output_cost_per_token
    }
}

#[cfg(test)]
mod tests {
    use rust_decimal::dec;

    use super::*;

    fn key_with_metadata(metadata: Value) -> ApiKey {
        ApiKey {
            id: 1,
            account_id: 1,
            active: true,
            budget_limit: None,
            budget_used: Decimal::ZERO,
            rate_limit_rpm: None,
            rate_limit_tpm: None,
            metadata,
        }
    }

    #[test]
    fn subscription_flag_comes_from_metadata() {
        assert!(key_with_metadata(serde_json::json!({"type": "subscription"})).is_subscription());
        assert!(!key_with_metadata(serde_json::json!({"type": "team"})).is_subscription());
        assert!(!key_with_metadata(serde_json::json!({})).is_subscription());
        assert!(!key_with_metadata(Value::Null).is_subscription());
    }

    #[test]
    fn budget_checks_treat_none_as_unlimited() {
        let mut account = Account {
            id: 1,
            tier: "PRO".to_string(),
            budget_limit: None,
            budget_used: dec!(1000),
            credits: Decimal::ZERO,
            rate_limit_rpm: None,
            rate_limit_tpm: None,
        };
        assert!(!account.over_budget());
        account.budget_limit = Some(dec!(1000));
        assert!(account.over_budget());
        account.budget_limit = Some(dec!(1000.01));
        assert!(!account.over_budget());
    }

    #[test]
    fn provider_family_classification() {
        let cfg = |p: &str| ProviderConfig::from_parts(p, serde_json::Map::new());
        assert!(matches!(cfg("anthropic"), ProviderConfig::Anthropic(_)));
        assert!(matches!(cfg("phala-tdx"), ProviderConfig::Phala(_)));
        assert!(matches!(cfg("openrouter"), ProviderConfig::OpenAiCompatible(_)));
    }

    #[test]
    fn endpoint_fields_lift_out_of_config_map() {
        let mut map = serde_json::Map::new();
        map.insert("base_url".into(), Value::String("https://api.example".into()));
        map.insert("api_key".into(), Value::String("sk-up".into()));
        map.insert("region".into(), Value::String("us-east".into()));
        let config = ProviderConfig::from_parts("openrouter", map);
        let endpoint = match &config {
            ProviderConfig::OpenAiCompatible(e) => e,
            _ => panic!("wrong family"),
        };
        assert_eq!(endpoint.base_url, "https://api.example");
        assert_eq!(endpoint.api_key, "sk-up");
        assert_eq!(endpoint.extra["region"], "us-east");
    }

    #[test]
    fn usage_cost_is_exact() {
        let record = UsageRecord {
            timestamp_ms: 0,
            endpoint: "/v1/chat/completions".to_string(),
            status: 200,
            duration_ms: 10,
            input_tokens: 1000,
            output_tokens: 500,
            account_id: Some(1),
            key_id: Some(1),
            deployment_id: 1,
            provider: "openrouter".to_string(),
            model: "gpt-x".to_string(),
            input_cost_per_token: dec!(0.0000003),
            output_cost_per_token: dec!(0.0000006),
            spend_mode: SpendMode::Regular,
        };
        assert_eq!(record.cost(), dec!(0.0006));
    }
}
