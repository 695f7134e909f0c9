//! Analytical-store sink.
//!
//! Spend rows append to ClickHouse over its HTTP interface in JSONEachRow
//! format, one POST per batch. The table definition lives in
//! `schema/clickhouse.sql`.

use rust_decimal::Decimal;
use serde::Serialize;
use thiserror::Error;

use crate::{config::ClickHouseConfig, models::UsageRecord};

#[derive(Debug, Error)]
pub enum SinkError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Insert rejected: {status}: {body}")]
    Rejected {
        status: reqwest::StatusCode,
        body: String,
    },

    #[error("Row encoding error: {0}")]
    Encode(#[from] serde_json::Error),
}

/// One analytical row. Costs-per-token ship as strings so ClickHouse
/// parses them into Decimal columns without float rounding.
#[derive(Debug, Serialize)]
pub struct SpendRow<'a> {
    pub timestamp: i64,
    pub endpoint: &'a str,
    pub duration_ms: i64,
    pub account_id: i64,
    pub key_id: i64,
    pub provider: &'a str,
    pub model: &'a str,
    pub deployment_id: i64,
    pub input_tokens: i64,
    pub output_tokens: i64,
    pub input_cost_per_token: Decimal,
    pub output_cost_per_token: Decimal,
}

impl<'a> SpendRow<'a> {
    pub fn from_record(record: &'a UsageRecord) -> Self {
        Self {
            timestamp: record.timestamp_ms,
            endpoint: &record.endpoint,
            duration_ms: record.duration_ms,
            account_id: record.account_id.unwrap_or_default(),
            key_id: record.key_id.unwrap_or_default(),
            provider: &record.provider,
            model: &record.model,
            deployment_id: record.deployment_id,
            input_tokens: record.input_tokens,
            output_tokens: record.output_tokens,
            input_cost_per_token: record.input_cost_per_token,
            output_cost_per_token: record.output_cost_per_token,
        }
    }
}

pub struct ClickHouseSink {
    http: reqwest::Client,
    config: ClickHouseConfig,
}

impl ClickHouseSink {
    pub fn new(http: reqwest::Client, config: ClickHouseConfig) -> Self {
        Self { http, config }
    }

    /// Append one row per record. Errors propagate so the worker can log
    /// the failed batch.
    pub async fn insert_spend_rows(&self, rows: &[SpendRow<'_>]) -> Result<(), SinkError> {
        if rows.is_empty() {
            return Ok(());
        }

        let mut body = String::new();
        for row in rows {
            body.push_str(&serde_json::to_string(row)?);
            body.push('\n');
        }

        let query = format!(
            "INSERT INTO {}.spend_logs FORMAT JSONEachRow",
            self.config.database
        );
        let mut request = self
            .http
            .post(&self.config.url)
            .query(&[("query", query.as_str())])
            .header(http::header::CONTENT_TYPE, "application/x-ndjson")
            .body(body);
        request = request.basic_auth(&self.config.username, self.config.password.as_ref());

        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(SinkError::Rejected { status, body });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use rust_decimal::dec;

    use super::*;
    use crate::models::SpendMode;

    #[test]
    fn rows_serialize_for_json_each_row() {
        let record = UsageRecord {
            timestamp_ms: 1_730_000_000_000,
            endpoint: "/v1/chat/completions".to_string(),
            status: 200,
            duration_ms: 512,
            input_tokens: 100,
            output_tokens: 10,
            account_id: Some(4),
            key_id: Some(9),
            deployment_id: 2,
            provider: "openrouter".to_string(),
            model: "gpt-x".to_string(),
            input_cost_per_token: dec!(0.0000003),
            output_cost_per_token: dec!(0.0000015),
            spend_mode: SpendMode::Regular,
        };
        let row = serde_json::to_value(SpendRow::from_record(&record)).unwrap();
        assert_eq!(row["timestamp"], 1_730_000_000_000i64);
        assert_eq!(row["account_id"], 4);
        assert_eq!(row["input_cost_per_token"], "0.0000003");
        assert!(row.get("spend_mode").is_none());
    }
}
