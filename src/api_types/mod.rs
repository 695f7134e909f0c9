//! Wire types shared across the gateway.
//!
//! `openai` and `anthropic` hold the two dialects the bridge translates
//! between. This module holds the error envelope every caller-visible
//! failure is serialized into.

pub mod anthropic;
pub mod openai;

use serde::{Deserialize, Serialize};

/// Error envelope returned to callers: `{"error": {"message": ..., "type": ...}}`.
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: ErrorInfo,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorInfo {
    pub message: String,
    #[serde(rename = "type")]
    pub error_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
}

impl ErrorResponse {
    /// Plain gateway error with `type: "error"`.
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            error: ErrorInfo {
                message: message.into(),
                error_type: "error".to_string(),
                code: None,
            },
        }
    }

    /// Error with an explicit type and machine-readable code.
    pub fn with_type(
        error_type: impl Into<String>,
        code: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            error: ErrorInfo {
                message: message.into(),
                error_type: error_type.into(),
                code: Some(code.into()),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_envelope_shape() {
        let body = serde_json::to_value(ErrorResponse::new("Model parameter is required")).unwrap();
        assert_eq!(body["error"]["message"], "Model parameter is required");
        assert_eq!(body["error"]["type"], "error");
        assert!(body["error"].get("code").is_none());
    }

    #[test]
    fn rate_limit_envelope_carries_code() {
        let body = serde_json::to_value(ErrorResponse::with_type(
            "rate_limit_error",
            "rate_limit_exceeded",
            "Rate limit exceeded: 10 requests per minute",
        ))
        .unwrap();
        assert_eq!(body["error"]["type"], "rate_limit_error");
        assert_eq!(body["error"]["code"], "rate_limit_exceeded");
    }
}
