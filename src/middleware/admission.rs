//! Admission: identity, budget gates, and deployment selection.
//!
//! Runs before everything else on the proxied surface. Produces a
//! [`RequestContext`] in the request extensions or fails fast with the
//! caller-visible error taxonomy. The request body is buffered here once;
//! downstream handlers reuse the same bytes.

use std::{collections::HashMap, sync::Arc};

use axum::{
    Json,
    body::Body,
    extract::{Query, Request, State},
    http::{Method, StatusCode, header},
    middleware::Next,
    response::{IntoResponse, Response},
};
use http_body_util::BodyExt;
use sha2::{Digest, Sha256};

use crate::{
    AppState,
    api_types::ErrorResponse,
    models::{Account, ApiKey, RequestContext, SpendMode},
};

/// Paths admitted without authentication or budget checks.
const PUBLIC_PREFIXES: [&str; 2] = ["/v1/attestation/report", "/v1/signature/"];

#[derive(Debug, PartialEq, Eq)]
pub enum AdmissionError {
    MissingModel,
    InvalidKey,
    SubscriptionQuotaExceeded,
    AccountQuotaExceeded,
    KeyQuotaExceeded,
    ModelRequiresKey,
    ModelUnavailable(String),
    Internal,
}

impl IntoResponse for AdmissionError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            AdmissionError::MissingModel => {
                (StatusCode::BAD_REQUEST, "Model parameter is required".to_string())
            }
            AdmissionError::InvalidKey => {
                (StatusCode::UNAUTHORIZED, "Invalid API key provided".to_string())
            }
            AdmissionError::SubscriptionQuotaExceeded => (
                StatusCode::PAYMENT_REQUIRED,
                "Subscription quota exceeded".to_string(),
            ),
            AdmissionError::AccountQuotaExceeded => (
                StatusCode::PAYMENT_REQUIRED,
                "Account quota exceeded. Please add credits to continue.".to_string(),
            ),
            AdmissionError::KeyQuotaExceeded => (
                StatusCode::PAYMENT_REQUIRED,
                "API key quota exceeded".to_string(),
            ),
            AdmissionError::ModelRequiresKey => (
                StatusCode::FORBIDDEN,
                "This model requires an API key".to_string(),
            ),
            AdmissionError::ModelUnavailable(model) => (
                StatusCode::NOT_FOUND,
                format!("Model '{model}' is not available"),
            ),
            AdmissionError::Internal => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "Service temporarily unavailable".to_string(),
            ),
        };
        (status, Json(ErrorResponse::new(message))).into_response()
    }
}

pub fn is_public_path(path: &str) -> bool {
    PUBLIC_PREFIXES.iter().any(|prefix| path.starts_with(prefix))
}

/// `model` from a JSON POST body.
pub fn model_from_body(body: &[u8]) -> Option<String> {
    let value: serde_json::Value = serde_json::from_slice(body).ok()?;
    value.get("model")?.as_str().map(str::to_string)
}

pub fn hash_token(token: &str) -> String {
    hex::encode(Sha256::digest(token.as_bytes()))
}

/// Classify an authenticated key into its spend mode, enforcing budget
/// gates. Inactive keys are rejected upstream of this call.
pub fn classify_key(key: &ApiKey, account: &Account) -> Result<SpendMode, AdmissionError> {
    if key.is_subscription() {
        if key.under_subscription_quota() {
            Ok(SpendMode::Subscription)
        } else if account.credits > rust_decimal::Decimal::ZERO {
            Ok(SpendMode::SubscriptionOverflow)
        } else {
            Err(AdmissionError::SubscriptionQuotaExceeded)
        }
    } else if account.over_budget() {
        Err(AdmissionError::AccountQuotaExceeded)
    } else if key.over_budget() {
        Err(AdmissionError::KeyQuotaExceeded)
    } else {
        Ok(SpendMode::Regular)
    }
}

pub async fn admission_middleware(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Response {
    match admit(&state, request).await {
        Ok(request) => next.run(request).await,
        Err(e) => e.into_response(),
    }
}

async fn admit(state: &AppState, request: Request) -> Result<Request, AdmissionError> {
    let (parts, body) = request.into_parts();

    let bearer = parts
        .headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|t| !t.is_empty());

    // Buffer the body once; handlers and the proxy reuse these bytes.
    let body_bytes = if parts.method == Method::POST {
        body.collect()
            .await
            .map_err(|e| {
                tracing::warn!(error = %e, "Failed to read request body");
                AdmissionError::Internal
            })?
            .to_bytes()
    } else {
        bytes::Bytes::new()
    };

    let model = if parts.method == Method::POST {
        model_from_body(&body_bytes)
    } else {
        Query::<HashMap<String, String>>::try_from_uri(&parts.uri)
            .ok()
            .and_then(|q| q.0.get("model").cloned())
    }
    .ok_or(AdmissionError::MissingModel)?;

    let public = is_public_path(parts.uri.path());

    let (account, key, spend_mode) = if public {
        (None, None, SpendMode::Regular)
    } else if let Some(token) = bearer {
        let (key, account) = state
            .keys
            .find_by_hash(&hash_token(token))
            .await
            .map_err(|e| {
                tracing::error!(error = %e, "API key lookup failed");
                AdmissionError::Internal
            })?
            .filter(|(key, _)| key.active)
            .ok_or(AdmissionError::InvalidKey)?;
        let spend_mode = classify_key(&key, &account)?;
        (Some(account), Some(key), spend_mode)
    } else {
        if !state.config.model_is_free(&model) {
            return Err(AdmissionError::ModelRequiresKey);
        }
        (None, None, SpendMode::Regular)
    };

    let deployment = state
        .resolver
        .resolve(&model)
        .await
        .map_err(|e| {
            tracing::error!(error = %e, model = %model, "Deployment resolution failed");
            AdmissionError::Internal
        })?
        .ok_or_else(|| AdmissionError::ModelUnavailable(model.clone()))?;

    // Enclave providers get the raw body fingerprinted for the signature
    // endpoints downstream.
    let request_hash = (deployment.is_enclave() && parts.method == Method::POST)
        .then(|| hex::encode(Sha256::digest(&body_bytes)));

    let context = RequestContext {
        account,
        key,
        deployment,
        requested_model: model,
        spend_mode,
        request_hash,
    };

    let mut request = Request::from_parts(parts, Body::from(body_bytes));
    request.extensions_mut().insert(Arc::new(context));
    Ok(request)
}
