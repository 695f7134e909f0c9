//! HTTP handlers for the caller-facing surface.
//!
//! The proxied POST endpoints expect admission to have run: the request
//! carries a [`RequestContext`] extension and a buffered body.

use std::sync::Arc;

use axum::{
    Json,
    extract::{Path, Request, State},
    http::StatusCode,
    response::{IntoResponse, Response},
};
use http_body_util::BodyExt;
use serde_json::json;

use crate::{
    AppState,
    models::RequestContext,
    proxy::{GatewayFunction, error_response},
};

pub async fn health() -> Response {
    Json(json!({"status": "ok"})).into_response()
}

pub async fn chat_completions(State(state): State<AppState>, request: Request) -> Response {
    proxied(state, GatewayFunction::ChatCompletions, request).await
}

pub async fn completions(State(state): State<AppState>, request: Request) -> Response {
    proxied(state, GatewayFunction::Completions, request).await
}

pub async fn embeddings(State(state): State<AppState>, request: Request) -> Response {
    proxied(state, GatewayFunction::Embeddings, request).await
}

pub async fn messages(State(state): State<AppState>, request: Request) -> Response {
    proxied(state, GatewayFunction::Messages, request).await
}

async fn proxied(state: AppState, function: GatewayFunction, request: Request) -> Response {
    let Some(context) = request.extensions().get::<Arc<RequestContext>>().cloned() else {
        tracing::error!(path = function.caller_path(), "Request reached handler without admission");
        return error_response(
            StatusCode::INTERNAL_SERVER_ERROR,
            "Service temporarily unavailable",
        );
    };

    // Admission already buffered this; collect is a cheap copy.
    let body = match request.into_body().collect().await {
        Ok(collected) => collected.to_bytes(),
        Err(e) => {
            tracing::warn!(error = %e, "Failed to re-read buffered body");
            return error_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                "Service temporarily unavailable",
            );
        }
    };

    let started = std::time::Instant::now();
    let model = context.requested_model.clone();
    let provider = context.deployment.provider.clone();
    let account_id = context.account.as_ref().map(|a| a.id);
    let response = state.proxy.forward(context, function, body).await;
    tracing::info!(
        endpoint = function.caller_path(),
        model = %model,
        provider = %provider,
        account_id,
        status = response.status().as_u16(),
        latency_ms = started.elapsed().as_millis() as u64,
        "Proxied request"
    );
    response
}

/// Public attestation/signature passthrough. Admission resolved the
/// deployment; the upstream owns the semantics.
pub async fn public_proxy(State(state): State<AppState>, request: Request) -> Response {
    let Some(context) = request.extensions().get::<Arc<RequestContext>>().cloned() else {
        return error_response(
            StatusCode::INTERNAL_SERVER_ERROR,
            "Service temporarily unavailable",
        );
    };
    let path_and_query = request
        .uri()
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/")
        .to_string();
    state.proxy.forward_get(context, &path_and_query).await
}

pub async fn list_models(State(state): State<AppState>) -> Response {
    models_document(&state, None).await
}

pub async fn list_models_by_provider(
    State(state): State<AppState>,
    Path(provider): Path<String>,
) -> Response {
    models_document(&state, Some(&provider)).await
}

async fn models_document(state: &AppState, provider: Option<&str>) -> Response {
    match state.deployments.list_active(provider).await {
        Ok(rows) => {
            let data: Vec<_> = rows
                .into_iter()
                .map(|(model_id, provider_name)| {
                    json!({
                        "id": model_id,
                        "object": "model",
                        "owned_by": provider_name,
                    })
                })
                .collect();
            Json(json!({"object": "list", "data": data})).into_response()
        }
        Err(e) => {
            tracing::error!(error = %e, "Model listing failed");
            error_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                "Service temporarily unavailable",
            )
        }
    }
}
