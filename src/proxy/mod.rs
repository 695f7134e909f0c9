//! The proxy engine: one upstream HTTP call per admitted request.
//!
//! The request body goes up unmodified except for the dialect transform;
//! the response body flows back through (bridge, when engaged) then the
//! usage tee, so the caller always receives the bytes the pipeline
//! produced while token counts are harvested on the side.

use std::{sync::Arc, time::Instant};

use axum::{
    body::Body,
    http::{StatusCode, header},
    response::Response,
};
use bytes::Bytes;

use crate::{
    api_types::{ErrorResponse, openai::ChatCompletionResponse},
    bridge,
    models::{ProviderConfig, RequestContext},
    spend::UsageEnqueue,
    streaming::{UsageContext, UsageTeeStream, extract_unary_usage},
};

const ANTHROPIC_VERSION: &str = "2023-06-01";

/// The four proxied functions and their upstream paths.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GatewayFunction {
    ChatCompletions,
    Completions,
    Embeddings,
    Messages,
}

impl GatewayFunction {
    pub fn caller_path(&self) -> &'static str {
        match self {
            GatewayFunction::ChatCompletions => "/v1/chat/completions",
            GatewayFunction::Completions => "/v1/completions",
            GatewayFunction::Embeddings => "/v1/embeddings",
            GatewayFunction::Messages => "/v1/messages",
        }
    }

    /// Path on the upstream. A bridged `/v1/messages` call lands on the
    /// provider's chat-completions endpoint.
    pub fn upstream_path(&self, bridged: bool) -> &'static str {
        match self {
            GatewayFunction::ChatCompletions => "/chat/completions",
            GatewayFunction::Completions => "/completions",
            GatewayFunction::Embeddings => "/embeddings",
            GatewayFunction::Messages if bridged => "/chat/completions",
            GatewayFunction::Messages => "/messages",
        }
    }
}

pub struct ProxyEngine {
    http: reqwest::Client,
    timeout: std::time::Duration,
    queue: Arc<dyn UsageEnqueue>,
}

impl ProxyEngine {
    pub fn new(
        http: reqwest::Client,
        timeout: std::time::Duration,
        queue: Arc<dyn UsageEnqueue>,
    ) -> Self {
        Self {
            http,
            timeout,
            queue,
        }
    }

    /// Forward one admitted POST. `body` is the buffered caller body from
    /// admission.
    pub async fn forward(
        &self,
        context: Arc<RequestContext>,
        function: GatewayFunction,
        body: Bytes,
    ) -> Response {
        let started = Instant::now();
        let deployment = &context.deployment;
        let bridged = function == GatewayFunction::Messages && !deployment.speaks_anthropic();

        let upstream_body = if bridged {
            match serde_json::from_slice(&body) {
                Ok(messages_request) => {
                    let chat = bridge::chat_request_from_messages(messages_request);
                    match serde_json::to_vec(&chat) {
                        Ok(encoded) => Bytes::from(encoded),
                        Err(e) => {
                            tracing::error!(error = %e, "Failed to encode bridged request");
                            return error_response(
                                StatusCode::INTERNAL_SERVER_ERROR,
                                "Service temporarily unavailable",
                            );
                        }
                    }
                }
                Err(e) => {
                    return error_response(
                        StatusCode::BAD_REQUEST,
                        format!("Invalid request body: {e}"),
                    );
                }
            }
        } else {
            body
        };

        let endpoint = deployment.endpoint();
        let url = format!(
            "{}{}",
            endpoint.base_url.trim_end_matches('/'),
            function.upstream_path(bridged)
        );

        let mut request = self
            .http
            .post(&url)
            .timeout(self.timeout)
            .header(header::CONTENT_TYPE, "application/json")
            .bearer_auth(&endpoint.api_key);
        if let ProviderConfig::Anthropic(_) = &deployment.config {
            request = request
                .header("x-api-key", &endpoint.api_key)
                .header("anthropic-version", ANTHROPIC_VERSION);
        }

        let upstream = match request.body(upstream_body).send().await {
            Ok(upstream) => upstream,
            Err(e) => {
                tracing::warn!(
                    provider = %deployment.provider,
                    model = %context.requested_model,
                    error = %e,
                    "Upstream request failed"
                );
                return error_response(StatusCode::BAD_GATEWAY, "Upstream request failed");
            }
        };

        let status = StatusCode::from_u16(upstream.status().as_u16())
            .unwrap_or(StatusCode::BAD_GATEWAY);
        let content_type = upstream
            .headers()
            .get(header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("application/octet-stream")
            .to_string();

        // Callers correlate enclave requests with the signature endpoints
        // by the body fingerprint admission computed.
        let request_hash = context.request_hash.clone();

        let mut response = if content_type.starts_with("text/event-stream") {
            self.stream_response(context, function, status, content_type, upstream, started, bridged)
        } else {
            self.unary_response(context, function, status, content_type, upstream, started, bridged)
                .await
        };
        if let Some(hash) = request_hash
            && let Ok(value) = http::HeaderValue::try_from(hash)
        {
            response.headers_mut().insert("x-request-hash", value);
        }
        response
    }

    #[allow(clippy::too_many_arguments)]
    fn stream_response(
        &self,
        context: Arc<RequestContext>,
        function: GatewayFunction,
        status: StatusCode,
        content_type: String,
        upstream: reqwest::Response,
        started: Instant,
        bridged: bool,
    ) -> Response {
        let usage_context = context
            .key
            .is_some()
            .then(|| UsageContext::from_request(&context, function.caller_path(), status.as_u16()));
        let raw = Box::pin(upstream.bytes_stream());

        let body = if bridged {
            let translated = bridge::MessagesStreamBridge::new(raw, &context.requested_model);
            match usage_context {
                Some(usage_context) => Body::from_stream(UsageTeeStream::new(
                    translated,
                    Arc::clone(&self.queue),
                    usage_context,
                    started,
                )),
                None => Body::from_stream(translated),
            }
        } else {
            match usage_context {
                Some(usage_context) => Body::from_stream(UsageTeeStream::new(
                    raw,
                    Arc::clone(&self.queue),
                    usage_context,
                    started,
                )),
                None => Body::from_stream(raw),
            }
        };

        Response::builder()
            .status(status)
            .header(header::CONTENT_TYPE, content_type)
            .body(body)
            .unwrap_or_else(|_| error_response(StatusCode::INTERNAL_SERVER_ERROR, "Service temporarily unavailable"))
    }

    #[allow(clippy::too_many_arguments)]
    async fn unary_response(
        &self,
        context: Arc<RequestContext>,
        function: GatewayFunction,
        status: StatusCode,
        content_type: String,
        upstream: reqwest::Response,
        started: Instant,
        bridged: bool,
    ) -> Response {
        let upstream_bytes = match upstream.bytes().await {
            Ok(bytes) => bytes,
            Err(e) => {
                tracing::warn!(error = %e, "Failed to read upstream body");
                return error_response(StatusCode::BAD_GATEWAY, "Upstream request failed");
            }
        };

        let (out_status, out_type, out_bytes) = if bridged {
            if !status.is_success() {
                let wrapped =
                    bridge::messages_error_from_chat(&upstream_bytes, &context.deployment.provider);
                (
                    status,
                    "application/json".to_string(),
                    Bytes::from(wrapped.to_string()),
                )
            } else {
                match serde_json::from_slice::<ChatCompletionResponse>(&upstream_bytes) {
                    Ok(chat) => {
                        let translated =
                            bridge::messages_response_from_chat(chat, &context.requested_model);
                        match serde_json::to_vec(&translated) {
                            Ok(encoded) => (
                                status,
                                "application/json".to_string(),
                                Bytes::from(encoded),
                            ),
                            Err(e) => {
                                tracing::error!(error = %e, "Failed to encode bridged response");
                                return error_response(
                                    StatusCode::BAD_GATEWAY,
                                    "Upstream returned an unusable response",
                                );
                            }
                        }
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "Unparseable upstream response");
                        return error_response(
                            StatusCode::BAD_GATEWAY,
                            "Upstream returned an unusable response",
                        );
                    }
                }
            }
        } else {
            (status, content_type, upstream_bytes)
        };

        // Usage comes off the bytes the caller receives.
        if out_status.is_success() && context.key.is_some()
            && let Some(usage) = extract_unary_usage(&out_bytes)
        {
            let usage_context =
                UsageContext::from_request(&context, function.caller_path(), out_status.as_u16());
            let record = usage_context.into_record(usage, started);
            let queue = Arc::clone(&self.queue);
            tokio::spawn(async move {
                queue.enqueue(record).await;
            });
        }

        Response::builder()
            .status(out_status)
            .header(header::CONTENT_TYPE, out_type)
            .body(Body::from(out_bytes))
            .unwrap_or_else(|_| error_response(StatusCode::INTERNAL_SERVER_ERROR, "Service temporarily unavailable"))
    }

    /// Passthrough for the public GET endpoints: same path (minus the
    /// `/v1` prefix) and query string against the resolved deployment.
    pub async fn forward_get(&self, context: Arc<RequestContext>, path_and_query: &str) -> Response {
        let endpoint = context.deployment.endpoint();
        let upstream_path = path_and_query.strip_prefix("/v1").unwrap_or(path_and_query);
        let url = format!("{}{}", endpoint.base_url.trim_end_matches('/'), upstream_path);

        let upstream = match self
            .http
            .get(&url)
            .timeout(self.timeout)
            .bearer_auth(&endpoint.api_key)
            .send()
            .await
        {
            Ok(upstream) => upstream,
            Err(e) => {
                tracing::warn!(error = %e, provider = %context.deployment.provider, "Upstream request failed");
                return error_response(StatusCode::BAD_GATEWAY, "Upstream request failed");
            }
        };

        let status = StatusCode::from_u16(upstream.status().as_u16())
            .unwrap_or(StatusCode::BAD_GATEWAY);
        let content_type = upstream
            .headers()
            .get(header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("application/json")
            .to_string();
        let body = upstream.bytes().await.unwrap_or_default();

        Response::builder()
            .status(status)
            .header(header::CONTENT_TYPE, content_type)
            .body(Body::from(body))
            .unwrap_or_else(|_| error_response(StatusCode::INTERNAL_SERVER_ERROR, "Service temporarily unavailable"))
    }
}

pub fn error_response(status: StatusCode, message: impl Into<String>) -> Response {
    let body = serde_json::to_string(&ErrorResponse::new(message.into())).unwrap_or_default();
    Response::builder()
        .status(status)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body))
        .unwrap_or_default()
}
