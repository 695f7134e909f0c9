//! tollgate: an AI gateway.
//!
//! Authenticates callers against hashed API keys, selects a provider
//! deployment for the requested model, translates between the OpenAI and
//! Anthropic wire dialects, enforces rate and budget limits, and settles
//! usage asynchronously into budget counters and an analytical store.

use std::{net::SocketAddr, sync::Arc};

use axum::{
    Router,
    routing::{get, post},
};
use clap::Parser;
use tower::ServiceBuilder;
use tower_http::trace::TraceLayer;

mod api_types;
mod bridge;
mod cache;
mod catalog;
mod config;
mod db;
mod middleware;
mod models;
mod proxy;
mod routes;
mod secrets;
mod spend;
mod streaming;

use cache::Cache;
use catalog::DeploymentResolver;
use config::GatewayConfig;
use db::{ApiKeyStore, PgApiKeyStore, PgDeploymentStore, SettlementWriter};
use proxy::ProxyEngine;
use secrets::SecretBox;
use spend::{ClickHouseSink, SpendQueue, SpendWorker};

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<GatewayConfig>,
    pub cache: Cache,
    pub keys: Arc<dyn ApiKeyStore>,
    pub deployments: Arc<PgDeploymentStore>,
    pub resolver: Arc<DeploymentResolver>,
    pub proxy: Arc<ProxyEngine>,
}

#[derive(Parser)]
#[command(name = "tollgate", version, about = "AI gateway")]
struct Args {
    /// Address to bind the HTTP server on.
    #[arg(long, default_value = "0.0.0.0:8080")]
    bind: SocketAddr,
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "tollgate=info,tower_http=warn".into()),
        )
        .init();

    let config = match GatewayConfig::from_env() {
        Ok(config) => Arc::new(config),
        Err(e) => {
            eprintln!("Configuration error: {e}");
            std::process::exit(1);
        }
    };

    let pool = match db::connect(&config.database_url).await {
        Ok(pool) => pool,
        Err(e) => {
            eprintln!("Database connection failed: {e}");
            std::process::exit(1);
        }
    };

    let cache = match Cache::connect(&config.redis).await {
        Ok(cache) => cache,
        Err(e) => {
            eprintln!("Redis connection failed: {e}");
            std::process::exit(1);
        }
    };

    let http = match reqwest::Client::builder().build() {
        Ok(http) => http,
        Err(e) => {
            eprintln!("HTTP client initialization failed: {e}");
            std::process::exit(1);
        }
    };

    let queue = Arc::new(SpendQueue::new(cache.clone()));
    let worker = SpendWorker::new(
        cache.clone(),
        SettlementWriter::new(pool.clone(), config.spend.credits_per_cost_unit),
        ClickHouseSink::new(http.clone(), config.clickhouse.clone()),
        config.spend.clone(),
    );
    let shutdown = worker.shutdown_token();
    let worker_handle = tokio::spawn(worker.run());

    let state = AppState {
        config: Arc::clone(&config),
        cache: cache.clone(),
        keys: Arc::new(PgApiKeyStore::new(pool.clone())),
        deployments: Arc::new(PgDeploymentStore::new(pool.clone())),
        resolver: Arc::new(DeploymentResolver::new(
            PgDeploymentStore::new(pool.clone()),
            cache.clone(),
            SecretBox::new(&config.encryption_key),
        )),
        proxy: Arc::new(ProxyEngine::new(http, config.request_timeout, queue)),
    };

    let admitted = Router::new()
        .route("/v1/chat/completions", post(routes::chat_completions))
        .route("/v1/completions", post(routes::completions))
        .route("/v1/embeddings", post(routes::embeddings))
        .route("/v1/messages", post(routes::messages))
        .route("/v1/attestation/report", get(routes::public_proxy))
        .route("/v1/signature/{*rest}", get(routes::public_proxy))
        .layer(
            ServiceBuilder::new()
                .layer(axum::middleware::from_fn_with_state(
                    state.clone(),
                    middleware::admission::admission_middleware,
                ))
                .layer(axum::middleware::from_fn_with_state(
                    state.clone(),
                    middleware::rate_limit::rate_limit_middleware,
                )),
        );

    // SIGHUP clears the model caches so config changes take effect without
    // waiting out the 24h TTL.
    #[cfg(unix)]
    {
        let resolver = Arc::clone(&state.resolver);
        tokio::spawn(async move {
            let Ok(mut hangup) =
                tokio::signal::unix::signal(tokio::signal::unix::SignalKind::hangup())
            else {
                return;
            };
            while hangup.recv().await.is_some() {
                let removed = resolver.invalidate().await;
                tracing::info!(removed, "Model caches invalidated");
            }
        });
    }

    let app = Router::new()
        .route("/health", get(routes::health))
        .route("/v1/models", get(routes::list_models))
        .route("/v1/models/{provider}", get(routes::list_models_by_provider))
        .merge(admitted)
        .layer(TraceLayer::new_for_http())
        .with_state(state);

    let listener = match tokio::net::TcpListener::bind(args.bind).await {
        Ok(listener) => listener,
        Err(e) => {
            eprintln!("Failed to bind {}: {e}", args.bind);
            std::process::exit(1);
        }
    };
    tracing::info!(bind = %args.bind, "tollgate listening");

    if let Err(e) = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
    {
        tracing::error!(error = %e, "Server error");
    }

    // Stop the worker timer, let it take a final drain, then close pools.
    shutdown.cancel();
    if let Err(e) =
        tokio::time::timeout(std::time::Duration::from_secs(10), worker_handle).await
    {
        tracing::warn!(error = %e, "Timeout waiting for spend worker to drain");
    }
    pool.close().await;
    tracing::info!("Shutdown complete");
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    tracing::info!("Shutdown signal received");
}
