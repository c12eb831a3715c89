//! Application startup and lifecycle management.

use crate::config::{MeteringConfig, UsageConfig, WebhookConfig};
use crate::handlers;
use crate::services::{
    ApiKeyVerifier, AuthServiceKeyVerifier, BillingProvider, BillingReporter, Database,
    MeteringStore, StaticKeyVerifier, StripeClient, UsageGateway, UsageWebhookClient,
    WebhookProcessor,
};
use axum::{
    middleware::from_fn,
    routing::{get, post},
    Router,
};
use secrecy::ExposeSecret;
use service_core::error::AppError;
use service_core::middleware::{
    metrics::metrics_middleware, security_headers::security_headers_middleware,
    tracing::request_id_middleware,
};
use std::sync::Arc;
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn MeteringStore>,
    pub gateway: UsageGateway,
    pub webhooks: WebhookProcessor,
    pub reporter: BillingReporter,
    pub verifier: Arc<dyn ApiKeyVerifier>,
}

impl AppState {
    pub fn new(
        store: Arc<dyn MeteringStore>,
        provider: Arc<dyn BillingProvider>,
        verifier: Arc<dyn ApiKeyVerifier>,
        webhooks: &WebhookConfig,
        usage: &UsageConfig,
    ) -> Self {
        let reporter = BillingReporter::new(store.clone(), provider);
        let gateway = UsageGateway::new(
            store.clone(),
            reporter.clone(),
            UsageWebhookClient::new(usage.webhook_timeout),
            usage.strict_limit_enforcement,
        );
        let webhooks = WebhookProcessor::new(
            store.clone(),
            webhooks.signing_secret.clone(),
            webhooks.signature_tolerance,
            webhooks.max_retries,
            webhooks.claim_timeout,
        );

        Self {
            store,
            gateway,
            webhooks,
            reporter,
            verifier,
        }
    }
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(handlers::health::health_check))
        .route("/ready", get(handlers::health::readiness_check))
        .route("/metrics", get(handlers::health::metrics_endpoint))
        .route(
            "/usage",
            post(handlers::usage::record_usage).get(handlers::usage::query_usage),
        )
        .route(
            "/webhooks/billing-provider",
            post(handlers::webhooks::billing_provider_webhook),
        )
        .route(
            "/admin/webhook-events",
            get(handlers::admin::list_webhook_events),
        )
        .route(
            "/admin/usage/reconcile",
            post(handlers::admin::reconcile_usage),
        )
        .layer(from_fn(security_headers_middleware))
        .layer(from_fn(metrics_middleware))
        .layer(from_fn(request_id_middleware))
        .layer(
            TraceLayer::new_for_http().make_span_with(|request: &axum::http::Request<_>| {
                let request_id = request
                    .headers()
                    .get("x-request-id")
                    .and_then(|value| value.to_str().ok())
                    .unwrap_or("-");

                tracing::info_span!(
                    "http_request",
                    request_id = %request_id,
                    method = %request.method(),
                    uri = %request.uri(),
                    tenant_id = tracing::field::Empty,
                    key_id = tracing::field::Empty,
                    event_id = tracing::field::Empty,
                )
            }),
        )
        .with_state(state)
}

fn build_verifier(config: &MeteringConfig) -> Result<Arc<dyn ApiKeyVerifier>, AppError> {
    if let Some(endpoint) = config.auth.auth_service_endpoint.as_deref() {
        tracing::info!(endpoint = %endpoint, "Verifying API keys against auth service");
        return Ok(Arc::new(AuthServiceKeyVerifier::new(endpoint)));
    }

    match config.auth.static_api_keys.as_ref() {
        Some(keys) => {
            tracing::info!("Verifying API keys against static key table");
            Ok(Arc::new(StaticKeyVerifier::parse(keys.expose_secret())?))
        }
        None => {
            tracing::warn!("No API key source configured - all API-key requests will be rejected");
            Ok(Arc::new(StaticKeyVerifier::new()))
        }
    }
}

pub struct Application {
    port: u16,
    listener: TcpListener,
    router: Router,
}

impl Application {
    pub async fn build(config: MeteringConfig) -> Result<Self, AppError> {
        Self::build_internal(config, true).await
    }

    pub async fn build_without_migrations(config: MeteringConfig) -> Result<Self, AppError> {
        Self::build_internal(config, false).await
    }

    async fn build_internal(config: MeteringConfig, run_migrations: bool) -> Result<Self, AppError> {
        let db = Database::new(
            config.database.url.expose_secret(),
            config.database.max_connections,
            config.database.min_connections,
        )
        .await
        .map_err(|e| {
            tracing::error!(error = %e, "Failed to connect to PostgreSQL");
            e
        })?;

        if run_migrations {
            db.run_migrations().await.map_err(|e| {
                tracing::error!(error = %e, "Failed to run migrations");
                e
            })?;
        }

        let stripe = StripeClient::new(config.stripe.clone());
        if stripe.is_configured() {
            tracing::info!("Stripe client initialized");
        } else {
            tracing::warn!("Stripe credentials not configured - usage will not be reported");
        }

        let verifier = build_verifier(&config)?;
        let state = AppState::new(
            Arc::new(db),
            Arc::new(stripe),
            verifier,
            &config.webhooks,
            &config.usage,
        );

        let addr = config.common.socket_addr();
        let listener = TcpListener::bind(addr).await.map_err(|e| {
            tracing::error!(error = %e, addr = %addr, "Failed to bind HTTP listener");
            AppError::from(e)
        })?;
        let port = listener.local_addr()?.port();

        tracing::info!(port = port, "Metering service listener bound");

        Ok(Self {
            port,
            listener,
            router: build_router(state),
        })
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Serve until `signal` resolves, then let in-flight requests finish.
    pub async fn run_with_graceful_shutdown<F>(self, signal: F) -> std::io::Result<()>
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        axum::serve(self.listener, self.router)
            .with_graceful_shutdown(signal)
            .await
    }
}
