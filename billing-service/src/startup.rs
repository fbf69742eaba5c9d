//! Application startup and lifecycle management.

use crate::config::{BillingConfig, StorageConfig};
use crate::handlers;
use crate::providers::ProviderRegistry;
use crate::services::{
    init_metrics, AccessService, AnalyticsService, BillingEngine, BillingScheduler, BillingStore,
    MemoryStore, PgStore, WebhookProcessor,
};
use axum::{
    middleware,
    routing::{get, post},
    Router,
};
use secrecy::ExposeSecret;
use service_core::error::AppError;
use service_core::middleware::metrics::metrics_middleware;
use service_core::middleware::security_headers::security_headers_middleware;
use service_core::middleware::tracing::request_id_middleware;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub config: BillingConfig,
    pub store: Arc<dyn BillingStore>,
    pub providers: Arc<ProviderRegistry>,
    pub engine: Arc<BillingEngine>,
    pub webhooks: Arc<WebhookProcessor>,
    pub access: Arc<AccessService>,
    pub analytics: Arc<AnalyticsService>,
}

impl AppState {
    pub fn new(
        config: BillingConfig,
        store: Arc<dyn BillingStore>,
        providers: Arc<ProviderRegistry>,
    ) -> Self {
        let engine = Arc::new(BillingEngine::new(store.clone(), providers.clone(), &config));
        let webhooks = Arc::new(WebhookProcessor::new(store.clone(), providers.clone()));
        let access = Arc::new(AccessService::new(
            store.clone(),
            config.billing.membership_grace_days,
        ));
        let analytics = Arc::new(AnalyticsService::new(store.clone()));
        Self {
            config,
            store,
            providers,
            engine,
            webhooks,
            access,
            analytics,
        }
    }
}

pub fn router(state: AppState) -> Router {
    let api = Router::new()
        .route(
            "/customers",
            post(handlers::customers::create_customer).get(handlers::customers::list_customers),
        )
        .route("/customers/:id", get(handlers::customers::get_customer))
        .route(
            "/customers/:id/methods",
            post(handlers::payment_methods::create_payment_method)
                .get(handlers::payment_methods::list_payment_methods),
        )
        .route(
            "/membership-types",
            post(handlers::membership_types::create_membership_type)
                .get(handlers::membership_types::list_membership_types),
        )
        .route(
            "/membership-types/:id",
            get(handlers::membership_types::get_membership_type),
        )
        .route(
            "/subscriptions",
            post(handlers::subscriptions::create_subscription)
                .get(handlers::subscriptions::list_subscriptions),
        )
        .route(
            "/subscriptions/:id",
            get(handlers::subscriptions::get_subscription),
        )
        .route(
            "/subscriptions/:id/cancel",
            post(handlers::subscriptions::cancel_subscription),
        )
        .route(
            "/subscriptions/:id/reactivate",
            post(handlers::subscriptions::reactivate_subscription),
        )
        .route(
            "/subscriptions/:id/bill",
            post(handlers::subscriptions::bill_subscription),
        )
        .route(
            "/subscriptions/:id/invoices",
            get(handlers::subscriptions::list_subscription_invoices),
        )
        .route("/invoices/:id", get(handlers::invoices::get_invoice))
        .route("/orders", post(handlers::orders::create_order))
        .route("/orders/:id", get(handlers::orders::get_order))
        .route(
            "/billing-runs",
            post(handlers::billing_runs::trigger_billing_run)
                .get(handlers::billing_runs::list_billing_runs),
        )
        .route(
            "/billing-runs/:id",
            get(handlers::billing_runs::get_billing_run),
        )
        .route("/access/verify", post(handlers::access::verify_access))
        .route("/memberships", get(handlers::memberships::list_memberships))
        .route("/analytics/revenue", get(handlers::analytics::daily_revenue))
        .route("/analytics/mrr", get(handlers::analytics::mrr))
        .route(
            "/webhooks/:provider",
            post(handlers::webhooks::receive_webhook),
        );

    Router::new()
        .route("/health", get(handlers::health_check))
        .route("/ready", get(handlers::readiness_check))
        .route("/metrics", get(handlers::metrics_handler))
        .nest("/api/payment", api)
        .layer(TraceLayer::new_for_http())
        .layer(middleware::from_fn(security_headers_middleware))
        .layer(middleware::from_fn(metrics_middleware))
        .layer(middleware::from_fn(request_id_middleware))
        .with_state(state)
}

/// Application container for managing server lifecycle.
pub struct Application {
    http_port: u16,
    http_listener: TcpListener,
    state: AppState,
    shutdown: CancellationToken,
}

impl Application {
    /// Build the application from configuration: open the store, run
    /// migrations for PostgreSQL and register the configured providers.
    pub async fn build(config: BillingConfig) -> Result<Self, AppError> {
        let store: Arc<dyn BillingStore> = match &config.storage {
            StorageConfig::Postgres(database) => {
                let store = PgStore::new(
                    database.url.expose_secret(),
                    database.max_connections,
                    database.min_connections,
                )
                .await
                .map_err(|e| {
                    tracing::error!(error = %e, "Failed to connect to PostgreSQL");
                    e
                })?;
                store.run_migrations().await.map_err(|e| {
                    tracing::error!(error = %e, "Failed to run migrations");
                    e
                })?;
                Arc::new(store)
            }
            StorageConfig::Memory => {
                tracing::warn!("Using in-memory storage; data is lost on restart");
                Arc::new(MemoryStore::new())
            }
        };

        let providers = Arc::new(ProviderRegistry::from_config(&config)?);
        Self::build_with(config, store, providers).await
    }

    /// Build around an existing store and provider registry.
    pub async fn build_with(
        config: BillingConfig,
        store: Arc<dyn BillingStore>,
        providers: Arc<ProviderRegistry>,
    ) -> Result<Self, AppError> {
        init_metrics();

        tracing::info!(
            providers = ?providers.registered(),
            "Payment providers registered"
        );

        let addr = format!("{}:{}", config.common.host, config.common.port);
        let http_listener = TcpListener::bind(&addr).await.map_err(|e| {
            tracing::error!(error = %e, addr = %addr, "Failed to bind HTTP listener");
            AppError::from(e)
        })?;
        let http_port = http_listener.local_addr()?.port();

        tracing::info!(http_port = http_port, "Billing service listener bound");

        Ok(Self {
            http_port,
            http_listener,
            state: AppState::new(config, store, providers),
            shutdown: CancellationToken::new(),
        })
    }

    /// Get the HTTP port the server is listening on.
    pub fn http_port(&self) -> u16 {
        self.http_port
    }

    pub fn state(&self) -> &AppState {
        &self.state
    }

    /// Cancelling this token stops the scheduler and drains the HTTP server.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Run the HTTP server, and the scheduler when enabled, until the
    /// shutdown token is cancelled.
    pub async fn run_until_stopped(self) -> std::io::Result<()> {
        let scheduler = if self.state.config.scheduler.enabled {
            let scheduler =
                BillingScheduler::new(self.state.engine.clone(), &self.state.config.scheduler);
            Some(scheduler.spawn(self.shutdown.clone()))
        } else {
            tracing::info!("Billing scheduler disabled");
            None
        };

        tracing::info!(
            service = %self.state.config.service_name,
            version = %self.state.config.service_version,
            http_port = self.http_port,
            "Service ready to accept connections"
        );

        let shutdown = self.shutdown.clone();
        let result = axum::serve(self.http_listener, router(self.state))
            .with_graceful_shutdown(async move { shutdown.cancelled().await })
            .await;

        if let Some(handle) = scheduler {
            self.shutdown.cancel();
            if let Err(e) = handle.await {
                tracing::error!(error = %e, "Billing scheduler task failed");
            }
        }

        result.map_err(|e| {
            tracing::error!(error = %e, "HTTP server error");
            std::io::Error::other(format!("HTTP server error: {}", e))
        })
    }
}
