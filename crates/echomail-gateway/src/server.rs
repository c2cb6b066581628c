//! HTTP server implementation using Axum.

use std::sync::Arc;

use axum::{Router, routing::get};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use echomail_core::config::EchomailConfig;
use echomail_engine::SequenceRunner;
use echomail_mailer::{MailTransport, SmtpMailer};
use echomail_store::MailStore;

/// Shared state for the gateway server.
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<MailStore>,
    pub mailer: Arc<dyn MailTransport>,
    pub runner: Arc<SequenceRunner>,
    /// Shared secret for the dispatch trigger. None disables the check.
    pub cron_secret: Option<String>,
    pub from_email: String,
    pub start_time: std::time::Instant,
}

/// Build the Axum router with all routes.
pub fn build_router(state: AppState) -> Router {
    let shared = Arc::new(state);

    Router::new()
        // Dispatch trigger — GET for external cron pingers, POST for everyone else
        .route(
            "/cron/run",
            get(super::routes::cron_run).post(super::routes::cron_run),
        )
        // Open-tracking pixel, hit from recipients' mail clients
        .route("/api/open", get(super::routes::track_open))
        .route("/testmail", get(super::routes::send_test_mail))
        .route("/health", get(super::routes::health_check))
        .layer(
            CorsLayer::new()
                .allow_methods([axum::http::Method::GET, axum::http::Method::POST])
                .allow_headers(Any)
                .allow_origin(Any),
        )
        .layer(TraceLayer::new_for_http())
        .with_state(shared)
}

/// Start the HTTP server. Blocks until the listener shuts down.
pub async fn start(config: &EchomailConfig) -> anyhow::Result<()> {
    let store = Arc::new(MailStore::open(&config.store.resolved_path())?);
    tracing::info!("💾 Store opened: {}", config.store.resolved_path().display());

    let mailer: Arc<dyn MailTransport> = Arc::new(SmtpMailer::new(&config.smtp)?);
    let runner = Arc::new(SequenceRunner::new(store.clone(), mailer.clone(), config));

    if config.server.cron_secret.is_none() {
        tracing::warn!("⚠️ No cron secret configured — /cron/run is unauthenticated");
    }

    let state = AppState {
        store,
        mailer,
        runner,
        cron_secret: config.server.cron_secret.clone(),
        from_email: config.smtp.from_email.clone(),
        start_time: std::time::Instant::now(),
    };
    let app = build_router(state);

    let addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!("🌐 Gateway server listening on http://{}", addr);

    axum::serve(listener, app).await?;
    Ok(())
}
