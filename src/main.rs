use std::{net::SocketAddr, sync::Arc};

use anyhow::Context;
use axum::{extract::State, http::StatusCode, routing::get, Json, Router};
use serde_json::{json, Value};
use tokio::signal;
use tracing::{error, info, warn};

use gasdesk_api as api;
use api::events::{EventHandler, EventSender, LoggingEventHandler};
use api::services::{references::AcceptAllReferences, DocumentSettings};

#[derive(Clone)]
struct HealthState {
    db: Arc<api::db::DbPool>,
}

async fn health(State(state): State<HealthState>) -> (StatusCode, Json<Value>) {
    match api::db::check_connection(&state.db).await {
        Ok(()) => (StatusCode::OK, Json(json!({ "status": "ok", "database": "up" }))),
        Err(e) => {
            warn!(error = %e, "health check failed");
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(json!({ "status": "degraded", "database": "down" })),
            )
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cfg = api::config::load_config().context("failed to load configuration")?;
    api::config::init_tracing(cfg.log_level(), cfg.log_json);

    // Init DB
    let db_pool = api::db::establish_connection_from_app_config(&cfg)
        .await
        .context("failed to connect to the database")?;
    if cfg.auto_migrate {
        api::db::run_migrations(&db_pool).await.map_err(|e| {
            error!("Failed running migrations: {}", e);
            e
        })?;
    }
    let db_arc = Arc::new(db_pool);

    // Cache invalidation sink
    let cache = api::cache::invalidator_from_config(&cfg.cache).await;

    // Init events
    let (event_sender, event_rx) = EventSender::channel(cfg.event_channel_capacity);
    let handlers: Vec<Arc<dyn EventHandler>> = vec![Arc::new(LoggingEventHandler)];
    let event_task = tokio::spawn(api::events::process_events(event_rx, handlers));

    // Reference lookups belong to the master-data services; accept until one is wired in
    let services = api::AppServices::new(
        db_arc.clone(),
        Arc::new(AcceptAllReferences),
        cache,
        Some(event_sender),
        DocumentSettings::from(&cfg),
    );
    info!(
        environment = %cfg.environment,
        currency = %cfg.default_currency,
        "document services ready"
    );

    let app = Router::new()
        .route("/", get(|| async { "gasdesk-api up" }))
        .route("/health", get(health))
        .with_state(HealthState { db: db_arc.clone() });

    let addr: SocketAddr = format!("{}:{}", cfg.host, cfg.port)
        .parse()
        .with_context(|| format!("invalid listen address {}:{}", cfg.host, cfg.port))?;
    info!("gasdesk-api listening on http://{}", addr);
    let listener = tokio::net::TcpListener::bind(addr).await?;

    axum::serve(listener, app.into_make_service())
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    // Dropping the services closes the event channel so the processor drains and exits
    drop(services);
    if let Err(e) = event_task.await {
        warn!(error = %e, "event processor ended abnormally");
    }

    match Arc::try_unwrap(db_arc) {
        Ok(pool) => api::db::close_pool(pool).await?,
        Err(_) => warn!("database pool still shared at shutdown; skipping explicit close"),
    }

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};

        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "failed to install SIGTERM handler");
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
    info!("shutdown signal received");
}
