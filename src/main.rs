use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use sea_orm::Database;
use tokio::signal;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::info;

use stockwatch::store::memory::MemoryBackend;
use stockwatch::store::sql::SqlBackend;
use stockwatch::store::{ChangeFeed, NotificationStore, ProductStore};
use stockwatch::{app_router, config, AppState};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cfg = config::load_config().context("failed to load configuration")?;
    config::init_tracing(&cfg.log_level, cfg.log_json);

    let (products, notifications, feed): (
        Arc<dyn ProductStore>,
        Arc<dyn NotificationStore>,
        Arc<dyn ChangeFeed>,
    ) = match cfg.backend.as_str() {
        "sql" => {
            let db = Arc::new(
                Database::connect(&cfg.database_url)
                    .await
                    .context("failed to connect to database")?,
            );
            let backend = Arc::new(SqlBackend::new(db, cfg.feed_poll_interval()));
            backend
                .init_schema()
                .await
                .context("failed to initialize schema")?;
            (backend.clone(), backend.clone(), backend)
        }
        _ => {
            let backend = Arc::new(MemoryBackend::new());
            (backend.clone(), backend.clone(), backend)
        }
    };

    let state = AppState::build(cfg.clone(), products, notifications, feed);

    // background lifecycle: change feed fan-out, low-stock sweep, expiry cleanup
    state.watcher.start();
    state.low_stock.start_monitoring(cfg.monitor_interval());
    let cleanup = state
        .notifications
        .spawn_cleanup_task(cfg.cleanup_interval());

    let addr: SocketAddr = format!("{}:{}", cfg.host, cfg.port)
        .parse()
        .context("invalid host/port")?;
    let app = app_router(state.clone())
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive());

    info!(%addr, backend = %cfg.backend, "stockwatch listening");
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .context("failed to bind listener")?;

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server error")?;

    state.low_stock.stop_monitoring();
    cleanup.abort();
    state.watcher.disconnect().await;
    info!("stockwatch shut down");
    Ok(())
}

async fn shutdown_signal() {
    let _ = signal::ctrl_c().await;
    info!("shutdown signal received");
}
