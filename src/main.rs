use std::sync::Arc;

use tower_http::cors::CorsLayer;

use arena_backend::api;
use arena_backend::arena::Arena;
use arena_backend::config::Config;
use arena_backend::db::Database;
use arena_backend::metrics;
use arena_backend::queue::{spawn_settlement_worker, SettlementQueue};
use arena_backend::worker_pool::WorkerPool;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt::init();

    let config = Config::load();
    metrics::register_metrics();

    let db = match Database::new(&config.database_url).await {
        Ok(db) => Arc::new(db),
        Err(e) => {
            tracing::error!("Failed to initialize database: {e}");
            std::process::exit(1);
        }
    };

    let queue = SettlementQueue::new();
    let arena = Arc::new(Arena::new(
        db.clone(),
        config.policy,
        config.settlement_max_attempts,
        queue.clone(),
    ));

    // Background settlement worker; its first sweep repairs anything left
    // unsettled by a previous run.
    spawn_settlement_worker(
        db,
        arena.settler().clone(),
        queue,
        WorkerPool::new(config.settlement_workers),
        config.sweep_interval,
    );

    let app = api::router(arena).layer(CorsLayer::permissive());

    let addr = format!("0.0.0.0:{}", config.port);
    let listener = match tokio::net::TcpListener::bind(&addr).await {
        Ok(listener) => listener,
        Err(e) => {
            tracing::error!("Failed to bind to {addr}: {e}");
            std::process::exit(1);
        }
    };

    tracing::info!(
        port = config.port,
        workers = config.settlement_workers,
        settle_timeouts = config.policy.settle_timeouts,
        settle_unranked = config.policy.settle_unranked,
        "Arena backend listening"
    );
    if let Err(e) = axum::serve(listener, app).await {
        tracing::error!("Server error: {e}");
        std::process::exit(1);
    }
}
