pub mod api;
pub mod config;
pub mod logic;
pub mod model;
pub mod store;

// Export API types
pub use api::{
    handler, middleware, ApiError, ApiServer, BatchError, BatchManager, BatchStats, Handler,
    Middleware, Next, RateLimiter, Router,
};

// Export logic types
pub use logic::{
    OptimisticEngine, OptimisticHandle, OptimisticOptions, OptimisticStats, Settlement, UpdateKind,
};

// Export all model types
pub use model::*;

// Export store types
pub use store::{CacheLayer, CacheOptions, CacheStats, MemoryStorage, PostgresStorage, Storage};

pub use config::AppConfig;

use std::sync::Arc;

/// Convenience wiring for a Postgres-backed server: load `.env` and
/// configuration, initialize logging, connect, migrate, and build the
/// server around the given router.
pub async fn bootstrap(router: Router) -> anyhow::Result<ApiServer> {
    // Load environment variables from .env file if it exists
    dotenvy::dotenv().ok();

    // Initialize logging with INFO level only (suppress DEBUG logs)
    let _ = env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .try_init();

    // Load configuration
    let config = AppConfig::load()?;

    // Connect to PostgreSQL
    let database_url = config.database_url()?;
    let storage = PostgresStorage::new(&database_url).await?;
    storage.migrate().await?;

    Ok(ApiServer::new(&config, router, Arc::new(storage)))
}
