use serde_json::Value;
use std::sync::Arc;
use tokio::task::JoinHandle;

use crate::api::batch::{BatchError, BatchManager};
use crate::api::rate_limit::RateLimiter;
use crate::api::router::Router;
use crate::config::AppConfig;
use crate::logic::optimistic::OptimisticEngine;
use crate::model::{Method, Request, Response};
use crate::store::cache::CacheLayer;
use crate::store::traits::Storage;

/// Wires the router, batch manager, cache, and optimistic engine together
/// over one storage collaborator. Components are owned here and handed out
/// by reference; nothing is global. Must be constructed inside a tokio
/// runtime (the cache sweeper is spawned at build time).
pub struct ApiServer {
    router: Arc<Router>,
    cache: Arc<CacheLayer>,
    batch: BatchManager,
    optimistic: OptimisticEngine,
    batching_enabled: bool,
    sweeper: JoinHandle<()>,
}

impl ApiServer {
    /// Routes are registered on the `Router` before it is handed over; the
    /// configured rate limiter is attached here.
    pub fn new(config: &AppConfig, mut router: Router, storage: Arc<dyn Storage>) -> Self {
        if config.router.rate_limit_enabled {
            router = router.with_rate_limiter(RateLimiter::new(
                config.router.rate_limit_window(),
                config.router.rate_limit_max_requests,
            ));
        }
        let router = Arc::new(router);
        let cache = Arc::new(CacheLayer::new(&config.cache, storage.clone()));
        let sweeper = cache.spawn_sweeper();
        let batch = BatchManager::new(&config.batch, router.clone());
        let optimistic = OptimisticEngine::new(storage, cache.clone());

        Self {
            router,
            cache,
            batch,
            optimistic,
            batching_enabled: config.batch.enabled,
            sweeper,
        }
    }

    /// Entry point for callers: goes through the batch manager when batching
    /// is enabled, straight to the router otherwise. Per-call semantics are
    /// identical either way.
    pub async fn fetch(
        &self,
        method: Method,
        path: &str,
        body: Option<Value>,
    ) -> Result<Response, BatchError> {
        if self.batching_enabled {
            self.batch.fetch(method, path, body).await
        } else {
            let mut request = Request::new(method, path);
            if let Some(body) = body {
                request = request.with_body(body);
            }
            Ok(self.router.handle(request).await)
        }
    }

    /// Dispatch a fully built request directly, bypassing batching.
    pub async fn handle(&self, request: Request) -> Response {
        self.router.handle(request).await
    }

    pub fn router(&self) -> &Arc<Router> {
        &self.router
    }

    pub fn cache(&self) -> &Arc<CacheLayer> {
        &self.cache
    }

    pub fn batch(&self) -> &BatchManager {
        &self.batch
    }

    pub fn optimistic(&self) -> &OptimisticEngine {
        &self.optimistic
    }

    /// Reject pending batch items and stop the cache sweeper.
    pub async fn shutdown(&self) {
        self.batch.clear().await;
        self.sweeper.abort();
    }
}

impl Drop for ApiServer {
    fn drop(&mut self) {
        self.sweeper.abort();
    }
}
