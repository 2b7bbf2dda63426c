use serde::Serialize;
use serde_json::Value;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;
use tokio::sync::{oneshot, Mutex};

use crate::api::router::Router;
use crate::config::BatchConfig;
use crate::model::{generate_id, Id, Method, Request, Response};

#[derive(Debug, Error)]
pub enum BatchError {
    #[error("batch manager cleared before dispatch")]
    Cleared,
    #[error("batch dispatch failed: {0}")]
    Dispatch(String),
}

struct PendingItem {
    id: Id,
    request: Request,
    resolver: oneshot::Sender<Result<Response, BatchError>>,
    enqueued_at: Instant,
}

#[derive(Debug, Default)]
struct BatchCounters {
    total_calls: AtomicU64,
    batched_calls: AtomicU64,
    batches_flushed: AtomicU64,
}

/// Observability only; no correctness decisions hang off these numbers.
#[derive(Debug, Clone, Serialize)]
pub struct BatchStats {
    pub total_calls: u64,
    pub batched_calls: u64,
    pub batches_flushed: u64,
    pub average_batch_size: f64,
}

/// Coalesces calls arriving within a time window (or up to a size cap) into
/// one flush of fully independent, concurrently dispatched requests. Each
/// caller gets its own oneshot resolution; one item failing never fails its
/// siblings, and there is no batch-level atomicity.
#[derive(Clone)]
pub struct BatchManager {
    router: Arc<Router>,
    config: BatchConfig,
    pending: Arc<Mutex<Vec<PendingItem>>>,
    /// Bumped on every flush or clear; an armed window timer only fires if
    /// the generation it captured is still current.
    generation: Arc<AtomicU64>,
    counters: Arc<BatchCounters>,
}

impl BatchManager {
    pub fn new(config: &BatchConfig, router: Arc<Router>) -> Self {
        Self {
            router,
            config: config.clone(),
            pending: Arc::new(Mutex::new(Vec::new())),
            generation: Arc::new(AtomicU64::new(0)),
            counters: Arc::new(BatchCounters::default()),
        }
    }

    pub async fn fetch(
        &self,
        method: Method,
        path: &str,
        body: Option<Value>,
    ) -> Result<Response, BatchError> {
        let mut request = Request::new(method, path);
        if let Some(body) = body {
            request = request.with_body(body);
        }
        self.submit(request).await
    }

    /// Enqueue a request and await its slice of the eventual batch.
    pub async fn submit(&self, request: Request) -> Result<Response, BatchError> {
        self.counters.total_calls.fetch_add(1, Ordering::Relaxed);

        let (resolver, settled) = oneshot::channel();
        let item = PendingItem {
            id: generate_id(),
            request,
            resolver,
            enqueued_at: Instant::now(),
        };

        let flush_now = {
            let mut pending = self.pending.lock().await;
            pending.push(item);
            if pending.len() == 1 {
                self.arm_window();
            }
            pending.len() >= self.config.max_size
        };
        if flush_now {
            self.flush().await;
        }

        match settled.await {
            Ok(result) => result,
            Err(_) => Err(BatchError::Dispatch(
                "batch item dropped before settling".to_string(),
            )),
        }
    }

    /// Start the window timer for the batch that just opened.
    fn arm_window(&self) {
        let manager = self.clone();
        let generation = self.generation.load(Ordering::SeqCst);
        let window = self.config.window();
        tokio::spawn(async move {
            tokio::time::sleep(window).await;
            if manager.generation.load(Ordering::SeqCst) == generation {
                manager.flush().await;
            }
        });
    }

    /// Drain the pending queue and dispatch every item concurrently. Items
    /// enqueued after this point belong to the next batch.
    pub async fn flush(&self) {
        let items = {
            let mut pending = self.pending.lock().await;
            if pending.is_empty() {
                return;
            }
            self.generation.fetch_add(1, Ordering::SeqCst);
            std::mem::take(&mut *pending)
        };

        self.counters.batches_flushed.fetch_add(1, Ordering::Relaxed);
        self.counters
            .batched_calls
            .fetch_add(items.len() as u64, Ordering::Relaxed);
        log::debug!("flushing batch of {} items", items.len());

        for item in items {
            let router = self.router.clone();
            tokio::spawn(async move {
                log::debug!(
                    "dispatching batch item {} after {:?} queued",
                    item.id,
                    item.enqueued_at.elapsed()
                );
                let response = router.handle(item.request).await;
                let _ = item.resolver.send(Ok(response));
            });
        }
    }

    /// Execute a caller-supplied list of requests immediately, bypassing the
    /// window. Results come back in input order.
    pub async fn execute_batch_manual(
        &self,
        requests: Vec<Request>,
    ) -> Vec<Result<Response, BatchError>> {
        self.counters
            .total_calls
            .fetch_add(requests.len() as u64, Ordering::Relaxed);

        let handles: Vec<_> = requests
            .into_iter()
            .map(|request| {
                let router = self.router.clone();
                tokio::spawn(async move { router.handle(request).await })
            })
            .collect();

        let mut results = Vec::with_capacity(handles.len());
        for handle in handles {
            results.push(
                handle
                    .await
                    .map_err(|err| BatchError::Dispatch(err.to_string())),
            );
        }
        results
    }

    /// Reject every pending item with a cleared error and reset the window.
    pub async fn clear(&self) {
        let items = {
            let mut pending = self.pending.lock().await;
            if pending.is_empty() {
                return;
            }
            self.generation.fetch_add(1, Ordering::SeqCst);
            std::mem::take(&mut *pending)
        };
        log::debug!("rejecting {} pending batch items", items.len());
        for item in items {
            let _ = item.resolver.send(Err(BatchError::Cleared));
        }
    }

    pub async fn pending_count(&self) -> usize {
        self.pending.lock().await.len()
    }

    pub fn stats(&self) -> BatchStats {
        let batched_calls = self.counters.batched_calls.load(Ordering::Relaxed);
        let batches_flushed = self.counters.batches_flushed.load(Ordering::Relaxed);
        BatchStats {
            total_calls: self.counters.total_calls.load(Ordering::Relaxed),
            batched_calls,
            batches_flushed,
            average_batch_size: if batches_flushed == 0 {
                0.0
            } else {
                batched_calls as f64 / batches_flushed as f64
            },
        }
    }
}
