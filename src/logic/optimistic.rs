use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{oneshot, RwLock};

use crate::model::{generate_id, Id};
use crate::store::cache::{CacheLayer, CacheOptions};
use crate::store::traits::Storage;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateKind {
    Create,
    Update,
    Delete,
}

/// Per-call knobs. Rollback is on unless explicitly disabled; callbacks are
/// fired from the settlement task after the terminal outcome is applied.
pub struct OptimisticOptions {
    pub rollback_on_error: bool,
    pub on_success: Option<Box<dyn FnOnce(&Value) + Send>>,
    pub on_error: Option<Box<dyn FnOnce(&anyhow::Error) + Send>>,
}

impl Default for OptimisticOptions {
    fn default() -> Self {
        Self {
            rollback_on_error: true,
            on_success: None,
            on_error: None,
        }
    }
}

impl OptimisticOptions {
    pub fn keep_on_error() -> Self {
        Self {
            rollback_on_error: false,
            ..Self::default()
        }
    }
}

/// Pending record. The rollback target is an explicit snapshot captured at
/// creation time, never a closure over live state, so concurrent updates to
/// the same resource each roll back to their own pre-update view.
struct PendingUpdate {
    id: Id,
    kind: UpdateKind,
    resource_type: String,
    resource_id: Id,
    optimistic_value: Option<Value>,
    snapshot: Option<Value>,
    created_at: DateTime<Utc>,
}

/// Terminal outcome of one optimistic update. Exactly one of these is
/// produced per record.
#[derive(Debug, Clone, PartialEq)]
pub enum Settlement {
    Committed(Value),
    RolledBack(String),
    KeptOptimistic(String),
}

/// Returned synchronously: `value` is the applied optimistic value, visible
/// to reads before the authoritative operation finishes. `settled()` awaits
/// the terminal outcome.
pub struct OptimisticHandle {
    pub update_id: Id,
    pub value: Value,
    settled: oneshot::Receiver<Settlement>,
}

impl OptimisticHandle {
    pub async fn settled(self) -> Settlement {
        self.settled
            .await
            .unwrap_or_else(|_| Settlement::RolledBack("settlement channel closed".to_string()))
    }
}

#[derive(Debug, Default)]
struct OptimisticCounters {
    started: AtomicU64,
    succeeded: AtomicU64,
    rolled_back: AtomicU64,
    kept_on_error: AtomicU64,
}

#[derive(Debug, Clone, Serialize)]
pub struct OptimisticStats {
    pub started: u64,
    pub succeeded: u64,
    pub rolled_back: u64,
    pub kept_on_error: u64,
    pub pending: usize,
    pub success_rate: f64,
    pub rollback_rate: f64,
}

/// Applies caller-supplied values to storage and cache immediately, then
/// reconciles with the authoritative operation in the background: replace on
/// success, restore the snapshot on failure. Each record settles exactly
/// once and is never retried.
pub struct OptimisticEngine {
    storage: Arc<dyn Storage>,
    cache: Arc<CacheLayer>,
    pending: Arc<RwLock<HashMap<Id, PendingUpdate>>>,
    counters: Arc<OptimisticCounters>,
}

impl OptimisticEngine {
    pub fn new(storage: Arc<dyn Storage>, cache: Arc<CacheLayer>) -> Self {
        Self {
            storage,
            cache,
            pending: Arc::new(RwLock::new(HashMap::new())),
            counters: Arc::new(OptimisticCounters::default()),
        }
    }

    /// Persist `value` under `{resource_type}:{id}` immediately and run the
    /// authoritative operation in the background. The id comes from the
    /// value's `id` field when present, otherwise it is generated.
    pub async fn create<Fut>(
        &self,
        resource_type: &str,
        value: Value,
        authoritative: Fut,
        options: OptimisticOptions,
    ) -> Result<OptimisticHandle>
    where
        Fut: Future<Output = Result<Value>> + Send + 'static,
    {
        let resource_id = value
            .get("id")
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_else(generate_id);
        let key = resource_key(resource_type, &resource_id);

        self.storage
            .save(&key, value.clone())
            .await
            .with_context(|| format!("failed to apply optimistic create for '{}'", key))?;
        self.cache
            .set(&key, value.clone(), CacheOptions::default())
            .await;

        let record = PendingUpdate {
            id: generate_id(),
            kind: UpdateKind::Create,
            resource_type: resource_type.to_string(),
            resource_id,
            optimistic_value: Some(value),
            snapshot: None,
            created_at: Utc::now(),
        };
        Ok(self.track(record, key, authoritative, options).await)
    }

    /// Shallow-merge `partial` over the stored value and apply the result
    /// optimistically. Rollback restores exactly the pre-merge snapshot.
    pub async fn update<Fut>(
        &self,
        resource_type: &str,
        resource_id: &str,
        partial: Value,
        authoritative: Fut,
        options: OptimisticOptions,
    ) -> Result<OptimisticHandle>
    where
        Fut: Future<Output = Result<Value>> + Send + 'static,
    {
        let key = resource_key(resource_type, resource_id);
        let current = self
            .storage
            .get(&key)
            .await
            .with_context(|| format!("cannot optimistically update missing resource '{}'", key))?;

        let merged = shallow_merge(&current, partial);
        self.storage
            .save(&key, merged.clone())
            .await
            .with_context(|| format!("failed to apply optimistic update for '{}'", key))?;
        self.cache
            .set(&key, merged.clone(), CacheOptions::default())
            .await;

        let record = PendingUpdate {
            id: generate_id(),
            kind: UpdateKind::Update,
            resource_type: resource_type.to_string(),
            resource_id: resource_id.to_string(),
            optimistic_value: Some(merged),
            snapshot: Some(current),
            created_at: Utc::now(),
        };
        Ok(self.track(record, key, authoritative, options).await)
    }

    /// Remove the resource immediately, keeping the pre-delete value as the
    /// rollback snapshot. A committed delete writes nothing further.
    pub async fn delete<Fut>(
        &self,
        resource_type: &str,
        resource_id: &str,
        authoritative: Fut,
        options: OptimisticOptions,
    ) -> Result<OptimisticHandle>
    where
        Fut: Future<Output = Result<Value>> + Send + 'static,
    {
        let key = resource_key(resource_type, resource_id);
        let snapshot = self.storage.get(&key).await.ok();

        self.storage
            .delete(&key)
            .await
            .with_context(|| format!("failed to apply optimistic delete for '{}'", key))?;
        self.cache.delete(&key).await;

        let record = PendingUpdate {
            id: generate_id(),
            kind: UpdateKind::Delete,
            resource_type: resource_type.to_string(),
            resource_id: resource_id.to_string(),
            optimistic_value: None,
            snapshot,
            created_at: Utc::now(),
        };
        Ok(self.track(record, key, authoritative, options).await)
    }

    async fn track<Fut>(
        &self,
        record: PendingUpdate,
        key: String,
        authoritative: Fut,
        options: OptimisticOptions,
    ) -> OptimisticHandle
    where
        Fut: Future<Output = Result<Value>> + Send + 'static,
    {
        let update_id = record.id.clone();
        let optimistic_value = record.optimistic_value.clone();
        self.pending
            .write()
            .await
            .insert(update_id.clone(), record);
        self.counters.started.fetch_add(1, Ordering::Relaxed);

        let (resolver, settled) = oneshot::channel();
        self.spawn_settlement(update_id.clone(), key, authoritative, options, resolver);

        OptimisticHandle {
            update_id,
            value: optimistic_value.unwrap_or(Value::Null),
            settled,
        }
    }

    fn spawn_settlement<Fut>(
        &self,
        update_id: Id,
        key: String,
        authoritative: Fut,
        options: OptimisticOptions,
        resolver: oneshot::Sender<Settlement>,
    ) where
        Fut: Future<Output = Result<Value>> + Send + 'static,
    {
        let storage = Arc::clone(&self.storage);
        let cache = Arc::clone(&self.cache);
        let pending = Arc::clone(&self.pending);
        let counters = Arc::clone(&self.counters);

        tokio::spawn(async move {
            let outcome = authoritative.await;

            // removing the record first guarantees exactly one terminal
            // transition even if this task races with clear()
            let Some(record) = pending.write().await.remove(&update_id) else {
                return;
            };
            let elapsed_ms = (Utc::now() - record.created_at).num_milliseconds();

            let settlement = match outcome {
                Ok(authoritative_value) => {
                    if record.kind != UpdateKind::Delete {
                        if let Err(err) = storage.save(&key, authoritative_value.clone()).await {
                            log::error!(
                                "failed to persist authoritative value for '{}': {:#}",
                                key,
                                err
                            );
                        }
                        cache
                            .set(&key, authoritative_value.clone(), CacheOptions::default())
                            .await;
                    }
                    counters.succeeded.fetch_add(1, Ordering::Relaxed);
                    log::debug!(
                        "optimistic update {} on {}:{} committed after {}ms",
                        record.id,
                        record.resource_type,
                        record.resource_id,
                        elapsed_ms
                    );
                    if let Some(on_success) = options.on_success {
                        on_success(&authoritative_value);
                    }
                    Settlement::Committed(authoritative_value)
                }
                Err(err) => {
                    let message = format!("{:#}", err);
                    if options.rollback_on_error {
                        match &record.snapshot {
                            Some(previous) => {
                                if let Err(save_err) = storage.save(&key, previous.clone()).await {
                                    log::error!(
                                        "rollback failed to restore '{}': {:#}",
                                        key,
                                        save_err
                                    );
                                }
                                cache
                                    .set(&key, previous.clone(), CacheOptions::default())
                                    .await;
                            }
                            None if record.kind == UpdateKind::Delete => {
                                // the key was absent before the delete; nothing to restore
                            }
                            None => {
                                if let Err(delete_err) = storage.delete(&key).await {
                                    log::error!(
                                        "rollback failed to remove '{}': {:#}",
                                        key,
                                        delete_err
                                    );
                                }
                                cache.delete(&key).await;
                            }
                        }
                        counters.rolled_back.fetch_add(1, Ordering::Relaxed);
                        log::warn!(
                            "optimistic update {} on {}:{} rolled back: {}",
                            record.id,
                            record.resource_type,
                            record.resource_id,
                            message
                        );
                        if let Some(on_error) = options.on_error {
                            on_error(&err);
                        }
                        Settlement::RolledBack(message)
                    } else {
                        counters.kept_on_error.fetch_add(1, Ordering::Relaxed);
                        log::warn!(
                            "optimistic update {} on {}:{} failed but kept value {:?}",
                            record.id,
                            record.resource_type,
                            record.resource_id,
                            record.optimistic_value
                        );
                        if let Some(on_error) = options.on_error {
                            on_error(&err);
                        }
                        Settlement::KeptOptimistic(message)
                    }
                }
            };
            let _ = resolver.send(settlement);
        });
    }

    pub async fn pending_count(&self) -> usize {
        self.pending.read().await.len()
    }

    pub async fn stats(&self) -> OptimisticStats {
        let pending = self.pending.read().await.len();
        let started = self.counters.started.load(Ordering::Relaxed);
        let succeeded = self.counters.succeeded.load(Ordering::Relaxed);
        let rolled_back = self.counters.rolled_back.load(Ordering::Relaxed);
        OptimisticStats {
            started,
            succeeded,
            rolled_back,
            kept_on_error: self.counters.kept_on_error.load(Ordering::Relaxed),
            pending,
            success_rate: rate(succeeded, started),
            rollback_rate: rate(rolled_back, started),
        }
    }
}

fn resource_key(resource_type: &str, resource_id: &str) -> String {
    format!("{}:{}", resource_type, resource_id)
}

fn shallow_merge(current: &Value, partial: Value) -> Value {
    match (current, partial) {
        (Value::Object(base), Value::Object(overlay)) => {
            let mut merged = base.clone();
            for (key, value) in overlay {
                merged.insert(key, value);
            }
            Value::Object(merged)
        }
        (_, partial) => partial,
    }
}

fn rate(part: u64, whole: u64) -> f64 {
    if whole == 0 {
        0.0
    } else {
        part as f64 / whole as f64
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CacheConfig;
    use crate::store::memory::MemoryStorage;
    use serde_json::json;
    use std::sync::atomic::AtomicBool;

    fn engine() -> (OptimisticEngine, Arc<MemoryStorage>, Arc<CacheLayer>) {
        let storage = Arc::new(MemoryStorage::new());
        let cache = Arc::new(CacheLayer::new(
            &CacheConfig::default(),
            storage.clone() as Arc<dyn Storage>,
        ));
        let engine = OptimisticEngine::new(storage.clone() as Arc<dyn Storage>, cache.clone());
        (engine, storage, cache)
    }

    #[tokio::test]
    async fn test_create_commits_authoritative_value() {
        let (engine, storage, _cache) = engine();

        let handle = engine
            .create(
                "todo",
                json!({"id": "1", "title": "draft"}),
                async { Ok(json!({"id": "1", "title": "draft", "server_rev": 3})) },
                OptimisticOptions::default(),
            )
            .await
            .unwrap();

        // the optimistic value is readable before settlement
        assert_eq!(handle.value, json!({"id": "1", "title": "draft"}));

        let settlement = handle.settled().await;
        assert_eq!(
            settlement,
            Settlement::Committed(json!({"id": "1", "title": "draft", "server_rev": 3}))
        );
        assert_eq!(
            storage.get("todo:1").await.unwrap(),
            json!({"id": "1", "title": "draft", "server_rev": 3})
        );

        let stats = engine.stats().await;
        assert_eq!(stats.started, 1);
        assert_eq!(stats.succeeded, 1);
        assert_eq!(stats.pending, 0);
    }

    #[tokio::test]
    async fn test_create_failure_rolls_back_to_absence() {
        let (engine, storage, cache) = engine();

        let handle = engine
            .create(
                "todo",
                json!({"id": "1", "title": "draft"}),
                async { Err(anyhow::anyhow!("server rejected")) },
                OptimisticOptions::default(),
            )
            .await
            .unwrap();

        match handle.settled().await {
            Settlement::RolledBack(message) => assert!(message.contains("server rejected")),
            other => panic!("expected rollback, got {:?}", other),
        }
        assert!(storage.get("todo:1").await.is_err());
        assert_eq!(cache.get("todo:1").await, None);
        assert_eq!(engine.stats().await.rolled_back, 1);
        assert_eq!(engine.pending_count().await, 0);
    }

    #[tokio::test]
    async fn test_update_failure_restores_pre_merge_snapshot() {
        let (engine, storage, _cache) = engine();
        storage
            .save("todo:1", json!({"id": "1", "done": false, "title": "x"}))
            .await
            .unwrap();

        let handle = engine
            .update(
                "todo",
                "1",
                json!({"done": true}),
                async { Err(anyhow::anyhow!("x")) },
                OptimisticOptions::default(),
            )
            .await
            .unwrap();

        // the merged value was applied optimistically
        assert_eq!(
            handle.value,
            json!({"id": "1", "done": true, "title": "x"})
        );
        assert_eq!(
            storage.get("todo:1").await.unwrap(),
            json!({"id": "1", "done": true, "title": "x"})
        );

        handle.settled().await;
        // exactly the pre-merge snapshot is back
        assert_eq!(
            storage.get("todo:1").await.unwrap(),
            json!({"id": "1", "done": false, "title": "x"})
        );
    }

    #[tokio::test]
    async fn test_update_missing_resource_is_a_synchronous_error() {
        let (engine, _storage, _cache) = engine();
        let result = engine
            .update(
                "todo",
                "absent",
                json!({"done": true}),
                async { Ok(json!(null)) },
                OptimisticOptions::default(),
            )
            .await;
        assert!(result.is_err());
        assert_eq!(engine.stats().await.started, 0);
    }

    #[tokio::test]
    async fn test_delete_failure_restores_previous_value() {
        let (engine, storage, cache) = engine();
        storage.save("todo:1", json!({"id": "1"})).await.unwrap();

        let handle = engine
            .delete(
                "todo",
                "1",
                async { Err(anyhow::anyhow!("offline")) },
                OptimisticOptions::default(),
            )
            .await
            .unwrap();

        // removed immediately
        assert!(storage.get("todo:1").await.is_err());

        handle.settled().await;
        assert_eq!(storage.get("todo:1").await.unwrap(), json!({"id": "1"}));
        assert_eq!(cache.get("todo:1").await, Some(json!({"id": "1"})));
    }

    #[tokio::test]
    async fn test_delete_success_writes_nothing_back() {
        let (engine, storage, _cache) = engine();
        storage.save("todo:1", json!({"id": "1"})).await.unwrap();

        let handle = engine
            .delete("todo", "1", async { Ok(Value::Null) }, OptimisticOptions::default())
            .await
            .unwrap();

        assert!(matches!(handle.settled().await, Settlement::Committed(_)));
        assert!(storage.get("todo:1").await.is_err());
    }

    #[tokio::test]
    async fn test_rollback_disabled_keeps_optimistic_value() {
        let (engine, storage, _cache) = engine();
        storage.save("todo:1", json!({"done": false})).await.unwrap();

        let handle = engine
            .update(
                "todo",
                "1",
                json!({"done": true}),
                async { Err(anyhow::anyhow!("x")) },
                OptimisticOptions::keep_on_error(),
            )
            .await
            .unwrap();

        match handle.settled().await {
            Settlement::KeptOptimistic(_) => {}
            other => panic!("expected kept value, got {:?}", other),
        }
        assert_eq!(
            storage.get("todo:1").await.unwrap(),
            json!({"done": true})
        );
        assert_eq!(engine.stats().await.kept_on_error, 1);
        assert_eq!(engine.stats().await.rolled_back, 0);
    }

    #[tokio::test]
    async fn test_callbacks_fire_on_each_path() {
        let (engine, storage, _cache) = engine();
        storage.save("todo:1", json!({"v": 1})).await.unwrap();

        let succeeded = Arc::new(AtomicBool::new(false));
        let flag = succeeded.clone();
        let handle = engine
            .update(
                "todo",
                "1",
                json!({"v": 2}),
                async { Ok(json!({"v": 2})) },
                OptimisticOptions {
                    on_success: Some(Box::new(move |_value| {
                        flag.store(true, Ordering::SeqCst);
                    })),
                    ..OptimisticOptions::default()
                },
            )
            .await
            .unwrap();
        handle.settled().await;
        assert!(succeeded.load(Ordering::SeqCst));

        let failed = Arc::new(AtomicBool::new(false));
        let flag = failed.clone();
        let handle = engine
            .update(
                "todo",
                "1",
                json!({"v": 3}),
                async { Err(anyhow::anyhow!("x")) },
                OptimisticOptions {
                    on_error: Some(Box::new(move |_err| {
                        flag.store(true, Ordering::SeqCst);
                    })),
                    ..OptimisticOptions::default()
                },
            )
            .await
            .unwrap();
        handle.settled().await;
        assert!(failed.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_create_without_id_generates_one() {
        let (engine, storage, _cache) = engine();

        let handle = engine
            .create(
                "note",
                json!({"text": "hi"}),
                async { Ok(json!({"text": "hi"})) },
                OptimisticOptions::default(),
            )
            .await
            .unwrap();
        handle.settled().await;

        let keys = storage.list("note:").await.unwrap();
        assert_eq!(keys.len(), 1);
    }
}
