use anyhow::Result;
use serde_json::Value;

/// Persistent key/value collaborator used beneath the cache tier-two and the
/// optimistic engine. Implementations are free to be durable or not; the
/// core only relies on this boundary.
#[async_trait::async_trait]
pub trait Storage: Send + Sync {
    async fn save(&self, key: &str, value: Value) -> Result<()>;
    /// Fetch a value. Implementations must return an error when the key is
    /// absent; callers that can tolerate absence match on the `Err`.
    async fn get(&self, key: &str) -> Result<Value>;
    async fn delete(&self, key: &str) -> Result<()>;
    /// List every stored key starting with `prefix`.
    async fn list(&self, prefix: &str) -> Result<Vec<String>>;
}
