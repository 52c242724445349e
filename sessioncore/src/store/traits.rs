use crate::store::error::Result;
use crate::types::InboundMessage;
use async_trait::async_trait;

/// Byte-oriented persistence keyed by opaque strings.
///
/// Values are always written whole; implementations must never leave a
/// partially written value visible after a crash.
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;
    async fn set(&self, key: &str, value: &[u8]) -> Result<()>;
    /// Returns whether the key existed.
    async fn delete(&self, key: &str) -> Result<bool>;

    /// Deletes every key starting with `prefix` as one batch. Returns the
    /// number of keys removed.
    async fn delete_prefix(&self, prefix: &str) -> Result<usize>;

    /// Cheap reachability check used once at startup.
    async fn probe(&self) -> Result<()> {
        self.get("__probe__").await.map(|_| ())
    }

    /// Short name for logs.
    fn name(&self) -> &'static str;
}

/// Messages that have already been durably stored downstream.
#[async_trait]
pub trait RecentMessageStore: Send + Sync {
    async fn persist_message(&self, message: &InboundMessage) -> Result<()>;

    /// Whether `message_id` is among the `scan_limit` most recently stored
    /// messages.
    async fn contains_recent(&self, message_id: &str, scan_limit: usize) -> Result<bool>;
}
