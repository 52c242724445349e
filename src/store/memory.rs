use async_trait::async_trait;
use sessioncore::store::{KeyValueStore, RecentMessageStore, Result, StoreError};
use sessioncore::types::InboundMessage;
use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::Mutex;

/// Volatile store, used by tests and by embedders that do not need
/// credentials to survive a restart.
///
/// Keys are kept ordered so prefix deletes are a range walk. The store can be
/// switched offline to simulate an unreachable database.
pub struct MemoryStore {
    values: Mutex<BTreeMap<String, Vec<u8>>>,
    messages: Mutex<VecDeque<String>>,
    message_limit: usize,
    available: AtomicBool,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::with_message_limit(10_000)
    }

    pub fn with_message_limit(message_limit: usize) -> Self {
        Self {
            values: Mutex::new(BTreeMap::new()),
            messages: Mutex::new(VecDeque::new()),
            message_limit: message_limit.max(1),
            available: AtomicBool::new(true),
        }
    }

    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    pub async fn key_count(&self) -> usize {
        self.values.lock().await.len()
    }

    fn check(&self) -> Result<()> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(StoreError::Unavailable("memory store is offline".to_string()))
        }
    }
}

#[async_trait]
impl KeyValueStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        self.check()?;
        Ok(self.values.lock().await.get(key).cloned())
    }

    async fn set(&self, key: &str, value: &[u8]) -> Result<()> {
        self.check()?;
        self.values
            .lock()
            .await
            .insert(key.to_string(), value.to_vec());
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        self.check()?;
        Ok(self.values.lock().await.remove(key).is_some())
    }

    async fn delete_prefix(&self, prefix: &str) -> Result<usize> {
        self.check()?;
        let mut values = self.values.lock().await;
        let doomed: Vec<String> = values
            .range(prefix.to_string()..)
            .map(|(key, _)| key)
            .take_while(|key| key.starts_with(prefix))
            .cloned()
            .collect();
        for key in &doomed {
            values.remove(key);
        }
        Ok(doomed.len())
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}

#[async_trait]
impl RecentMessageStore for MemoryStore {
    async fn persist_message(&self, message: &InboundMessage) -> Result<()> {
        self.check()?;
        let mut messages = self.messages.lock().await;
        if messages.contains(&message.id) {
            return Ok(());
        }
        messages.push_back(message.id.clone());
        while messages.len() > self.message_limit {
            messages.pop_front();
        }
        Ok(())
    }

    async fn contains_recent(&self, message_id: &str, scan_limit: usize) -> Result<bool> {
        self.check()?;
        let messages = self.messages.lock().await;
        Ok(messages.iter().rev().take(scan_limit).any(|id| id == message_id))
    }
}
