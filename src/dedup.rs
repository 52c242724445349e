use log::{debug, warn};
use sessioncore::dedup::DedupCache;
use sessioncore::store::RecentMessageStore;
use std::sync::Arc;
use std::time::Duration;

/// The in-memory half of duplicate detection. Owned by the session actor, so
/// checking and marking never wait on I/O.
pub struct MessageDeduplicator {
    cache: DedupCache,
}

impl MessageDeduplicator {
    pub fn new(cache: DedupCache) -> Self {
        Self { cache }
    }

    pub fn is_duplicate(&self, message_id: &str) -> bool {
        self.cache.contains(message_id)
    }

    /// Must run before any asynchronous work on the message starts.
    pub fn mark_processed(&mut self, message_id: &str) {
        self.cache.insert(message_id);
    }

    pub fn len(&self) -> usize {
        self.cache.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cache.is_empty()
    }
}

/// Bounded scan of messages that were stored before a restart, consulted
/// after an in-memory miss.
#[derive(Clone)]
pub struct PersistedScan {
    store: Option<Arc<dyn RecentMessageStore>>,
    scan_limit: usize,
    timeout: Duration,
}

impl PersistedScan {
    pub fn new(
        store: Option<Arc<dyn RecentMessageStore>>,
        scan_limit: usize,
        timeout: Duration,
    ) -> Self {
        Self {
            store,
            scan_limit,
            timeout,
        }
    }

    /// True when `message_id` is among the recently stored messages. Failed
    /// or slow scans count as "not seen".
    pub async fn seen_before(&self, message_id: &str) -> bool {
        let Some(store) = &self.store else {
            return false;
        };
        if self.scan_limit == 0 {
            return false;
        }
        match tokio::time::timeout(self.timeout, store.contains_recent(message_id, self.scan_limit))
            .await
        {
            Ok(Ok(found)) => {
                if found {
                    debug!(target: "Session/Dedup", "{message_id} found in persisted messages");
                }
                found
            }
            Ok(Err(e)) => {
                warn!(target: "Session/Dedup", "Persisted message scan failed, treating {message_id} as new: {e}");
                false
            }
            Err(_) => {
                warn!(target: "Session/Dedup", "Persisted message scan timed out after {:?}, treating {message_id} as new", self.timeout);
                false
            }
        }
    }
}
