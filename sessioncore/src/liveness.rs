use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// Persisted heartbeat bookkeeping for one identity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LivenessRecord {
    pub last_active_at: DateTime<Utc>,
    #[serde(default)]
    pub last_shutdown_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub startup_count: u64,
    #[serde(default)]
    pub missed_messages_processed: u64,
}

impl LivenessRecord {
    pub fn new(now: DateTime<Utc>) -> Self {
        Self {
            last_active_at: now,
            last_shutdown_at: None,
            startup_count: 0,
            missed_messages_processed: 0,
        }
    }

    /// Compares `last_active_at` against `now`.
    pub fn offline_report(&self, now: DateTime<Utc>, threshold: Duration) -> OfflineReport {
        let gap = now.signed_duration_since(self.last_active_at);
        if gap > threshold {
            OfflineReport {
                was_offline: true,
                offline_since: Some(self.last_active_at),
                offline_duration: gap,
            }
        } else {
            OfflineReport::online()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OfflineReport {
    pub was_offline: bool,
    pub offline_since: Option<DateTime<Utc>>,
    #[serde(serialize_with = "serialize_seconds")]
    pub offline_duration: Duration,
}

impl OfflineReport {
    pub fn online() -> Self {
        Self {
            was_offline: false,
            offline_since: None,
            offline_duration: Duration::zero(),
        }
    }
}

fn serialize_seconds<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
where
    S: serde::Serializer,
{
    serializer.serialize_i64(duration.num_seconds())
}
