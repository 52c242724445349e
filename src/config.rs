use serde::Deserialize;
use sessioncore::dedup::{DEFAULT_DEDUP_CAPACITY, DEFAULT_EVICTION_BATCH};
use sessioncore::qr::{DEFAULT_MAX_QR_RETRIES, DEFAULT_QR_MIN_SPACING, DEFAULT_QR_TTL, QrSettings};
use sessioncore::reconnect::{
    DEFAULT_BACKOFF_FACTOR, DEFAULT_BASE_DELAY, DEFAULT_MAX_ATTEMPTS, DEFAULT_MAX_DELAY,
    DEFAULT_PAIRING_DELAY, ReconnectPolicy,
};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse config file: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Settings for one logical session. Durations are milliseconds in JSON.
#[derive(Clone, Debug, Deserialize)]
#[serde(default, rename_all = "snake_case")]
pub struct SessionConfig {
    pub session_id: String,
    /// Directory used when the primary store is unreachable.
    pub fallback_dir: PathBuf,
    #[serde(with = "duration_ms")]
    pub probe_timeout: Duration,
    /// Capacity of the command, event and message channels.
    pub event_buffer: usize,
    pub reconnect: ReconnectConfig,
    pub qr: QrConfig,
    pub dedup: DedupConfig,
    pub liveness: LivenessConfig,
    /// Chats whose messages never reach the pipeline.
    pub ignored_chats: Vec<String>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            session_id: "default".to_string(),
            fallback_dir: PathBuf::from("session_data"),
            probe_timeout: Duration::from_secs(5),
            event_buffer: 64,
            reconnect: ReconnectConfig::default(),
            qr: QrConfig::default(),
            dedup: DedupConfig::default(),
            liveness: LivenessConfig::default(),
            ignored_chats: vec!["status@broadcast".to_string()],
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct ReconnectConfig {
    #[serde(with = "duration_ms")]
    pub pairing_delay: Duration,
    #[serde(with = "duration_ms")]
    pub base_delay: Duration,
    pub factor: f64,
    #[serde(with = "duration_ms")]
    pub max_delay: Duration,
    pub max_attempts: u32,
    /// Consecutive pairing-phase restarts allowed without a new challenge.
    pub max_fast_restarts: u32,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            pairing_delay: DEFAULT_PAIRING_DELAY,
            base_delay: DEFAULT_BASE_DELAY,
            factor: DEFAULT_BACKOFF_FACTOR,
            max_delay: DEFAULT_MAX_DELAY,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            max_fast_restarts: 5,
        }
    }
}

impl ReconnectConfig {
    pub fn policy(&self) -> ReconnectPolicy {
        ReconnectPolicy::new(
            self.pairing_delay,
            self.base_delay,
            self.factor,
            self.max_delay,
            self.max_attempts,
        )
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct QrConfig {
    #[serde(with = "duration_ms")]
    pub ttl: Duration,
    #[serde(with = "duration_ms")]
    pub min_spacing: Duration,
    pub max_retries: u32,
}

impl Default for QrConfig {
    fn default() -> Self {
        Self {
            ttl: DEFAULT_QR_TTL,
            min_spacing: DEFAULT_QR_MIN_SPACING,
            max_retries: DEFAULT_MAX_QR_RETRIES,
        }
    }
}

impl QrConfig {
    pub fn settings(&self) -> QrSettings {
        QrSettings {
            ttl: self.ttl,
            min_spacing: self.min_spacing,
            max_retries: self.max_retries,
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct DedupConfig {
    pub capacity: usize,
    pub eviction_batch: usize,
    /// How many recently persisted messages to consult on an in-memory miss.
    pub persistent_scan_limit: usize,
    /// Upper bound on one persisted-message scan; a slower scan counts as a miss.
    #[serde(with = "duration_ms")]
    pub persistent_scan_timeout: Duration,
}

impl Default for DedupConfig {
    fn default() -> Self {
        Self {
            capacity: DEFAULT_DEDUP_CAPACITY,
            eviction_batch: DEFAULT_EVICTION_BATCH,
            persistent_scan_limit: 200,
            persistent_scan_timeout: Duration::from_secs(2),
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct LivenessConfig {
    #[serde(with = "duration_ms")]
    pub heartbeat_interval: Duration,
    #[serde(with = "duration_ms")]
    pub offline_threshold: Duration,
}

impl Default for LivenessConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(30),
            offline_threshold: Duration::from_secs(120),
        }
    }
}

impl SessionConfig {
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let data = std::fs::read(path)?;
        Self::from_json(&data)
    }

    pub fn from_json(data: &[u8]) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_slice(data)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.session_id.is_empty() {
            return Err(ConfigError::Invalid("session_id must not be empty".into()));
        }
        if self.event_buffer == 0 {
            return Err(ConfigError::Invalid("event_buffer must be positive".into()));
        }
        if !(self.reconnect.factor >= 1.0) {
            return Err(ConfigError::Invalid(format!(
                "reconnect.factor must be >= 1.0, got {}",
                self.reconnect.factor
            )));
        }
        if self.dedup.capacity == 0 {
            return Err(ConfigError::Invalid("dedup.capacity must be positive".into()));
        }
        if self.dedup.eviction_batch == 0 || self.dedup.eviction_batch > self.dedup.capacity {
            return Err(ConfigError::Invalid(
                "dedup.eviction_batch must be between 1 and dedup.capacity".into(),
            ));
        }
        if self.qr.min_spacing >= self.qr.ttl {
            return Err(ConfigError::Invalid(
                "qr.min_spacing must be shorter than qr.ttl".into(),
            ));
        }
        Ok(())
    }
}

mod duration_ms {
    use serde::{Deserialize, Deserializer};
    use std::time::Duration;

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}
