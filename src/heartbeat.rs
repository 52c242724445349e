use crate::store::CredentialStore;
use chrono::Utc;
use log::{debug, info, warn};
use sessioncore::liveness::{LivenessRecord, OfflineReport};
use sessioncore::store::Result;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, Notify};
use tokio::task::JoinHandle;

struct Running {
    identity: String,
    stop: Arc<Notify>,
    task: JoinHandle<()>,
}

/// Keeps the liveness record of the connected identity fresh and reports,
/// on each connect, how long the process had been away.
///
/// Cloning is cheap; all clones share one heartbeat task.
#[derive(Clone)]
pub struct LivenessTracker {
    store: Arc<CredentialStore>,
    interval: Duration,
    offline_threshold: chrono::Duration,
    running: Arc<Mutex<Option<Running>>>,
    // Serializes read-modify-write cycles on the record.
    record_lock: Arc<Mutex<()>>,
}

impl LivenessTracker {
    pub fn new(store: Arc<CredentialStore>, interval: Duration, offline_threshold: Duration) -> Self {
        Self {
            store,
            interval,
            offline_threshold: chrono::Duration::from_std(offline_threshold)
                .unwrap_or(chrono::Duration::MAX),
            running: Arc::new(Mutex::new(None)),
            record_lock: Arc::new(Mutex::new(())),
        }
    }

    /// Records a startup for `identity` and compares the previous
    /// `last_active_at` with now.
    pub async fn initialize(&self, identity: &str) -> Result<OfflineReport> {
        let _guard = self.record_lock.lock().await;
        let now = Utc::now();
        let (mut record, report) = match self.store.load_liveness(identity).await? {
            Some(record) => {
                let report = record.offline_report(now, self.offline_threshold);
                (record, report)
            }
            None => (LivenessRecord::new(now), OfflineReport::online()),
        };
        record.startup_count += 1;
        record.last_active_at = now;
        self.store.save_liveness(identity, &record).await?;

        if report.was_offline {
            info!(target: "Session/Heartbeat", "{identity} was offline for {}s", report.offline_duration.num_seconds());
        }
        Ok(report)
    }

    /// Refreshes `last_active_at` once.
    pub async fn heartbeat(&self, identity: &str) -> Result<()> {
        self.update(identity, |record| record.last_active_at = Utc::now())
            .await
    }

    pub async fn record_missed(&self, identity: &str, count: u64) -> Result<()> {
        self.update(identity, |record| {
            record.missed_messages_processed += count;
        })
        .await
    }

    async fn update(&self, identity: &str, f: impl FnOnce(&mut LivenessRecord)) -> Result<()> {
        let _guard = self.record_lock.lock().await;
        let mut record = self
            .store
            .load_liveness(identity)
            .await?
            .unwrap_or_else(|| LivenessRecord::new(Utc::now()));
        f(&mut record);
        self.store.save_liveness(identity, &record).await
    }

    /// Starts the fixed-interval heartbeat for `identity`, replacing any
    /// heartbeat that is already running.
    pub async fn start(&self, identity: &str) {
        let stop = Arc::new(Notify::new());
        let task = tokio::spawn(heartbeat_loop(self.clone(), identity.to_string(), stop.clone()));
        let previous = self.running.lock().await.replace(Running {
            identity: identity.to_string(),
            stop,
            task,
        });
        if let Some(previous) = previous {
            previous.stop.notify_one();
            previous.task.abort();
        }
        debug!(target: "Session/Heartbeat", "Heartbeat started for {identity} every {:?}", self.interval);
    }

    pub async fn is_running(&self) -> bool {
        self.running.lock().await.is_some()
    }

    /// Stops the heartbeat and writes `last_shutdown_at`. Failures are
    /// logged; there is nothing useful a caller could do with them.
    pub async fn shutdown(&self) {
        let Some(running) = self.running.lock().await.take() else {
            return;
        };
        running.stop.notify_one();
        if let Err(e) = running.task.await {
            if !e.is_cancelled() {
                warn!(target: "Session/Heartbeat", "Heartbeat task ended abnormally: {e}");
            }
        }

        let identity = running.identity;
        let result = self
            .update(&identity, |record| {
                let now = Utc::now();
                record.last_active_at = now;
                record.last_shutdown_at = Some(now);
            })
            .await;
        match result {
            Ok(()) => debug!(target: "Session/Heartbeat", "Recorded shutdown for {identity}"),
            Err(e) => warn!(target: "Session/Heartbeat", "Failed to record shutdown for {identity}: {e}"),
        }
    }
}

async fn heartbeat_loop(tracker: LivenessTracker, identity: String, stop: Arc<Notify>) {
    let mut ticker = tokio::time::interval(tracker.interval);
    // The first tick completes immediately and initialize() already wrote.
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                if let Err(e) = tracker.heartbeat(&identity).await {
                    warn!(target: "Session/Heartbeat", "Heartbeat write failed for {identity}: {e}");
                }
            }
            _ = stop.notified() => {
                debug!(target: "Session/Heartbeat", "Stop signaled, exiting heartbeat loop.");
                return;
            }
        }
    }
}
