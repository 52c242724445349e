use super::delivery::Forwarder;
use super::manager::{ManagerParts, SessionManager};
use super::messages::Command;
use crate::config::SessionConfig;
use crate::dedup::{MessageDeduplicator, PersistedScan};
use crate::error::SessionError;
use crate::heartbeat::LivenessTracker;
use crate::qrcode::{self, QrCodeEvent, QrError};
use crate::store::{CredentialStore, PersistenceManager, SqliteStore, StoreBackend};
use crate::transport::TransportFactory;
use crate::types::events::EventBus;
use log::info;
use sessioncore::dedup::DedupCache;
use sessioncore::qr::QrLifecycle;
use sessioncore::store::{KeyValueStore, RecentMessageStore};
use sessioncore::types::{ConnectionState, InboundMessage};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;

/// Cloneable front door to a running session.
#[derive(Clone)]
pub struct SessionHandle {
    commands: mpsc::Sender<Command>,
    state: watch::Receiver<ConnectionState>,
    bus: Arc<EventBus>,
    qr_ttl: Duration,
    backend: StoreBackend,
}

impl SessionHandle {
    async fn request<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<T>) -> Command,
    ) -> Result<T, SessionError> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(make(tx))
            .await
            .map_err(|_| SessionError::ActorGone)?;
        rx.await.map_err(|_| SessionError::ActorGone)
    }

    /// Starts connecting. Without `force` this does nothing unless the
    /// session is idle or waiting to reconnect; with `force` any current
    /// attempt is torn down first and terminal errors are cleared.
    pub async fn start(&self, force: bool) -> Result<(), SessionError> {
        self.request(|ack| Command::Start { force, ack }).await
    }

    pub async fn stop(&self) -> Result<(), SessionError> {
        self.request(|ack| Command::Stop { ack }).await
    }

    /// Logs out at the protocol level, deletes stored credentials, then stops.
    pub async fn logout(&self) -> Result<(), SessionError> {
        self.request(|ack| Command::Logout { ack }).await?
    }

    /// Latest published snapshot.
    pub fn state(&self) -> ConnectionState {
        self.state.borrow().clone()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.clone()
    }

    pub fn events(&self) -> &Arc<EventBus> {
        &self.bus
    }

    pub fn store_backend(&self) -> StoreBackend {
        self.backend
    }

    /// Channel of QR codes to show until the pairing ends one way or another.
    pub fn qr_channel(&self) -> Result<mpsc::Receiver<QrCodeEvent>, QrError> {
        let state = self.state.borrow().clone();
        qrcode::qr_channel(&self.bus, &state, self.qr_ttl)
    }
}

pub struct Session;

impl Session {
    pub fn builder() -> SessionBuilder {
        SessionBuilder::new()
    }
}

/// A started session: the handle, the stream of deduplicated inbound
/// messages, and the actor task.
pub struct RunningSession {
    pub handle: SessionHandle,
    pub messages: mpsc::Receiver<InboundMessage>,
    pub task: JoinHandle<()>,
}

#[derive(Default)]
pub struct SessionBuilder {
    config: SessionConfig,
    factory: Option<Arc<dyn TransportFactory>>,
    primary: Option<Arc<dyn KeyValueStore>>,
    message_store: Option<Arc<dyn RecentMessageStore>>,
}

impl SessionBuilder {
    fn new() -> Self {
        Self::default()
    }

    pub fn with_config(mut self, config: SessionConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_transport_factory(mut self, factory: Arc<dyn TransportFactory>) -> Self {
        self.factory = Some(factory);
        self
    }

    /// Primary credential store. Without one, credentials go straight to
    /// the fallback directory.
    pub fn with_primary_store(mut self, store: Arc<dyn KeyValueStore>) -> Self {
        self.primary = Some(store);
        self
    }

    /// Store consulted for messages that were handled before a restart.
    pub fn with_message_store(mut self, store: Arc<dyn RecentMessageStore>) -> Self {
        self.message_store = Some(store);
        self
    }

    /// Uses one SQLite database for both credentials and the message log.
    pub fn with_sqlite_store(self, store: Arc<SqliteStore>) -> Self {
        self.with_primary_store(store.clone())
            .with_message_store(store)
    }

    pub async fn build(self) -> Result<RunningSession, SessionError> {
        let config = self.config;
        config.validate()?;
        let factory = self.factory.ok_or(SessionError::MissingTransport)?;

        let store = Arc::new(
            CredentialStore::open(
                config.session_id.clone(),
                self.primary,
                config.fallback_dir.clone(),
                config.probe_timeout,
            )
            .await?,
        );
        let backend = store.backend();
        info!(
            "Session '{}' using {:?} credential store",
            config.session_id, backend
        );

        let (commands_tx, commands_rx) = mpsc::channel(config.event_buffer);
        let (pipeline_tx, pipeline_rx) = mpsc::channel(config.event_buffer);
        let (state_tx, state_rx) = watch::channel(ConnectionState::default());
        let bus = Arc::new(EventBus::new());

        let liveness = LivenessTracker::new(
            store.clone(),
            config.liveness.heartbeat_interval,
            config.liveness.offline_threshold,
        );
        let dedup = MessageDeduplicator::new(DedupCache::new(
            config.dedup.capacity,
            config.dedup.eviction_batch,
        ));
        let forwarder = Forwarder {
            scan: PersistedScan::new(
                self.message_store.clone(),
                config.dedup.persistent_scan_limit,
                config.dedup.persistent_scan_timeout,
            ),
            message_store: self.message_store,
            liveness: liveness.clone(),
            pipeline: pipeline_tx,
        };

        let manager = SessionManager::new(ManagerParts {
            commands: commands_rx,
            state_tx,
            bus: bus.clone(),
            factory,
            persistence: PersistenceManager::new(store),
            liveness,
            dedup,
            forwarder,
            policy: config.reconnect.policy(),
            qr: QrLifecycle::new(config.qr.settings()),
            max_fast_restarts: config.reconnect.max_fast_restarts,
            ignored_chats: config.ignored_chats.iter().cloned().collect(),
        });
        let task = tokio::spawn(manager.run());

        Ok(RunningSession {
            handle: SessionHandle {
                commands: commands_tx,
                state: state_rx,
                bus,
                qr_ttl: config.qr.ttl,
                backend,
            },
            messages: pipeline_rx,
            task,
        })
    }
}
