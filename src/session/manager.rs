use super::delivery::{Delivery, Forwarder};
use super::messages::{Command, Internal, OpenResult};
use super::timers::TimerSlot;
use crate::dedup::MessageDeduplicator;
use crate::error::SessionError;
use crate::heartbeat::LivenessTracker;
use crate::store::persistence_manager::{PersistenceManager, completion};
use crate::transport::{Transport, TransportFactory};
use crate::types::events::{
    Connected, CredentialsPersisted, Disconnected, EventBus, Exhausted, ExhaustedKind, LoggedOut,
    ReconnectScheduled,
};
use chrono::Utc;
use log::{debug, error, info, warn};
use sessioncore::qr::{ExpiryOutcome, QrDecision, QrLifecycle};
use sessioncore::reconnect::{ReconnectContext, ReconnectPolicy};
use sessioncore::store::CredentialUpdate;
use sessioncore::types::{
    ConnectionPhase, ConnectionState, DeliveryType, DisconnectReason, Identity, InboundMessage,
    TransportEvent,
};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

/// The live transport and the task pumping its events into the actor.
struct LiveTransport {
    transport: Arc<dyn Transport>,
    pump: JoinHandle<()>,
}

pub(crate) struct ManagerParts {
    pub commands: mpsc::Receiver<Command>,
    pub state_tx: watch::Sender<ConnectionState>,
    pub bus: Arc<EventBus>,
    pub factory: Arc<dyn TransportFactory>,
    pub persistence: PersistenceManager,
    pub liveness: LivenessTracker,
    pub dedup: MessageDeduplicator,
    pub forwarder: Forwarder,
    pub policy: ReconnectPolicy,
    pub qr: QrLifecycle,
    pub max_fast_restarts: u32,
    pub ignored_chats: HashSet<String>,
}

/// Single owner of the connection phase. Commands, transport events and
/// timer firings are all handled one at a time from `run`.
pub(crate) struct SessionManager {
    commands: mpsc::Receiver<Command>,
    internal_tx: mpsc::UnboundedSender<Internal>,
    internal_rx: mpsc::UnboundedReceiver<Internal>,

    state: ConnectionState,
    state_tx: watch::Sender<ConnectionState>,
    bus: Arc<EventBus>,

    factory: Arc<dyn TransportFactory>,
    persistence: PersistenceManager,
    liveness: LivenessTracker,
    dedup: MessageDeduplicator,
    deliveries: mpsc::UnboundedSender<Delivery>,

    policy: ReconnectPolicy,
    qr: QrLifecycle,
    max_fast_restarts: u32,
    ignored_chats: HashSet<String>,

    // Bumped whenever the current transport is abandoned.
    generation: u64,
    transport: Option<LiveTransport>,
    opening: bool,
    qr_timer: TimerSlot,
    reconnect_timer: TimerSlot,

    reconnect_attempts: u32,
    fast_restarts: u32,
    ever_opened: bool,
    exhausted: bool,
}

impl SessionManager {
    pub(crate) fn new(parts: ManagerParts) -> Self {
        let (internal_tx, internal_rx) = mpsc::unbounded_channel();
        let state = parts.state_tx.borrow().clone();
        let deliveries = parts.forwarder.spawn(internal_tx.clone());
        Self {
            commands: parts.commands,
            internal_tx,
            internal_rx,
            state,
            state_tx: parts.state_tx,
            bus: parts.bus,
            factory: parts.factory,
            persistence: parts.persistence,
            liveness: parts.liveness,
            dedup: parts.dedup,
            deliveries,
            policy: parts.policy,
            qr: parts.qr,
            max_fast_restarts: parts.max_fast_restarts,
            ignored_chats: parts.ignored_chats,
            generation: 0,
            transport: None,
            opening: false,
            qr_timer: TimerSlot::default(),
            reconnect_timer: TimerSlot::default(),
            reconnect_attempts: 0,
            fast_restarts: 0,
            ever_opened: false,
            exhausted: false,
        }
    }

    pub(crate) async fn run(mut self) {
        info!(target: "Session/Manager", "Session manager started");
        loop {
            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(command) => self.handle_command(command).await,
                    None => break,
                },
                Some(internal) = self.internal_rx.recv() => self.handle_internal(internal).await,
            }
        }
        self.stop().await;
        info!(target: "Session/Manager", "Session manager stopped");
    }

    fn publish(&mut self) {
        if let Some(violation) = self.state.invariant_violation() {
            error!(target: "Session/Manager", "Publishing inconsistent state: {violation}");
        }
        self.state_tx.send_replace(self.state.clone());
    }

    fn context(&self) -> ReconnectContext {
        if self.ever_opened {
            ReconnectContext::SteadyState
        } else {
            ReconnectContext::Pairing
        }
    }

    fn identity_handle(&self) -> Option<String> {
        self.state.identity.as_ref().map(|i| i.handle.clone())
    }

    async fn handle_command(&mut self, command: Command) {
        match command {
            Command::Start { force, ack } => {
                self.start(force).await;
                let _ = ack.send(());
            }
            Command::Stop { ack } => {
                self.stop().await;
                let _ = ack.send(());
            }
            Command::Logout { ack } => {
                let result = self.logout().await;
                let _ = ack.send(result);
            }
        }
    }

    async fn start(&mut self, force: bool) {
        let from_idle = self.state.status == ConnectionPhase::Idle;
        if !force {
            let allowed = match self.state.status {
                ConnectionPhase::Idle => !self.exhausted,
                ConnectionPhase::Reconnecting => true,
                _ => false,
            };
            if !allowed {
                debug!(target: "Session/Manager", "Ignoring start in phase {} (exhausted: {})", self.state.status, self.exhausted);
                return;
            }
        }

        info!(target: "Session/Manager", "Starting session (force: {force}, phase: {})", self.state.status);
        if force || from_idle {
            self.exhausted = false;
            self.reconnect_attempts = 0;
            self.fast_restarts = 0;
            self.state.error = None;
            self.qr.reset();
        }
        self.begin_attempt().await;
    }

    /// Abandons whatever transport exists and opens a new one.
    async fn begin_attempt(&mut self) {
        self.reconnect_timer.cancel();
        self.qr_timer.cancel();
        self.abandon_transport().await;
        if self.state.status == ConnectionPhase::Connected {
            self.stop_heartbeat();
        }

        self.qr.invalidate();
        self.state.qr_challenge = None;
        self.state.identity = None;
        self.state.connection_started_at = None;
        self.state.enter(ConnectionPhase::Starting);
        self.publish();

        self.opening = true;
        let generation = self.generation;
        let persistence = self.persistence.clone();
        let factory = self.factory.clone();
        let tx = self.internal_tx.clone();
        tokio::spawn(async move {
            let result: OpenResult = match completion(persistence.load_or_create()).await {
                Ok(credentials) => factory.create_transport(&credentials).await,
                Err(e) => Err(anyhow::Error::new(e)),
            };
            let _ = tx.send(Internal::Opened { generation, result });
        });
    }

    /// Detaches from and closes the current transport, and moves to a new
    /// generation so anything still in flight for it is ignored.
    async fn abandon_transport(&mut self) {
        self.generation += 1;
        self.opening = false;
        if let Some(live) = self.transport.take() {
            live.pump.abort();
            live.transport.close().await;
            debug!(target: "Session/Manager", "Closed previous transport");
        }
    }

    async fn stop(&mut self) {
        let had_activity = self.transport.is_some()
            || self.opening
            || self.reconnect_timer.is_pending()
            || self.qr_timer.is_pending();

        self.reconnect_timer.cancel();
        self.qr_timer.cancel();
        self.abandon_transport().await;
        self.qr.reset();
        self.stop_heartbeat();

        let unchanged = self.state.status == ConnectionPhase::Idle
            && self.state.qr_challenge.is_none()
            && self.state.identity.is_none();
        if unchanged && !had_activity {
            debug!(target: "Session/Manager", "Stop requested while already idle");
            return;
        }

        info!(target: "Session/Manager", "Session stopped");
        self.state.qr_challenge = None;
        self.state.identity = None;
        self.state.connection_started_at = None;
        if !self.exhausted {
            self.state.error = None;
        }
        self.state.enter(ConnectionPhase::Idle);
        self.publish();
    }

    async fn logout(&mut self) -> Result<(), SessionError> {
        if let Some(live) = &self.transport {
            if let Err(e) = live.transport.logout().await {
                warn!(target: "Session/Manager", "Transport logout failed, clearing credentials anyway: {e}");
            }
        }
        // Queued behind any pending credential write, ahead of any later load.
        let cleared = self.persistence.clear_all();
        self.ever_opened = false;
        self.exhausted = false;
        self.reconnect_attempts = 0;
        self.stop().await;
        EventBus::emit(&self.bus.logged_out, LoggedOut { on_connect: false });

        let removed = completion(cleared).await?;
        info!(target: "Session/Manager", "Logged out; removed {removed} credential records");
        Ok(())
    }

    fn stop_heartbeat(&self) {
        let liveness = self.liveness.clone();
        tokio::spawn(async move { liveness.shutdown().await });
    }

    async fn handle_internal(&mut self, internal: Internal) {
        if internal
            .generation()
            .is_some_and(|generation| generation != self.generation)
        {
            self.discard_stale(internal).await;
            return;
        }

        match internal {
            Internal::Opened { result, .. } => self.handle_opened(result).await,
            Internal::Transport { event, .. } => self.handle_transport_event(event).await,
            Internal::StreamEnded { .. } => {
                warn!(target: "Session/Manager", "Transport event stream ended without a close");
                self.handle_close(DisconnectReason::Unspecified(None), "event stream ended".to_string())
                    .await;
            }
            Internal::QrExpired { attempt, .. } => self.handle_qr_expired(attempt).await,
            Internal::ReconnectDue { .. } => {
                if self.state.status == ConnectionPhase::Reconnecting {
                    info!(target: "Session/Manager", "Reconnecting (attempt {})", self.reconnect_attempts);
                    self.begin_attempt().await;
                }
            }
            Internal::CredentialsPersisted { result, .. } => match result {
                Ok(revision) => {
                    if let Some(live) = &self.transport {
                        live.transport.acknowledge_credentials(revision).await;
                    }
                    EventBus::emit(
                        &self.bus.credentials_persisted,
                        CredentialsPersisted { revision },
                    );
                }
                Err(e) => {
                    error!(target: "Session/Manager", "Credential update was not persisted: {e}");
                    self.state.error = Some(format!("failed to persist credentials: {e}"));
                    self.publish();
                }
            },
            Internal::LivenessReady { report, .. } => {
                if report.was_offline {
                    EventBus::emit(&self.bus.offline_detected, report);
                }
            }
            Internal::Delivered => {
                self.state.messages_processed += 1;
                self.publish();
            }
        }
    }

    async fn discard_stale(&mut self, internal: Internal) {
        match internal {
            Internal::Opened {
                result: Ok((transport, _events)),
                ..
            } => {
                debug!(target: "Session/Manager", "Closing transport opened for an abandoned attempt");
                transport.close().await;
            }
            Internal::LivenessReady { identity, .. } => {
                // The connection went away while the record was being read.
                let liveness = self.liveness.clone();
                tokio::spawn(async move {
                    if liveness.is_running().await {
                        liveness.shutdown().await;
                    }
                    debug!(target: "Session/Heartbeat", "Dropped stale heartbeat for {identity}");
                });
            }
            Internal::Transport { event, .. } => {
                debug!(target: "Session/Manager", "Dropping {} from an abandoned transport", event.name());
            }
            _ => {}
        }
    }

    async fn handle_opened(&mut self, result: OpenResult) {
        self.opening = false;
        match result {
            Ok((transport, events)) => {
                let pump = tokio::spawn(pump_events(
                    events,
                    self.internal_tx.clone(),
                    self.generation,
                ));
                self.transport = Some(LiveTransport { transport, pump });
                debug!(target: "Session/Manager", "Transport opened (generation {})", self.generation);
            }
            Err(e) => {
                warn!(target: "Session/Manager", "Failed to open transport: {e:#}");
                self.handle_close(DisconnectReason::ConnectionLost, e.to_string())
                    .await;
            }
        }
    }

    async fn handle_transport_event(&mut self, event: TransportEvent) {
        debug!(target: "Session/Manager", "Transport event {} in phase {}", event.name(), self.state.status);
        match event {
            TransportEvent::PairingChallenge(raw) => self.handle_challenge(raw).await,
            TransportEvent::Connecting => self.handle_connecting(),
            TransportEvent::Open(identity) => self.handle_open(identity),
            TransportEvent::Close { reason, message } => self.handle_close(reason, message).await,
            TransportEvent::CredentialsUpdated(update) => self.handle_credentials(update),
            TransportEvent::MessageReceived { message, delivery } => {
                self.handle_message(message, delivery)
            }
        }
    }

    fn handle_connecting(&mut self) {
        match self.state.status {
            ConnectionPhase::Starting => {}
            ConnectionPhase::QrReady => {
                // Scanned; the challenge on screen is spent.
                info!(target: "Session/Qr", "QR code scanned; authenticating");
                self.qr_timer.cancel();
                self.qr.invalidate();
                self.state.qr_challenge = None;
            }
            _ => return,
        }
        self.state.enter(ConnectionPhase::Authenticating);
        self.publish();
    }

    async fn handle_challenge(&mut self, raw: String) {
        if !matches!(
            self.state.status,
            ConnectionPhase::Starting | ConnectionPhase::Authenticating | ConnectionPhase::QrReady
        ) {
            warn!(target: "Session/Qr", "Ignoring pairing challenge in phase {}", self.state.status);
            return;
        }

        let now = tokio::time::Instant::now().into_std();
        match self.qr.on_challenge(raw, now, Utc::now()) {
            QrDecision::Accepted(challenge) => {
                let max = self.qr.settings().max_retries;
                info!(target: "Session/Qr", "Showing QR challenge {}/{max}", challenge.attempt_number);
                self.fast_restarts = 0;
                self.qr_timer.schedule(
                    self.qr.settings().ttl,
                    &self.internal_tx,
                    Internal::QrExpired {
                        generation: self.generation,
                        attempt: challenge.attempt_number,
                    },
                );
                self.state.qr_challenge = Some(challenge.clone());
                self.state.enter(ConnectionPhase::QrReady);
                self.state.progress_text =
                    format!("Scan the QR code ({}/{max})", challenge.attempt_number);
                self.publish();
                EventBus::emit(&self.bus.qr, challenge);
            }
            QrDecision::Suppressed => {
                debug!(target: "Session/Qr", "Suppressed QR challenge; current one is still valid");
            }
            QrDecision::Exhausted => {
                let attempts = self.qr.attempts();
                self.exhaust(ExhaustedKind::QrRetries, attempts).await;
            }
        }
    }

    async fn handle_qr_expired(&mut self, attempt: u32) {
        if self.state.status != ConnectionPhase::QrReady {
            return;
        }
        match self.qr.on_expiry(attempt) {
            ExpiryOutcome::Stale => {}
            ExpiryOutcome::Regenerate => {
                info!(target: "Session/Qr", "QR challenge {attempt} expired; restarting for a fresh one");
                self.begin_attempt().await;
            }
            ExpiryOutcome::Exhausted => {
                self.exhaust(ExhaustedKind::QrRetries, attempt).await;
            }
        }
    }

    fn handle_open(&mut self, identity: Identity) {
        info!(target: "Session/Manager", "Connected as {} ({})", identity.display_name, identity.handle);
        self.qr_timer.cancel();
        self.reconnect_timer.cancel();
        self.qr.reset();
        self.reconnect_attempts = 0;
        self.fast_restarts = 0;
        self.ever_opened = true;

        self.state.identity = Some(identity.clone());
        self.state.qr_challenge = None;
        self.state.error = None;
        self.state.connection_started_at = Some(Utc::now());
        self.state.enter(ConnectionPhase::Connected);
        self.publish();
        EventBus::emit(
            &self.bus.connected,
            Connected {
                identity: identity.clone(),
            },
        );

        let liveness = self.liveness.clone();
        let tx = self.internal_tx.clone();
        let generation = self.generation;
        tokio::spawn(async move {
            let report = match liveness.initialize(&identity.handle).await {
                Ok(report) => report,
                Err(e) => {
                    warn!(target: "Session/Heartbeat", "Could not read liveness record: {e}");
                    sessioncore::liveness::OfflineReport::online()
                }
            };
            liveness.start(&identity.handle).await;
            let _ = tx.send(Internal::LivenessReady {
                generation,
                identity: identity.handle,
                report,
            });
        });
    }

    async fn handle_close(&mut self, reason: DisconnectReason, message: String) {
        let was_connected = self.state.status == ConnectionPhase::Connected;
        info!(target: "Session/Manager", "Transport closed in phase {}: {reason} ({message})", self.state.status);

        self.qr_timer.cancel();
        self.reconnect_timer.cancel();
        self.abandon_transport().await;
        self.qr.invalidate();
        self.state.qr_challenge = None;
        if was_connected {
            self.stop_heartbeat();
        }
        EventBus::emit(
            &self.bus.disconnected,
            Disconnected {
                reason,
                message: message.clone(),
            },
        );

        if reason.is_logged_out() {
            self.handle_logged_out(message).await;
            return;
        }

        let context = self.context();
        if context == ReconnectContext::Pairing && reason.is_pairing_transient() {
            self.fast_restarts += 1;
            if self.fast_restarts > self.max_fast_restarts {
                let restarts = self.fast_restarts;
                self.exhaust(ExhaustedKind::FastRestarts, restarts).await;
                return;
            }
            let delay = self.policy.pairing_delay();
            info!(target: "Session/Manager", "Pairing restart requested ({reason}); restarting in {delay:?}");
            self.schedule_reconnect(context, delay, None);
            return;
        }

        let delay = self.policy.next_delay(context, self.reconnect_attempts);
        self.reconnect_attempts += 1;
        if self.policy.should_give_up(self.reconnect_attempts) {
            let attempts = self.reconnect_attempts - 1;
            self.exhaust(ExhaustedKind::ReconnectAttempts, attempts).await;
            return;
        }
        info!(target: "Session/Manager", "Reconnect attempt {} in {delay:?}", self.reconnect_attempts);
        self.schedule_reconnect(context, delay, Some(format!("{reason}: {message}")));
    }

    fn schedule_reconnect(
        &mut self,
        context: ReconnectContext,
        delay: Duration,
        error: Option<String>,
    ) {
        self.reconnect_timer.schedule(
            delay,
            &self.internal_tx,
            Internal::ReconnectDue {
                generation: self.generation,
            },
        );
        if error.is_some() {
            self.state.error = error;
        }
        self.state.identity = None;
        self.state.connection_started_at = None;
        self.state.enter(ConnectionPhase::Reconnecting);
        self.publish();
        EventBus::emit(
            &self.bus.reconnect_scheduled,
            ReconnectScheduled {
                context,
                attempt: self.reconnect_attempts,
                delay,
            },
        );
    }

    async fn handle_logged_out(&mut self, message: String) {
        warn!(target: "Session/Manager", "Logged out by the service: {message}");
        let cleared = self.persistence.clear_all();
        tokio::spawn(async move {
            if let Err(e) = completion(cleared).await {
                error!(target: "Session/Manager", "Failed to clear credentials after logout: {e}");
            }
        });

        self.ever_opened = false;
        self.reconnect_attempts = 0;
        self.fast_restarts = 0;
        self.qr.reset();
        self.state.identity = None;
        self.state.connection_started_at = None;
        self.state.error = Some("logged out".to_string());
        self.state.enter(ConnectionPhase::Idle);
        self.publish();
        EventBus::emit(&self.bus.logged_out, LoggedOut { on_connect: true });
    }

    /// Terminal failure; only `start(force = true)` leaves this state.
    async fn exhaust(&mut self, kind: ExhaustedKind, attempts: u32) {
        let message = match kind {
            ExhaustedKind::QrRetries => format!("QR code was not scanned after {attempts} attempts"),
            ExhaustedKind::ReconnectAttempts => {
                format!("gave up reconnecting after {attempts} attempts")
            }
            ExhaustedKind::FastRestarts => {
                format!("pairing restarted {attempts} times without a new QR code")
            }
        };
        error!(target: "Session/Manager", "{message}");

        self.qr_timer.cancel();
        self.reconnect_timer.cancel();
        self.abandon_transport().await;
        self.qr.invalidate();
        self.exhausted = true;
        self.state.qr_challenge = None;
        self.state.identity = None;
        self.state.connection_started_at = None;
        self.state.error = Some(message);
        self.state.enter(ConnectionPhase::Idle);
        self.publish();
        EventBus::emit(&self.bus.exhausted, Exhausted { kind, attempts });
    }

    fn handle_credentials(&mut self, update: CredentialUpdate) {
        let revision = update.revision;
        let pending = self.persistence.apply(update);
        let tx = self.internal_tx.clone();
        let generation = self.generation;
        debug!(target: "Store/Credentials", "Persisting credential revision {revision}");
        tokio::spawn(async move {
            let result = completion(pending).await;
            let _ = tx.send(Internal::CredentialsPersisted { generation, result });
        });
    }

    /// Marks the message seen before anything can yield, so a redelivery
    /// queued behind it is always caught.
    fn handle_message(&mut self, message: InboundMessage, delivery: DeliveryType) {
        if self.ignored_chats.contains(&message.chat) {
            debug!(target: "Session/Dedup", "Ignoring message {} from {}", message.id, message.chat);
            return;
        }
        if self.dedup.is_duplicate(&message.id) {
            debug!(target: "Session/Dedup", "Dropping duplicate message {}", message.id);
            return;
        }
        self.dedup.mark_processed(&message.id);

        let backfill_for = if delivery == DeliveryType::Append {
            self.identity_handle()
        } else {
            None
        };
        if self
            .deliveries
            .send(Delivery {
                message,
                backfill_for,
            })
            .is_err()
        {
            warn!(target: "Session/Manager", "Message forwarder is gone; dropping message");
        }
    }
}

async fn pump_events(
    mut events: mpsc::Receiver<TransportEvent>,
    tx: mpsc::UnboundedSender<Internal>,
    generation: u64,
) {
    while let Some(event) = events.recv().await {
        if tx.send(Internal::Transport { generation, event }).is_err() {
            return;
        }
    }
    let _ = tx.send(Internal::StreamEnded { generation });
}
