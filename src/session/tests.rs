use super::{RunningSession, Session};
use crate::config::SessionConfig;
use crate::store::MemoryStore;
use crate::transport::mock::{MockSession, MockTransportFactory};
use crate::types::events::ExhaustedKind;
use chrono::Utc;
use serde_json::json;
use sessioncore::liveness::LivenessRecord;
use sessioncore::reconnect::ReconnectContext;
use sessioncore::store::{
    CredentialKey, CredentialUpdate, KeyValueStore, RecentMessageStore, SessionCredentials,
    liveness_key,
};
use sessioncore::types::{ConnectionPhase, DeliveryType, Identity, InboundMessage, TransportEvent};
use std::sync::Arc;
use std::time::Duration;

const HANDLE: &str = "15550001111@s.whatsapp.net";

struct Harness {
    session: RunningSession,
    factory: Arc<MockTransportFactory>,
    primary: Arc<MemoryStore>,
    _dir: tempfile::TempDir,
}

impl Harness {
    async fn new() -> Self {
        Self::with_config(|_| {}).await
    }

    async fn with_config(tweak: impl FnOnce(&mut SessionConfig)) -> Self {
        let _ = env_logger::builder().is_test(true).try_init();
        let dir = tempfile::tempdir().unwrap();
        let mut config = SessionConfig {
            session_id: "test".to_string(),
            fallback_dir: dir.path().to_path_buf(),
            ..SessionConfig::default()
        };
        tweak(&mut config);

        let factory = Arc::new(MockTransportFactory::new());
        let primary = Arc::new(MemoryStore::new());
        let session = Session::builder()
            .with_config(config)
            .with_transport_factory(factory.clone())
            .with_primary_store(primary.clone())
            .with_message_store(primary.clone())
            .build()
            .await
            .unwrap();

        Self {
            session,
            factory,
            primary,
            _dir: dir,
        }
    }

    fn phase(&self) -> ConnectionPhase {
        self.session.handle.state().status
    }

    fn latest(&self) -> Arc<MockSession> {
        self.factory.latest().expect("a transport should have been opened")
    }

    async fn emit(&self, event: TransportEvent) {
        self.latest().emit(event).await;
        settle().await;
    }

    async fn start(&self, force: bool) {
        self.session.handle.start(force).await.unwrap();
        settle().await;
    }

    async fn connect(&self) {
        self.start(false).await;
        self.emit(TransportEvent::Connecting).await;
        self.emit(TransportEvent::Open(identity())).await;
        assert_eq!(self.phase(), ConnectionPhase::Connected);
    }

    async fn stored_root(&self) -> Option<Vec<u8>> {
        self.primary
            .get(&CredentialKey::root("test").storage_key())
            .await
            .unwrap()
    }
}

fn identity() -> Identity {
    Identity::new("Support Bot", HANDLE)
}

fn message(id: &str, chat: &str) -> InboundMessage {
    InboundMessage {
        id: id.to_string(),
        sender: "15559990000@s.whatsapp.net".to_string(),
        chat: chat.to_string(),
        content: Some("hello".to_string()),
        timestamp: Utc::now(),
        is_self_sent: false,
    }
}

/// Lets every spawned task run until it blocks.
async fn settle() {
    for _ in 0..100 {
        tokio::task::yield_now().await;
    }
}

async fn advance(duration: Duration) {
    tokio::time::advance(duration).await;
    settle().await;
}

#[tokio::test(start_paused = true)]
async fn repeated_start_keeps_a_single_transport() {
    let h = Harness::new().await;
    h.start(false).await;
    assert_eq!(h.phase(), ConnectionPhase::Starting);
    assert_eq!(h.factory.session_count(), 1);

    h.start(false).await;
    h.emit(TransportEvent::Connecting).await;
    h.start(false).await;
    assert_eq!(h.phase(), ConnectionPhase::Authenticating);
    assert_eq!(h.factory.session_count(), 1);
    assert_eq!(h.factory.open_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn forced_start_tears_down_previous_transport() {
    let h = Harness::new().await;
    h.start(false).await;
    let first = h.latest();

    h.start(true).await;
    assert_eq!(h.factory.session_count(), 2);
    assert!(first.transport.is_closed());
    assert_eq!(h.factory.open_count(), 1);

    // The abandoned connection can no longer drive the state machine.
    first.emit(TransportEvent::Open(identity())).await;
    settle().await;
    assert_eq!(h.phase(), ConnectionPhase::Starting);
}

#[tokio::test(start_paused = true)]
async fn stop_when_idle_changes_nothing() {
    let h = Harness::new().await;
    let mut states = h.session.handle.subscribe_state();
    states.borrow_and_update();

    h.session.handle.stop().await.unwrap();
    h.session.handle.stop().await.unwrap();
    settle().await;
    assert!(!states.has_changed().unwrap());
    assert_eq!(h.phase(), ConnectionPhase::Idle);
}

#[tokio::test(start_paused = true)]
async fn stop_clears_transient_state_but_keeps_credentials() {
    let h = Harness::new().await;
    h.connect().await;
    h.session.handle.stop().await.unwrap();
    settle().await;

    let state = h.session.handle.state();
    assert_eq!(state.status, ConnectionPhase::Idle);
    assert!(state.identity.is_none());
    assert!(state.qr_challenge.is_none());
    assert!(h.latest().transport.is_closed());
    assert!(h.stored_root().await.is_some());
}

#[tokio::test(start_paused = true)]
async fn qr_storm_is_suppressed() {
    let h = Harness::new().await;
    let mut codes = h.session.handle.events().qr.subscribe();
    h.start(false).await;

    h.emit(TransportEvent::PairingChallenge("ref-1".into())).await;
    advance(Duration::from_secs(10)).await;
    h.emit(TransportEvent::PairingChallenge("ref-2".into())).await;

    let state = h.session.handle.state();
    assert_eq!(state.status, ConnectionPhase::QrReady);
    let current = state.qr_challenge.unwrap();
    assert_eq!(current.payload, "ref-1");
    assert_eq!(current.attempt_number, 1);
    assert_eq!(codes.try_recv().unwrap().payload, "ref-1");
    assert!(codes.try_recv().is_err());
}

#[tokio::test(start_paused = true)]
async fn expired_qr_restarts_the_transport() {
    let h = Harness::new().await;
    h.start(false).await;
    h.emit(TransportEvent::PairingChallenge("ref-1".into())).await;
    let first = h.latest();

    advance(Duration::from_secs(60)).await;
    assert_eq!(h.factory.session_count(), 2);
    assert!(first.transport.is_closed());
    assert_eq!(h.phase(), ConnectionPhase::Starting);

    // Attempt numbering carries over to the new transport.
    h.emit(TransportEvent::PairingChallenge("ref-2".into())).await;
    assert_eq!(
        h.session.handle.state().qr_challenge.unwrap().attempt_number,
        2
    );
}

#[tokio::test(start_paused = true)]
async fn qr_ceiling_is_terminal_until_forced() {
    let h = Harness::new().await;
    let mut exhausted = h.session.handle.events().exhausted.subscribe();
    h.start(false).await;

    for attempt in 1..=5u32 {
        h.emit(TransportEvent::PairingChallenge(format!("ref-{attempt}")))
            .await;
        let state = h.session.handle.state();
        assert_eq!(state.status, ConnectionPhase::QrReady);
        assert_eq!(state.qr_challenge.unwrap().attempt_number, attempt);
        advance(Duration::from_secs(60)).await;
    }

    let state = h.session.handle.state();
    assert_eq!(state.status, ConnectionPhase::Idle);
    assert!(state.error.is_some());
    assert_eq!(exhausted.try_recv().unwrap().kind, ExhaustedKind::QrRetries);
    assert_eq!(h.factory.session_count(), 5);
    assert_eq!(h.factory.open_count(), 0);

    h.start(false).await;
    assert_eq!(h.factory.session_count(), 5);

    h.start(true).await;
    assert_eq!(h.factory.session_count(), 6);
    h.emit(TransportEvent::PairingChallenge("fresh".into())).await;
    assert_eq!(
        h.session.handle.state().qr_challenge.unwrap().attempt_number,
        1
    );
}

#[tokio::test(start_paused = true)]
async fn reconnecting_start_keeps_qr_attempts() {
    let h = Harness::with_config(|c| c.qr.max_retries = 1).await;
    let mut exhausted = h.session.handle.events().exhausted.subscribe();
    h.start(false).await;
    h.emit(TransportEvent::PairingChallenge("ref-1".into())).await;
    h.emit(TransportEvent::close(515, "restart required")).await;
    assert_eq!(h.phase(), ConnectionPhase::Reconnecting);

    h.start(false).await;
    assert_eq!(h.factory.session_count(), 2);
    h.emit(TransportEvent::PairingChallenge("ref-2".into())).await;

    let state = h.session.handle.state();
    assert_eq!(state.status, ConnectionPhase::Idle);
    assert!(state.error.is_some());
    assert_eq!(exhausted.try_recv().unwrap().kind, ExhaustedKind::QrRetries);
}

#[tokio::test(start_paused = true)]
async fn scanned_qr_moves_to_authenticating() {
    let h = Harness::new().await;
    h.start(false).await;
    h.emit(TransportEvent::PairingChallenge("ref-1".into())).await;
    assert_eq!(h.phase(), ConnectionPhase::QrReady);

    h.emit(TransportEvent::Connecting).await;
    let state = h.session.handle.state();
    assert_eq!(state.status, ConnectionPhase::Authenticating);
    assert!(state.qr_challenge.is_none());

    // The spent challenge no longer expires into a restart.
    advance(Duration::from_secs(60)).await;
    assert_eq!(h.factory.session_count(), 1);
    assert_eq!(h.phase(), ConnectionPhase::Authenticating);

    h.emit(TransportEvent::Open(identity())).await;
    assert_eq!(h.phase(), ConnectionPhase::Connected);
}

#[tokio::test(start_paused = true)]
async fn connection_lost_uses_steady_state_backoff() {
    let h = Harness::new().await;
    let mut scheduled = h.session.handle.events().reconnect_scheduled.subscribe();
    h.connect().await;

    let state = h.session.handle.state();
    assert_eq!(state.identity, Some(identity()));
    assert!(state.qr_challenge.is_none());
    assert_eq!(state.progress, 100);
    assert!(state.connection_started_at.is_some());

    advance(Duration::from_secs(5)).await;
    h.emit(TransportEvent::close(503, "stream errored")).await;

    assert_eq!(h.phase(), ConnectionPhase::Reconnecting);
    let event = scheduled.try_recv().unwrap();
    assert_eq!(event.context, ReconnectContext::SteadyState);
    assert_eq!(event.delay, Duration::from_secs(5));
    assert_eq!(event.attempt, 1);

    advance(Duration::from_millis(4_900)).await;
    assert_eq!(h.factory.session_count(), 1);
    advance(Duration::from_millis(100)).await;
    assert_eq!(h.factory.session_count(), 2);
    assert_eq!(h.phase(), ConnectionPhase::Starting);
}

#[tokio::test(start_paused = true)]
async fn successful_open_resets_backoff() {
    let h = Harness::new().await;
    let mut scheduled = h.session.handle.events().reconnect_scheduled.subscribe();
    h.connect().await;

    h.emit(TransportEvent::close(428, "lost")).await;
    advance(Duration::from_secs(5)).await;
    h.emit(TransportEvent::close(428, "lost again")).await;
    advance(Duration::from_secs(10)).await;
    h.emit(TransportEvent::Open(identity())).await;
    h.emit(TransportEvent::close(428, "lost once more")).await;

    let delays: Vec<_> = std::iter::from_fn(|| scheduled.try_recv().ok())
        .map(|e| e.delay)
        .collect();
    assert_eq!(
        delays,
        vec![
            Duration::from_secs(5),
            Duration::from_secs(10),
            Duration::from_secs(5)
        ]
    );
}

#[tokio::test(start_paused = true)]
async fn restart_required_while_pairing_is_fast_and_uncounted() {
    let h = Harness::new().await;
    let mut scheduled = h.session.handle.events().reconnect_scheduled.subscribe();
    h.start(false).await;
    h.emit(TransportEvent::PairingChallenge("ref-1".into())).await;
    h.emit(TransportEvent::close(515, "restart required")).await;

    let event = scheduled.try_recv().unwrap();
    assert_eq!(event.context, ReconnectContext::Pairing);
    assert_eq!(event.delay, Duration::from_secs(2));
    assert_eq!(event.attempt, 0);
    assert!(h.session.handle.state().qr_challenge.is_none());

    advance(Duration::from_secs(2)).await;
    assert_eq!(h.factory.session_count(), 2);
    h.emit(TransportEvent::Open(identity())).await;
    assert_eq!(h.phase(), ConnectionPhase::Connected);
}

#[tokio::test(start_paused = true)]
async fn endless_pairing_restarts_are_bounded() {
    let h = Harness::with_config(|c| c.reconnect.max_fast_restarts = 2).await;
    h.start(false).await;
    for _ in 0..3 {
        h.emit(TransportEvent::close(515, "restart required")).await;
        advance(Duration::from_secs(2)).await;
    }
    let state = h.session.handle.state();
    assert_eq!(state.status, ConnectionPhase::Idle);
    assert!(state.error.unwrap().contains("pairing restarted"));
}

#[tokio::test(start_paused = true)]
async fn reconnect_ceiling_is_terminal() {
    let h = Harness::with_config(|c| c.reconnect.max_attempts = 2).await;
    let mut exhausted = h.session.handle.events().exhausted.subscribe();
    h.connect().await;

    h.emit(TransportEvent::close(503, "down")).await;
    advance(Duration::from_secs(5)).await;
    h.emit(TransportEvent::close(503, "down")).await;
    advance(Duration::from_secs(10)).await;
    h.emit(TransportEvent::close(503, "down")).await;

    let state = h.session.handle.state();
    assert_eq!(state.status, ConnectionPhase::Idle);
    assert!(state.error.unwrap().contains("gave up"));
    let event = exhausted.try_recv().unwrap();
    assert_eq!(event.kind, ExhaustedKind::ReconnectAttempts);
    assert_eq!(event.attempts, 2);
    assert_eq!(h.factory.open_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn remote_logout_clears_credentials_and_next_start_is_fresh() {
    let h = Harness::new().await;
    let mut logged_out = h.session.handle.events().logged_out.subscribe();
    h.connect().await;
    let original = h.latest().credentials.clone();
    assert!(h.stored_root().await.is_some());

    h.emit(TransportEvent::close(401, "device removed")).await;
    let state = h.session.handle.state();
    assert_eq!(state.status, ConnectionPhase::Idle);
    assert_eq!(state.error.as_deref(), Some("logged out"));
    assert!(state.identity.is_none());
    assert!(logged_out.try_recv().unwrap().on_connect);
    assert!(h.stored_root().await.is_none());

    h.start(false).await;
    let fresh = h.latest().credentials.clone();
    assert_ne!(fresh.noise_key, original.noise_key);
    let stored = SessionCredentials::from_bytes(&h.stored_root().await.unwrap()).unwrap();
    assert_eq!(stored, fresh);
}

#[tokio::test(start_paused = true)]
async fn logout_command_unlinks_and_clears() {
    let h = Harness::new().await;
    h.connect().await;
    let transport = h.latest().transport.clone();

    h.session.handle.logout().await.unwrap();
    settle().await;
    assert!(transport.is_logged_out());
    assert!(transport.is_closed());
    assert_eq!(h.phase(), ConnectionPhase::Idle);
    assert!(h.stored_root().await.is_none());
}

#[tokio::test(start_paused = true)]
async fn credential_updates_are_persisted_before_acknowledgement() {
    let h = Harness::new().await;
    let mut persisted = h.session.handle.events().credentials_persisted.subscribe();
    h.start(false).await;

    h.emit(TransportEvent::CredentialsUpdated(CredentialUpdate {
        revision: 7,
        root: json!({ "registered": true }).as_object().cloned(),
        keys: Vec::new(),
    }))
    .await;

    assert_eq!(h.latest().transport.acknowledged(), vec![7]);
    assert_eq!(persisted.try_recv().unwrap().revision, 7);
    let stored = SessionCredentials::from_bytes(&h.stored_root().await.unwrap()).unwrap();
    assert!(stored.registered);
}

#[tokio::test(start_paused = true)]
async fn duplicate_and_ignored_messages_never_reach_the_pipeline() {
    let mut h = Harness::new().await;
    h.connect().await;

    let chat = "15559990000@s.whatsapp.net";
    for event in [
        TransportEvent::MessageReceived {
            message: message("A1", chat),
            delivery: DeliveryType::Notify,
        },
        TransportEvent::MessageReceived {
            message: message("A1", chat),
            delivery: DeliveryType::Notify,
        },
        TransportEvent::MessageReceived {
            message: message("S1", "status@broadcast"),
            delivery: DeliveryType::Notify,
        },
        TransportEvent::MessageReceived {
            message: message("A2", chat),
            delivery: DeliveryType::Notify,
        },
    ] {
        h.emit(event).await;
    }

    assert_eq!(h.session.messages.try_recv().unwrap().id, "A1");
    assert_eq!(h.session.messages.try_recv().unwrap().id, "A2");
    assert!(h.session.messages.try_recv().is_err());
    assert_eq!(h.session.handle.state().messages_processed, 2);
}

#[tokio::test(start_paused = true)]
async fn slow_consumer_does_not_block_the_session() {
    let mut h = Harness::with_config(|c| c.event_buffer = 1).await;
    h.connect().await;

    let chat = "15559990000@s.whatsapp.net";
    for id in ["M1", "M2"] {
        h.emit(TransportEvent::MessageReceived {
            message: message(id, chat),
            delivery: DeliveryType::Notify,
        })
        .await;
    }
    assert_eq!(h.session.handle.state().messages_processed, 1);

    h.emit(TransportEvent::close(428, "lost")).await;
    assert_eq!(h.phase(), ConnectionPhase::Reconnecting);
    tokio::time::timeout(Duration::from_secs(5), h.session.handle.stop())
        .await
        .expect("stop should not wait on the message consumer")
        .unwrap();
    assert_eq!(h.phase(), ConnectionPhase::Idle);

    assert_eq!(h.session.messages.try_recv().unwrap().id, "M1");
    settle().await;
    assert_eq!(h.session.messages.try_recv().unwrap().id, "M2");
    settle().await;
    assert_eq!(h.session.handle.state().messages_processed, 2);
}

#[tokio::test(start_paused = true)]
async fn redelivery_while_first_copy_is_queued_is_dropped() {
    let mut h = Harness::with_config(|c| c.event_buffer = 1).await;
    h.connect().await;

    let chat = "15559990000@s.whatsapp.net";
    for id in ["M1", "M2", "M2"] {
        h.emit(TransportEvent::MessageReceived {
            message: message(id, chat),
            delivery: DeliveryType::Notify,
        })
        .await;
    }

    assert_eq!(h.session.messages.try_recv().unwrap().id, "M1");
    settle().await;
    assert_eq!(h.session.messages.try_recv().unwrap().id, "M2");
    settle().await;
    assert!(h.session.messages.try_recv().is_err());
}

#[tokio::test(start_paused = true)]
async fn messages_stored_before_a_restart_are_dropped() {
    let mut h = Harness::new().await;
    h.primary
        .persist_message(&message("OLD", "x@s.whatsapp.net"))
        .await
        .unwrap();
    h.connect().await;

    h.emit(TransportEvent::MessageReceived {
        message: message("OLD", "x@s.whatsapp.net"),
        delivery: DeliveryType::Append,
    })
    .await;
    assert!(h.session.messages.try_recv().is_err());
}

#[tokio::test(start_paused = true)]
async fn backfilled_messages_are_counted_as_missed() {
    let mut h = Harness::new().await;
    h.connect().await;
    h.emit(TransportEvent::MessageReceived {
        message: message("B1", "x@s.whatsapp.net"),
        delivery: DeliveryType::Append,
    })
    .await;
    assert!(h.session.messages.try_recv().is_ok());

    let bytes = h.primary.get(&liveness_key(HANDLE)).await.unwrap().unwrap();
    let record: LivenessRecord = serde_json::from_slice(&bytes).unwrap();
    assert_eq!(record.missed_messages_processed, 1);
    assert_eq!(record.startup_count, 1);
}

#[tokio::test(start_paused = true)]
async fn open_reports_previous_offline_period() {
    let h = Harness::new().await;
    let stale = LivenessRecord::new(Utc::now() - chrono::Duration::minutes(10));
    h.primary
        .set(&liveness_key(HANDLE), &serde_json::to_vec(&stale).unwrap())
        .await
        .unwrap();
    let mut offline = h.session.handle.events().offline_detected.subscribe();

    h.connect().await;
    let report = offline.try_recv().unwrap();
    assert!(report.was_offline);
    assert!(report.offline_duration.num_seconds() >= 600);
}

#[tokio::test(start_paused = true)]
async fn failed_open_is_treated_as_connection_lost() {
    let h = Harness::new().await;
    h.factory.fail_next();
    h.start(false).await;

    let state = h.session.handle.state();
    assert_eq!(state.status, ConnectionPhase::Reconnecting);
    assert!(state.error.unwrap().contains("connection refused"));

    advance(Duration::from_secs(2)).await;
    assert_eq!(h.factory.session_count(), 1);
    assert_eq!(h.phase(), ConnectionPhase::Starting);
}

#[tokio::test(start_paused = true)]
async fn qr_channel_follows_pairing() {
    let h = Harness::new().await;
    let mut qr = h.session.handle.qr_channel().unwrap();
    h.start(false).await;
    h.emit(TransportEvent::PairingChallenge("ref-1".into())).await;
    h.emit(TransportEvent::Open(identity())).await;

    assert!(matches!(
        qr.recv().await,
        Some(crate::qrcode::QrCodeEvent::Code { payload, .. }) if payload == "ref-1"
    ));
    assert_eq!(qr.recv().await, Some(crate::qrcode::QrCodeEvent::Success));
    assert!(h.session.handle.qr_channel().is_err());
}
