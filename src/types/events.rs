use sessioncore::liveness::OfflineReport;
use sessioncore::reconnect::ReconnectContext;
use sessioncore::types::{DisconnectReason, Identity, QrChallenge};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;

// The size of the broadcast channel buffer.
const CHANNEL_CAPACITY: usize = 100;

#[derive(Debug, Clone, PartialEq)]
pub struct Connected {
    pub identity: Identity,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Disconnected {
    pub reason: DisconnectReason,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct LoggedOut {
    /// True when the service revoked the session, false for a local logout.
    pub on_connect: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ReconnectScheduled {
    pub context: ReconnectContext,
    /// Counted reconnect attempts so far. Pairing restarts are not counted.
    pub attempt: u32,
    pub delay: Duration,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ExhaustedKind {
    QrRetries,
    ReconnectAttempts,
    FastRestarts,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Exhausted {
    pub kind: ExhaustedKind,
    pub attempts: u32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CredentialsPersisted {
    pub revision: u64,
}

// Macro to generate EventBus fields and constructor
macro_rules! define_event_bus {
    ($(($field:ident, $type:ty)),* $(,)?) => {
        /// Typed event bus that provides separate broadcast channels for each event type.
        #[derive(Debug)]
        pub struct EventBus {
            $(
                pub $field: broadcast::Sender<$type>,
            )*
        }

        impl EventBus {
            pub fn new() -> Self {
                Self {
                    $(
                        $field: broadcast::channel(CHANNEL_CAPACITY).0,
                    )*
                }
            }
        }
    };
}

define_event_bus! {
    (qr, Arc<QrChallenge>),
    (connected, Arc<Connected>),
    (disconnected, Arc<Disconnected>),
    (logged_out, Arc<LoggedOut>),
    (reconnect_scheduled, Arc<ReconnectScheduled>),
    (offline_detected, Arc<OfflineReport>),
    (exhausted, Arc<Exhausted>),
    (credentials_persisted, Arc<CredentialsPersisted>),
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    /// Broadcasts with no subscribers are expected; the result is ignored.
    pub(crate) fn emit<T>(sender: &broadcast::Sender<Arc<T>>, event: T) {
        let _ = sender.send(Arc::new(event));
    }
}
