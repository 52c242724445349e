use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Coarse lifecycle stage of the single logical connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionPhase {
    #[default]
    Idle,
    Starting,
    QrReady,
    Authenticating,
    Connected,
    Reconnecting,
}

impl ConnectionPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Starting => "starting",
            Self::QrReady => "qr_ready",
            Self::Authenticating => "authenticating",
            Self::Connected => "connected",
            Self::Reconnecting => "reconnecting",
        }
    }

    /// Default progress percentage and label shown while in this phase.
    pub fn progress(&self) -> (u8, &'static str) {
        match self {
            Self::Idle => (0, "Not connected"),
            Self::Starting => (10, "Initializing connection"),
            Self::Reconnecting => (20, "Waiting to reconnect"),
            Self::QrReady => (30, "Scan the QR code to link this device"),
            Self::Authenticating => (60, "Authenticating"),
            Self::Connected => (100, "Connected"),
        }
    }
}

impl fmt::Display for ConnectionPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The account a session is authenticated as.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    pub display_name: String,
    pub handle: String,
}

impl Identity {
    pub fn new(display_name: impl Into<String>, handle: impl Into<String>) -> Self {
        Self {
            display_name: display_name.into(),
            handle: handle.into(),
        }
    }
}

/// A pairing challenge presented to the user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QrChallenge {
    pub payload: String,
    pub issued_at: DateTime<Utc>,
    pub attempt_number: u32,
}

/// Observable snapshot of the connection, published on every transition.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionState {
    pub status: ConnectionPhase,
    pub qr_challenge: Option<QrChallenge>,
    pub identity: Option<Identity>,
    pub last_update: DateTime<Utc>,
    pub error: Option<String>,
    pub messages_processed: u64,
    pub progress: u8,
    pub progress_text: String,
    pub connection_started_at: Option<DateTime<Utc>>,
}

impl Default for ConnectionState {
    fn default() -> Self {
        let (progress, text) = ConnectionPhase::Idle.progress();
        Self {
            status: ConnectionPhase::Idle,
            qr_challenge: None,
            identity: None,
            last_update: Utc::now(),
            error: None,
            messages_processed: 0,
            progress,
            progress_text: text.to_string(),
            connection_started_at: None,
        }
    }
}

impl ConnectionState {
    /// Moves to `phase`, resetting progress to the phase default.
    pub fn enter(&mut self, phase: ConnectionPhase) {
        let (progress, text) = phase.progress();
        self.status = phase;
        self.progress = progress;
        self.progress_text = text.to_string();
        self.last_update = Utc::now();
    }

    pub fn is_connected(&self) -> bool {
        self.status == ConnectionPhase::Connected
    }

    /// Checks the phase/field invariants. Returns a description of the first
    /// violation found.
    pub fn invariant_violation(&self) -> Option<&'static str> {
        match self.status {
            ConnectionPhase::Connected if self.identity.is_none() => {
                Some("connected without an identity")
            }
            ConnectionPhase::Connected if self.qr_challenge.is_some() => {
                Some("connected while a QR challenge is still current")
            }
            ConnectionPhase::QrReady if self.qr_challenge.is_none() => {
                Some("qr_ready without a QR challenge")
            }
            _ => None,
        }
    }
}
