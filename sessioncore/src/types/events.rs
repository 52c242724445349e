use crate::store::credentials::CredentialUpdate;
use crate::types::state::Identity;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Why the transport closed, as classified from the close reason code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DisconnectReason {
    LoggedOut,
    RestartRequired,
    ChallengeExpired,
    ConnectionLost,
    Unspecified(Option<i32>),
}

impl From<i32> for DisconnectReason {
    fn from(code: i32) -> Self {
        match code {
            401 | 403 => Self::LoggedOut,
            515 => Self::RestartRequired,
            408 => Self::ChallengeExpired,
            428 | 500 | 503 => Self::ConnectionLost,
            _ => Self::Unspecified(Some(code)),
        }
    }
}

impl From<Option<i32>> for DisconnectReason {
    fn from(code: Option<i32>) -> Self {
        match code {
            Some(code) => Self::from(code),
            None => Self::Unspecified(None),
        }
    }
}

impl DisconnectReason {
    pub fn code(&self) -> Option<i32> {
        match self {
            Self::LoggedOut => Some(401),
            Self::RestartRequired => Some(515),
            Self::ChallengeExpired => Some(408),
            Self::ConnectionLost => Some(428),
            Self::Unspecified(code) => *code,
        }
    }

    pub fn is_logged_out(&self) -> bool {
        matches!(self, Self::LoggedOut)
    }

    /// Reasons that are expected while a pairing handshake is in progress and
    /// only require minting a fresh challenge.
    pub fn is_pairing_transient(&self) -> bool {
        matches!(self, Self::RestartRequired | Self::ChallengeExpired)
    }
}

impl fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::LoggedOut => f.write_str("logged out"),
            Self::RestartRequired => f.write_str("restart required"),
            Self::ChallengeExpired => f.write_str("challenge expired"),
            Self::ConnectionLost => f.write_str("connection lost"),
            Self::Unspecified(Some(code)) => write!(f, "unspecified ({code})"),
            Self::Unspecified(None) => f.write_str("unspecified"),
        }
    }
}

/// How an inbound message reached us.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeliveryType {
    /// Delivered live while connected.
    Notify,
    /// Delivered as part of an offline or history backfill.
    Append,
}

/// A message handed to the downstream pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InboundMessage {
    pub id: String,
    pub sender: String,
    pub chat: String,
    pub content: Option<String>,
    pub timestamp: DateTime<Utc>,
    pub is_self_sent: bool,
}

/// Events emitted by the transport collaborator.
#[derive(Debug, Clone)]
pub enum TransportEvent {
    PairingChallenge(String),
    Connecting,
    Open(Identity),
    Close {
        reason: DisconnectReason,
        message: String,
    },
    CredentialsUpdated(CredentialUpdate),
    MessageReceived {
        message: InboundMessage,
        delivery: DeliveryType,
    },
}

impl TransportEvent {
    pub fn close(code: impl Into<DisconnectReason>, message: impl Into<String>) -> Self {
        Self::Close {
            reason: code.into(),
            message: message.into(),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::PairingChallenge(_) => "pairing_challenge",
            Self::Connecting => "connecting",
            Self::Open(_) => "open",
            Self::Close { .. } => "close",
            Self::CredentialsUpdated(_) => "credentials_updated",
            Self::MessageReceived { .. } => "message_received",
        }
    }
}
