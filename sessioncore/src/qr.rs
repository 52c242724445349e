//! Bookkeeping for pairing challenges.
//!
//! The transport may resend challenges faster than a person can scan them and
//! the service stops honouring a challenge after a fixed lifetime. This module
//! decides which challenges are shown, tracks how many have been shown, and
//! tells the caller what to do when the current one expires. It owns no timers;
//! the caller schedules the expiry and reports back with the attempt number.

use crate::types::QrChallenge;
use chrono::{DateTime, Utc};
use std::time::{Duration, Instant};

pub const DEFAULT_QR_TTL: Duration = Duration::from_secs(60);
pub const DEFAULT_QR_MIN_SPACING: Duration = Duration::from_secs(15);
pub const DEFAULT_MAX_QR_RETRIES: u32 = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QrSettings {
    pub ttl: Duration,
    pub min_spacing: Duration,
    pub max_retries: u32,
}

impl Default for QrSettings {
    fn default() -> Self {
        Self {
            ttl: DEFAULT_QR_TTL,
            min_spacing: DEFAULT_QR_MIN_SPACING,
            max_retries: DEFAULT_MAX_QR_RETRIES,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QrDecision {
    /// The challenge is now current and should be shown.
    Accepted(QrChallenge),
    /// Arrived too soon after the current challenge; the current one stays.
    Suppressed,
    /// The retry ceiling was reached; no more challenges will be accepted.
    Exhausted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExpiryOutcome {
    /// The expired challenge was superseded or already invalidated.
    Stale,
    /// The current challenge expired; restart the transport for a fresh one.
    Regenerate,
    /// The current challenge expired and no further attempts are allowed.
    Exhausted,
}

#[derive(Debug, Clone)]
struct CurrentChallenge {
    challenge: QrChallenge,
    issued: Instant,
}

#[derive(Debug, Clone)]
pub struct QrLifecycle {
    settings: QrSettings,
    attempts: u32,
    current: Option<CurrentChallenge>,
}

impl QrLifecycle {
    pub fn new(settings: QrSettings) -> Self {
        Self {
            settings,
            attempts: 0,
            current: None,
        }
    }

    pub fn settings(&self) -> &QrSettings {
        &self.settings
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn is_exhausted(&self) -> bool {
        self.attempts >= self.settings.max_retries
    }

    pub fn current(&self) -> Option<&QrChallenge> {
        self.current.as_ref().map(|c| &c.challenge)
    }

    pub fn is_expired(&self, now: Instant) -> bool {
        match &self.current {
            Some(c) => now.saturating_duration_since(c.issued) >= self.settings.ttl,
            None => true,
        }
    }

    pub fn on_challenge(
        &mut self,
        raw: impl Into<String>,
        now: Instant,
        issued_at: DateTime<Utc>,
    ) -> QrDecision {
        let raw = raw.into();

        if let Some(current) = &self.current {
            let age = now.saturating_duration_since(current.issued);
            if current.challenge.payload == raw || age < self.settings.min_spacing {
                return QrDecision::Suppressed;
            }
        }

        if self.is_exhausted() {
            return QrDecision::Exhausted;
        }

        self.attempts += 1;
        let challenge = QrChallenge {
            payload: raw,
            issued_at,
            attempt_number: self.attempts,
        };
        self.current = Some(CurrentChallenge {
            challenge: challenge.clone(),
            issued: now,
        });
        QrDecision::Accepted(challenge)
    }

    /// Handles the expiry timer of the challenge numbered `attempt_number`.
    pub fn on_expiry(&mut self, attempt_number: u32) -> ExpiryOutcome {
        let is_current = self
            .current
            .as_ref()
            .is_some_and(|c| c.challenge.attempt_number == attempt_number);
        if !is_current {
            return ExpiryOutcome::Stale;
        }

        self.current = None;
        if self.is_exhausted() {
            ExpiryOutcome::Exhausted
        } else {
            ExpiryOutcome::Regenerate
        }
    }

    /// Drops the current challenge but keeps the attempt count, used when the
    /// transport is restarted mid-pairing.
    pub fn invalidate(&mut self) {
        self.current = None;
    }

    /// Forgets everything, used after a successful pairing or an explicit
    /// restart.
    pub fn reset(&mut self) {
        self.attempts = 0;
        self.current = None;
    }
}
