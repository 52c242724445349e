use crate::types::events::EventBus;
use log::{debug, warn};
use sessioncore::types::{ConnectionPhase, ConnectionState};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc};

/// What a presentation layer needs to render the pairing flow. Rendering
/// `payload` as an image is left to that layer.
#[derive(Debug, Clone, PartialEq)]
pub enum QrCodeEvent {
    Code { payload: String, timeout: Duration },
    Success,
    Exhausted,
    LoggedOut,
}

impl QrCodeEvent {
    fn is_terminal(&self) -> bool {
        !matches!(self, Self::Code { .. })
    }
}

#[derive(Debug, Error)]
pub enum QrError {
    #[error("session is already connected")]
    AlreadyConnected,
}

pub(crate) fn qr_channel(
    bus: &EventBus,
    state: &ConnectionState,
    ttl: Duration,
) -> Result<mpsc::Receiver<QrCodeEvent>, QrError> {
    if state.status == ConnectionPhase::Connected {
        return Err(QrError::AlreadyConnected);
    }

    let (tx, rx) = mpsc::channel(8);
    let mut qr = bus.qr.subscribe();
    let mut connected = bus.connected.subscribe();
    let mut exhausted = bus.exhausted.subscribe();
    let mut logged_out = bus.logged_out.subscribe();

    // A challenge that is already showing is delivered first.
    let current = state.qr_challenge.as_ref().map(|c| QrCodeEvent::Code {
        payload: c.payload.clone(),
        timeout: ttl,
    });

    tokio::spawn(async move {
        if let Some(event) = current {
            if tx.send(event).await.is_err() {
                return;
            }
        }

        loop {
            let event = tokio::select! {
                biased;
                r = qr.recv() => match r {
                    Ok(challenge) => QrCodeEvent::Code { payload: challenge.payload.clone(), timeout: ttl },
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!(target: "Session/Qr", "QR channel lagged by {n} challenges");
                        continue;
                    }
                    Err(broadcast::error::RecvError::Closed) => return,
                },
                r = connected.recv() => match r {
                    Ok(_) => QrCodeEvent::Success,
                    Err(broadcast::error::RecvError::Lagged(_)) => QrCodeEvent::Success,
                    Err(broadcast::error::RecvError::Closed) => return,
                },
                r = exhausted.recv() => match r {
                    Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => QrCodeEvent::Exhausted,
                    Err(broadcast::error::RecvError::Closed) => return,
                },
                r = logged_out.recv() => match r {
                    Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => QrCodeEvent::LoggedOut,
                    Err(broadcast::error::RecvError::Closed) => return,
                },
                _ = tx.closed() => {
                    debug!(target: "Session/Qr", "QR channel receiver dropped");
                    return;
                }
            };

            let terminal = event.is_terminal();
            if terminal {
                debug!(target: "Session/Qr", "Closing QR channel with status: {event:?}");
            }
            if tx.send(event).await.is_err() || terminal {
                return;
            }
        }
    });

    Ok(rx)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::events::{Connected, Exhausted, ExhaustedKind};
    use chrono::Utc;
    use sessioncore::types::{Identity, QrChallenge};
    use std::sync::Arc;

    fn challenge(payload: &str) -> QrChallenge {
        QrChallenge {
            payload: payload.to_string(),
            issued_at: Utc::now(),
            attempt_number: 1,
        }
    }

    #[tokio::test]
    async fn forwards_codes_then_closes_on_success() {
        let bus = EventBus::new();
        let mut rx = qr_channel(&bus, &ConnectionState::default(), Duration::from_secs(60)).unwrap();

        bus.qr.send(Arc::new(challenge("ref-1"))).unwrap();
        bus.connected
            .send(Arc::new(Connected {
                identity: Identity::new("Bot", "1555"),
            }))
            .unwrap();

        assert_eq!(
            rx.recv().await,
            Some(QrCodeEvent::Code {
                payload: "ref-1".to_string(),
                timeout: Duration::from_secs(60)
            })
        );
        assert_eq!(rx.recv().await, Some(QrCodeEvent::Success));
        assert_eq!(rx.recv().await, None);
    }

    #[tokio::test]
    async fn replays_current_challenge_and_reports_exhaustion() {
        let bus = EventBus::new();
        let mut state = ConnectionState::default();
        state.enter(ConnectionPhase::QrReady);
        state.qr_challenge = Some(challenge("showing"));
        let mut rx = qr_channel(&bus, &state, Duration::from_secs(60)).unwrap();

        assert!(matches!(rx.recv().await, Some(QrCodeEvent::Code { payload, .. }) if payload == "showing"));
        bus.exhausted
            .send(Arc::new(Exhausted {
                kind: ExhaustedKind::QrRetries,
                attempts: 5,
            }))
            .unwrap();
        assert_eq!(rx.recv().await, Some(QrCodeEvent::Exhausted));
    }

    #[test]
    fn refuses_when_connected() {
        let bus = EventBus::new();
        let mut state = ConnectionState::default();
        state.enter(ConnectionPhase::Connected);
        assert!(matches!(
            qr_channel(&bus, &state, Duration::from_secs(60)),
            Err(QrError::AlreadyConnected)
        ));
    }
}
