use crate::error::SessionError;
use crate::transport::Transport;
use sessioncore::liveness::OfflineReport;
use sessioncore::store::Result as StoreResult;
use sessioncore::types::TransportEvent;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};

/// Requests from [`SessionHandle`](super::SessionHandle) to the actor.
#[derive(Debug)]
pub(crate) enum Command {
    Start {
        force: bool,
        ack: oneshot::Sender<()>,
    },
    Stop {
        ack: oneshot::Sender<()>,
    },
    Logout {
        ack: oneshot::Sender<Result<(), SessionError>>,
    },
}

pub(crate) type OpenResult =
    Result<(Arc<dyn Transport>, mpsc::Receiver<TransportEvent>), anyhow::Error>;

/// Results of work the actor dispatched elsewhere, plus timer firings. Every
/// variant tied to a transport carries the generation it was issued under;
/// anything from an older generation is discarded.
pub(crate) enum Internal {
    Opened {
        generation: u64,
        result: OpenResult,
    },
    Transport {
        generation: u64,
        event: TransportEvent,
    },
    StreamEnded {
        generation: u64,
    },
    QrExpired {
        generation: u64,
        attempt: u32,
    },
    ReconnectDue {
        generation: u64,
    },
    CredentialsPersisted {
        generation: u64,
        result: StoreResult<u64>,
    },
    LivenessReady {
        generation: u64,
        identity: String,
        report: OfflineReport,
    },
    /// The forwarder handed one message to the pipeline.
    Delivered,
}

impl Internal {
    pub(crate) fn generation(&self) -> Option<u64> {
        match self {
            Self::Opened { generation, .. }
            | Self::Transport { generation, .. }
            | Self::StreamEnded { generation }
            | Self::QrExpired { generation, .. }
            | Self::ReconnectDue { generation }
            | Self::CredentialsPersisted { generation, .. }
            | Self::LivenessReady { generation, .. } => Some(*generation),
            Self::Delivered => None,
        }
    }
}
