use super::messages::Internal;
use crate::dedup::PersistedScan;
use crate::heartbeat::LivenessTracker;
use log::{debug, warn};
use sessioncore::store::RecentMessageStore;
use sessioncore::types::InboundMessage;
use std::sync::Arc;
use tokio::sync::mpsc;

/// A message that passed the in-memory dedup check on the actor.
pub(crate) struct Delivery {
    pub message: InboundMessage,
    /// Identity to charge a backfilled message to.
    pub backfill_for: Option<String>,
}

pub(crate) struct Forwarder {
    pub scan: PersistedScan,
    pub message_store: Option<Arc<dyn RecentMessageStore>>,
    pub liveness: LivenessTracker,
    pub pipeline: mpsc::Sender<InboundMessage>,
}

impl Forwarder {
    /// Starts the task that hands accepted messages to the pipeline in
    /// arrival order. A slow consumer holds up this task, never the actor.
    pub(crate) fn spawn(
        self,
        internal_tx: mpsc::UnboundedSender<Internal>,
    ) -> mpsc::UnboundedSender<Delivery> {
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(self.run(rx, internal_tx));
        tx
    }

    async fn run(
        self,
        mut deliveries: mpsc::UnboundedReceiver<Delivery>,
        internal_tx: mpsc::UnboundedSender<Internal>,
    ) {
        while let Some(Delivery {
            message,
            backfill_for,
        }) = deliveries.recv().await
        {
            if self.scan.seen_before(&message.id).await {
                debug!(target: "Session/Dedup", "Dropping {} handled before a restart", message.id);
                continue;
            }

            if let Some(store) = &self.message_store {
                if let Err(e) = store.persist_message(&message).await {
                    warn!(target: "Session/Dedup", "Failed to record message {}: {e}", message.id);
                }
            }

            if let Some(handle) = backfill_for {
                if let Err(e) = self.liveness.record_missed(&handle, 1).await {
                    warn!(target: "Session/Heartbeat", "Failed to count missed message: {e}");
                }
            }

            if self.pipeline.send(message).await.is_err() {
                warn!(target: "Session/Manager", "Message pipeline is closed; dropping message");
                continue;
            }
            let _ = internal_tx.send(Internal::Delivered);
        }
        debug!(target: "Session/Manager", "Message forwarder stopped");
    }
}
