use super::messages::Internal;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// One cancellable timer. Scheduling replaces whatever was pending.
#[derive(Default)]
pub(crate) struct TimerSlot {
    pending: Option<JoinHandle<()>>,
}

impl TimerSlot {
    pub(crate) fn schedule(
        &mut self,
        delay: Duration,
        tx: &mpsc::UnboundedSender<Internal>,
        event: Internal,
    ) {
        self.cancel();
        let tx = tx.clone();
        self.pending = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = tx.send(event);
        }));
    }

    pub(crate) fn cancel(&mut self) {
        if let Some(handle) = self.pending.take() {
            handle.abort();
        }
    }

    pub(crate) fn is_pending(&self) -> bool {
        self.pending.as_ref().is_some_and(|h| !h.is_finished())
    }
}

impl Drop for TimerSlot {
    fn drop(&mut self) {
        self.cancel();
    }
}
