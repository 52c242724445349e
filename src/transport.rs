use async_trait::async_trait;
use sessioncore::store::SessionCredentials;
pub use sessioncore::types::TransportEvent;
use std::sync::Arc;
use tokio::sync::mpsc;

/// A live connection to the messaging service, provided by the protocol
/// library. Events for this connection arrive on the receiver returned by
/// [`TransportFactory::create_transport`]; dropping that receiver detaches
/// every listener.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(&self, data: &[u8]) -> Result<(), anyhow::Error>;

    /// Closes the connection. Must be idempotent.
    async fn close(&self);

    /// Protocol-level logout; unlinks this device from the account.
    async fn logout(&self) -> Result<(), anyhow::Error>;

    /// Tells the transport that the credential change numbered `revision`
    /// is durable.
    async fn acknowledge_credentials(&self, revision: u64);
}

#[async_trait]
pub trait TransportFactory: Send + Sync {
    async fn create_transport(
        &self,
        credentials: &SessionCredentials,
    ) -> Result<(Arc<dyn Transport>, mpsc::Receiver<TransportEvent>), anyhow::Error>;
}

#[cfg(test)]
pub mod mock {
    use super::*;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicBool, Ordering};

    /// Records what the session did to one connection.
    #[derive(Default)]
    pub struct MockTransport {
        closed: AtomicBool,
        logged_out: AtomicBool,
        acknowledged: Mutex<Vec<u64>>,
    }

    impl MockTransport {
        pub fn is_closed(&self) -> bool {
            self.closed.load(Ordering::SeqCst)
        }

        pub fn is_logged_out(&self) -> bool {
            self.logged_out.load(Ordering::SeqCst)
        }

        pub fn acknowledged(&self) -> Vec<u64> {
            self.acknowledged
                .lock()
                .map(|a| a.clone())
                .unwrap_or_default()
        }
    }

    #[async_trait]
    impl Transport for MockTransport {
        async fn send(&self, _data: &[u8]) -> Result<(), anyhow::Error> {
            if self.is_closed() {
                anyhow::bail!("transport closed");
            }
            Ok(())
        }

        async fn close(&self) {
            self.closed.store(true, Ordering::SeqCst);
        }

        async fn logout(&self) -> Result<(), anyhow::Error> {
            self.logged_out.store(true, Ordering::SeqCst);
            Ok(())
        }

        async fn acknowledge_credentials(&self, revision: u64) {
            if let Ok(mut acked) = self.acknowledged.lock() {
                acked.push(revision);
            }
        }
    }

    /// One connection handed out by the factory. Tests script the transport
    /// by pushing events through `events`.
    pub struct MockSession {
        pub events: mpsc::Sender<TransportEvent>,
        pub transport: Arc<MockTransport>,
        pub credentials: SessionCredentials,
    }

    impl MockSession {
        pub async fn emit(&self, event: TransportEvent) {
            // The session may already have detached; that is what some tests check.
            let _ = self.events.send(event).await;
        }
    }

    #[derive(Default)]
    pub struct MockTransportFactory {
        sessions: Mutex<Vec<Arc<MockSession>>>,
        fail_next: AtomicBool,
    }

    impl MockTransportFactory {
        pub fn new() -> Self {
            Self::default()
        }

        /// Makes the next `create_transport` call fail.
        pub fn fail_next(&self) {
            self.fail_next.store(true, Ordering::SeqCst);
        }

        pub fn sessions(&self) -> Vec<Arc<MockSession>> {
            self.sessions
                .lock()
                .map(|s| s.clone())
                .unwrap_or_default()
        }

        pub fn session_count(&self) -> usize {
            self.sessions().len()
        }

        pub fn latest(&self) -> Option<Arc<MockSession>> {
            self.sessions().last().cloned()
        }

        /// Number of handed-out connections that have not been closed.
        pub fn open_count(&self) -> usize {
            self.sessions()
                .iter()
                .filter(|s| !s.transport.is_closed())
                .count()
        }
    }

    #[async_trait]
    impl TransportFactory for MockTransportFactory {
        async fn create_transport(
            &self,
            credentials: &SessionCredentials,
        ) -> Result<(Arc<dyn Transport>, mpsc::Receiver<TransportEvent>), anyhow::Error> {
            if self.fail_next.swap(false, Ordering::SeqCst) {
                anyhow::bail!("connection refused");
            }
            let (tx, rx) = mpsc::channel(32);
            let transport = Arc::new(MockTransport::default());
            let session = Arc::new(MockSession {
                events: tx,
                transport: transport.clone(),
                credentials: credentials.clone(),
            });
            self.sessions
                .lock()
                .map_err(|_| anyhow::anyhow!("mock factory poisoned"))?
                .push(session);
            Ok((transport, rx))
        }
    }
}
