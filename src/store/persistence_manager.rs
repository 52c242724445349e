use crate::store::credential_store::CredentialStore;
use log::{debug, error, info};
use sessioncore::store::{CredentialUpdate, Result, SessionCredentials, StoreError};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};

enum CredentialJob {
    LoadOrCreate {
        reply: oneshot::Sender<Result<SessionCredentials>>,
    },
    Apply {
        update: CredentialUpdate,
        reply: oneshot::Sender<Result<u64>>,
    },
    ClearAll {
        reply: oneshot::Sender<Result<usize>>,
    },
}

/// Serializes every credential mutation of a session through one worker
/// task, so writes land in the order the transport produced them and a
/// logout clear cannot be overtaken by an older pending write.
///
/// Jobs are enqueued synchronously; the returned receivers resolve once the
/// job is durable.
#[derive(Clone)]
pub struct PersistenceManager {
    jobs: mpsc::UnboundedSender<CredentialJob>,
    store: Arc<CredentialStore>,
}

impl PersistenceManager {
    pub fn new(store: Arc<CredentialStore>) -> Self {
        let (jobs, rx) = mpsc::unbounded_channel();
        tokio::spawn(run_worker(store.clone(), rx));
        debug!("Credential worker started for session {}", store.session_id());
        Self { jobs, store }
    }

    pub fn store(&self) -> &Arc<CredentialStore> {
        &self.store
    }

    fn enqueue<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<Result<T>>) -> CredentialJob,
    ) -> oneshot::Receiver<Result<T>> {
        let (tx, rx) = oneshot::channel();
        if let Err(mpsc::error::SendError(job)) = self.jobs.send(make(tx)) {
            // The worker is gone; fail the job instead of leaving the caller hanging.
            let err = || StoreError::Unavailable("credential worker stopped".to_string());
            match job {
                CredentialJob::LoadOrCreate { reply } => {
                    let _ = reply.send(Err(err()));
                }
                CredentialJob::Apply { reply, .. } => {
                    let _ = reply.send(Err(err()));
                }
                CredentialJob::ClearAll { reply } => {
                    let _ = reply.send(Err(err()));
                }
            }
        }
        rx
    }

    /// Loads the stored credentials, creating and persisting fresh identity
    /// material when none exist.
    pub fn load_or_create(&self) -> oneshot::Receiver<Result<SessionCredentials>> {
        self.enqueue(|reply| CredentialJob::LoadOrCreate { reply })
    }

    /// Persists a rotation reported by the transport. Resolves to the
    /// revision that is now durable.
    pub fn apply(&self, update: CredentialUpdate) -> oneshot::Receiver<Result<u64>> {
        self.enqueue(|reply| CredentialJob::Apply { update, reply })
    }

    pub fn clear_all(&self) -> oneshot::Receiver<Result<usize>> {
        self.enqueue(|reply| CredentialJob::ClearAll { reply })
    }
}

/// Flattens a job receiver into the job's own result.
pub async fn completion<T>(rx: oneshot::Receiver<Result<T>>) -> Result<T> {
    rx.await
        .unwrap_or_else(|_| Err(StoreError::Unavailable("credential worker stopped".to_string())))
}

async fn run_worker(store: Arc<CredentialStore>, mut jobs: mpsc::UnboundedReceiver<CredentialJob>) {
    let mut cached: Option<SessionCredentials> = None;

    while let Some(job) = jobs.recv().await {
        match job {
            CredentialJob::LoadOrCreate { reply } => {
                let result = load_or_create(&store, &mut cached).await;
                let _ = reply.send(result);
            }
            CredentialJob::Apply { update, reply } => {
                let revision = update.revision;
                let result = apply(&store, &mut cached, update).await.map(|()| revision);
                if let Err(e) = &result {
                    error!("Failed to persist credential revision {revision}: {e}");
                }
                let _ = reply.send(result);
            }
            CredentialJob::ClearAll { reply } => {
                cached = None;
                let result = store.clear_all(store.session_id()).await;
                let _ = reply.send(result);
            }
        }
    }
    debug!("Credential worker for session {} stopped", store.session_id());
}

async fn load_or_create(
    store: &CredentialStore,
    cached: &mut Option<SessionCredentials>,
) -> Result<SessionCredentials> {
    if let Some(creds) = cached {
        return Ok(creds.clone());
    }
    let creds = match store.load_credentials().await? {
        Some(creds) => {
            debug!("Loaded credentials (version {})", creds.version);
            creds
        }
        None => {
            info!("No stored credentials for session {}; generating new identity material", store.session_id());
            let creds = SessionCredentials::generate();
            store.save_credentials(&creds).await?;
            creds
        }
    };
    *cached = Some(creds.clone());
    Ok(creds)
}

async fn apply(
    store: &CredentialStore,
    cached: &mut Option<SessionCredentials>,
    update: CredentialUpdate,
) -> Result<()> {
    if update.is_empty() {
        return Ok(());
    }
    store.apply_mutations(&update.keys).await?;

    if let Some(patch) = &update.root {
        let mut creds = match cached.take() {
            Some(creds) => creds,
            None => load_or_create(store, cached).await?,
        };
        // Patch a copy so a failed write leaves the cache matching the store.
        let mut next = creds.clone();
        let outcome = match next.apply_patch(patch) {
            Ok(()) => store.save_credentials(&next).await,
            Err(e) => Err(e),
        };
        match outcome {
            Ok(()) => creds = next,
            Err(e) => {
                *cached = Some(creds);
                return Err(e);
            }
        }
        *cached = Some(creds);
    }
    Ok(())
}
