use crate::store::filestore::FileStore;
use log::{debug, info, warn};
use sessioncore::liveness::LivenessRecord;
use sessioncore::store::keys::session_prefix;
use sessioncore::store::{
    CredentialKey, KeyMutation, KeyValueStore, Result, SessionCredentials, StoreError,
    liveness_key,
};
use std::future::Future;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

/// Which implementation currently serves credential reads and writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreBackend {
    Primary,
    Fallback,
}

/// Credential persistence for one session.
///
/// The backend is chosen once by probing the primary store. After that the
/// only switch is a single move to the local fallback when the primary
/// reports itself unavailable mid-operation.
pub struct CredentialStore {
    session_id: String,
    fallback_dir: PathBuf,
    active: RwLock<Arc<dyn KeyValueStore>>,
    degraded: AtomicBool,
}

impl CredentialStore {
    pub async fn open(
        session_id: impl Into<String>,
        primary: Option<Arc<dyn KeyValueStore>>,
        fallback_dir: impl Into<PathBuf>,
        probe_timeout: Duration,
    ) -> Result<Self> {
        let session_id = session_id.into();
        let fallback_dir = fallback_dir.into();

        let (active, degraded): (Arc<dyn KeyValueStore>, bool) = match primary {
            Some(primary) => match tokio::time::timeout(probe_timeout, primary.probe()).await {
                Ok(Ok(())) => {
                    info!(target: "Store/Credentials", "Using {} store for session {session_id}", primary.name());
                    (primary, false)
                }
                Ok(Err(e)) => {
                    warn!(target: "Store/Credentials", "Primary {} store unreachable ({e}); using local files in {}", primary.name(), fallback_dir.display());
                    (Arc::new(FileStore::new(&fallback_dir).await?), true)
                }
                Err(_) => {
                    warn!(target: "Store/Credentials", "Primary {} store probe timed out after {probe_timeout:?}; using local files in {}", primary.name(), fallback_dir.display());
                    (Arc::new(FileStore::new(&fallback_dir).await?), true)
                }
            },
            None => {
                debug!(target: "Store/Credentials", "No primary store configured; using local files in {}", fallback_dir.display());
                (Arc::new(FileStore::new(&fallback_dir).await?), true)
            }
        };

        Ok(Self {
            session_id,
            fallback_dir,
            active: RwLock::new(active),
            degraded: AtomicBool::new(degraded),
        })
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn backend(&self) -> StoreBackend {
        if self.degraded.load(Ordering::SeqCst) {
            StoreBackend::Fallback
        } else {
            StoreBackend::Primary
        }
    }

    fn current(&self) -> Result<Arc<dyn KeyValueStore>> {
        self.active
            .read()
            .map(|store| store.clone())
            .map_err(|_| StoreError::Unavailable("credential store lock poisoned".to_string()))
    }

    async fn degrade(&self, cause: &StoreError) -> Result<Arc<dyn KeyValueStore>> {
        if self.degraded.swap(true, Ordering::SeqCst) {
            return self.current();
        }
        warn!(target: "Store/Credentials", "Primary store became unavailable ({cause}); continuing with local files in {}", self.fallback_dir.display());
        let fallback: Arc<dyn KeyValueStore> = Arc::new(FileStore::new(&self.fallback_dir).await?);
        let mut active = self
            .active
            .write()
            .map_err(|_| StoreError::Unavailable("credential store lock poisoned".to_string()))?;
        *active = fallback.clone();
        Ok(fallback)
    }

    /// Runs `op` against the active store, retrying once on the fallback if
    /// the primary turns out to be unavailable.
    async fn run<T, F, Fut>(&self, op: F) -> Result<T>
    where
        F: Fn(Arc<dyn KeyValueStore>) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let store = self.current()?;
        match op(store).await {
            Err(e) if e.is_unavailable() && !self.degraded.load(Ordering::SeqCst) => {
                let fallback = self.degrade(&e).await?;
                op(fallback).await
            }
            other => other,
        }
    }

    pub async fn read(&self, key: &CredentialKey) -> Result<Option<Vec<u8>>> {
        let key = key.storage_key();
        self.run(|store| {
            let key = key.clone();
            async move { store.get(&key).await }
        })
        .await
    }

    pub async fn write(&self, key: &CredentialKey, value: &[u8]) -> Result<()> {
        let key = key.storage_key();
        self.run(|store| {
            let key = key.clone();
            let value = value.to_vec();
            async move { store.set(&key, &value).await }
        })
        .await
    }

    pub async fn remove(&self, key: &CredentialKey) -> Result<()> {
        let key = key.storage_key();
        self.run(|store| {
            let key = key.clone();
            async move { store.delete(&key).await }
        })
        .await
        .map(|_| ())
    }

    /// Deletes every credential record of `session_id`. The root blob goes
    /// first so an interrupted clear can never leave a usable half-session.
    pub async fn clear_all(&self, session_id: &str) -> Result<usize> {
        let root = CredentialKey::root(session_id).storage_key();
        let prefix = session_prefix(session_id);
        let removed = self
            .run(|store| {
                let root = root.clone();
                let prefix = prefix.clone();
                async move {
                    let root_removed = store.delete(&root).await?;
                    let rest = store.delete_prefix(&prefix).await?;
                    Ok(usize::from(root_removed) + rest)
                }
            })
            .await?;
        info!(target: "Store/Credentials", "Cleared {removed} credential records for session {session_id}");
        Ok(removed)
    }

    pub async fn load_credentials(&self) -> Result<Option<SessionCredentials>> {
        match self.read(&CredentialKey::root(&self.session_id)).await? {
            Some(bytes) => SessionCredentials::from_bytes(&bytes).map(Some),
            None => Ok(None),
        }
    }

    pub async fn save_credentials(&self, credentials: &SessionCredentials) -> Result<()> {
        let bytes = credentials.to_bytes()?;
        self.write(&CredentialKey::root(&self.session_id), &bytes)
            .await
    }

    pub async fn apply_mutations(&self, mutations: &[KeyMutation]) -> Result<()> {
        for mutation in mutations {
            let key = CredentialKey::new(&self.session_id, &mutation.category, &mutation.id);
            match &mutation.value {
                Some(value) => self.write(&key, value).await?,
                None => self.remove(&key).await?,
            }
        }
        Ok(())
    }

    pub async fn load_liveness(&self, identity: &str) -> Result<Option<LivenessRecord>> {
        let key = liveness_key(identity);
        let bytes = self
            .run(|store| {
                let key = key.clone();
                async move { store.get(&key).await }
            })
            .await?;
        match bytes {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    pub async fn save_liveness(&self, identity: &str, record: &LivenessRecord) -> Result<()> {
        let key = liveness_key(identity);
        let bytes = serde_json::to_vec(record)?;
        self.run(|store| {
            let key = key.clone();
            let bytes = bytes.clone();
            async move { store.set(&key, &bytes).await }
        })
        .await
    }
}
