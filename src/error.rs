use sessioncore::store::StoreError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("session actor is no longer running")]
    ActorGone,
    #[error("store error: {0}")]
    Store(#[from] StoreError),
    #[error("config error: {0}")]
    Config(#[from] crate::config::ConfigError),
    #[error("a transport factory is required to build a session")]
    MissingTransport,
}
