use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization/deserialization error: {0}")]
    Serialization(String),

    #[error("Store unavailable: {0}")]
    Unavailable(String),

    #[error("Database connection error: {0}")]
    Connection(String),

    #[error("Database operation error: {0}")]
    Database(String),

    #[error("Migration error: {0}")]
    Migration(String),
}

impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

impl StoreError {
    /// Errors that suggest the backing store itself is unreachable rather
    /// than the request being bad. A failed query is not one of them.
    pub fn is_unavailable(&self) -> bool {
        matches!(
            self,
            Self::Io(_) | Self::Unavailable(_) | Self::Connection(_)
        )
    }
}


pub type Result<T> = std::result::Result<T, StoreError>;
