pub mod credential_store;
pub mod filestore;
pub mod memory;
pub mod persistence_manager;

pub use credential_store::{CredentialStore, StoreBackend};
pub use filestore::FileStore;
pub use memory::MemoryStore;
pub use persistence_manager::PersistenceManager;
pub use sessioncore::store::{
    CredentialKey, CredentialUpdate, KeyMutation, KeyValueStore, RecentMessageStore,
    SessionCredentials, StoreError,
};
pub use whatsapp_session_sqlite_storage::SqliteStore;
