pub mod credentials;
pub mod error;
pub mod keys;
pub mod traits;

pub use credentials::{CredentialUpdate, KeyMutation, SessionCredentials};
pub use error::{Result, StoreError};
pub use keys::{CredentialKey, liveness_key};
pub use traits::{KeyValueStore, RecentMessageStore};
