// Runtime-agnostic pieces live in sessioncore and are re-exported here.
pub use sessioncore::{dedup as dedup_cache, liveness, qr, reconnect};

pub mod types {
    pub use sessioncore::types::*;
    pub mod events;
}

pub mod config;
pub mod dedup;
pub mod error;
pub mod heartbeat;
pub mod qrcode;
pub mod session;
pub mod store;
pub mod transport;

pub use config::SessionConfig;
pub use error::SessionError;
pub use session::{RunningSession, Session, SessionBuilder, SessionHandle};
