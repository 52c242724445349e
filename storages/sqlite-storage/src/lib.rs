//! SQLite storage backend for whatsapp-session
//!
//! This crate provides the durable primary store: the session key-value
//! contract and the log of recently persisted messages used for duplicate
//! detection after a restart.

mod schema;
mod sqlite_store;

pub use sqlite_store::SqliteStore;
