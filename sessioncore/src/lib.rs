pub mod dedup;
pub mod liveness;
pub mod qr;
pub mod reconnect;
pub mod store;
pub mod types;
