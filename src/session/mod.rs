mod delivery;
mod handle;
mod manager;
mod messages;
mod timers;

#[cfg(test)]
mod tests;

pub use handle::{RunningSession, Session, SessionBuilder, SessionHandle};
