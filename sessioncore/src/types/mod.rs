pub mod events;
pub mod state;

pub use events::{DeliveryType, DisconnectReason, InboundMessage, TransportEvent};
pub use state::{ConnectionPhase, ConnectionState, Identity, QrChallenge};
