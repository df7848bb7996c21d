pub mod hub;
pub mod server;
pub mod sse;
pub mod wire;

pub use hub::{BroadcastHub, HubError, Subscriber, DEFAULT_SUBSCRIBER_QUEUE};
pub use server::{start, AppState, ServerConfig, ServerHandle};
pub use wire::{map_state, Envelope, EventKind, StateRes};
