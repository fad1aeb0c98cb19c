//! Consumers that deliver items outside the process

pub mod broadcast_server;

pub use broadcast_server::{BroadcastConfig, BroadcastServer};
