//! courier-core — wire format and configuration shared by every Courier crate.

pub mod config;
pub mod wire;

pub use config::{ConfigError, CourierConfig, MessengerSettings};
pub use wire::{ChunkRecord, MessageId, WireError};
