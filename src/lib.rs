//! Bluetooth LE central core.
//!
//! Keeps a directory of discovered peripherals and their GATT services,
//! connects to services, reads, writes and subscribes to characteristics,
//! and reports everything to a host through a polled message queue. The
//! platform stack sits behind [`bluetooth::Adapter`].

pub mod bluetooth;
pub mod central;
pub mod config;
pub mod error;
pub mod event;
pub mod gatt;

pub use central::Central;
pub use error::{BridgeError, Result};
pub use event::{BleEvent, HostSinks, MessageTarget};
