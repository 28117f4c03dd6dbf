//! Error types for the GATT bridge.
//!
//! Every failure the core can hit is one of these variants. None of them
//! cross the host boundary as a Rust error: the session converts them into
//! queued `Error` messages whose payload is the `Display` text below.

use std::path::PathBuf;

use thiserror::Error;

use crate::gatt::ids::{AttrUuid, ContainerId};

/// Main error type for the GATT bridge.
#[derive(Error, Debug)]
pub enum BridgeError {
   #[error("Could not find {0}")]
   NotFound(String),

   #[error("Invalid {what}: {reason}")]
   InvalidArgument { what: &'static str, reason: String },

   #[error("Characteristic {0} is not readable.")]
   NotReadable(AttrUuid),

   #[error("Characteristic {0} is not Notifiable.")]
   NotNotifiable(AttrUuid),

   #[error("GATT service id {found} does not match service id {expected}")]
   ProtocolMismatch { expected: AttrUuid, found: AttrUuid },

   #[error("Device {0} reported 0 characteristics.")]
   NoCharacteristics(ContainerId),

   #[error("Failed to allocate {size} bytes of memory.")]
   BufferAllocation { size: usize },

   #[error("{context}: {message}")]
   OsApi { context: String, message: String },

   #[error("I/O error: {0}")]
   Io(#[from] std::io::Error),

   #[error("Could not determine config directory")]
   ConfigDirNotFound,

   #[error("TOML parsing error: {0}")]
   TomlParse(#[from] toml::de::Error),

   #[error("TOML serialization error: {0}")]
   TomlSerialize(#[from] toml::ser::Error),

   #[error("Invalid fixture {path}: {reason}")]
   Fixture { path: PathBuf, reason: String },
}

impl BridgeError {
   pub fn not_found(what: impl Into<String>) -> Self {
      Self::NotFound(what.into())
   }

   pub fn os_api(context: impl Into<String>, message: impl ToString) -> Self {
      Self::OsApi {
         context: context.into(),
         message: message.to_string(),
      }
   }

   pub fn missing(what: &'static str) -> Self {
      Self::InvalidArgument {
         what,
         reason: "empty".to_owned(),
      }
   }
}

/// Convenience type alias for Results with `BridgeError`.
pub type Result<T> = std::result::Result<T, BridgeError>;
