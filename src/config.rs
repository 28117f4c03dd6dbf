//! Configuration management for the bridge daemon.
//!
//! This module handles loading and saving configuration from disk,
//! including the host message target and the simulated peripheral fixture.

use std::{
   env, fs,
   path::{Path, PathBuf},
   time::Duration,
};

use serde::{Deserialize, Serialize};
use smol_str::SmolStr;

use crate::{
   error::{BridgeError, Result},
   event::MessageTarget,
};

/// Main configuration structure for the daemon.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct Config {
   /// How often queued messages are pumped to the host sinks.
   #[serde(default = "default_pump_interval")]
   pub pump_interval_ms: u64,

   #[serde(default = "default_receiver_object")]
   pub receiver_object: String,

   #[serde(default = "default_receiver_method")]
   pub receiver_method: String,

   /// TOML file describing simulated peripherals.
   #[serde(default, skip_serializing_if = "Option::is_none")]
   pub fixture: Option<PathBuf>,

   /// Device ids connected after the first scan.
   #[serde(default)]
   pub autoconnect: Vec<String>,
}

const fn default_pump_interval() -> u64 {
   50
}

fn default_receiver_object() -> String {
   "BluetoothLEReceiver".to_owned()
}

fn default_receiver_method() -> String {
   "OnBluetoothMessage".to_owned()
}

impl Default for Config {
   fn default() -> Self {
      Self {
         pump_interval_ms: default_pump_interval(),
         receiver_object: default_receiver_object(),
         receiver_method: default_receiver_method(),
         fixture: None,
         autoconnect: vec![],
      }
   }
}

impl Config {
   /// Loads configuration from disk or creates default if not exists.
   pub fn load() -> Result<Self> {
      Self::load_from(&Self::config_path()?)
   }

   pub fn load_from(path: &Path) -> Result<Self> {
      if path.exists() {
         let contents = fs::read_to_string(path)?;
         Ok(toml::from_str(&contents)?)
      } else {
         let config = Self::default();
         config.save_to(path)?;
         Ok(config)
      }
   }

   /// Saves the current configuration to disk.
   pub fn save(&self) -> Result<()> {
      self.save_to(&Self::config_path()?)
   }

   pub fn save_to(&self, path: &Path) -> Result<()> {
      if let Some(parent) = path.parent() {
         fs::create_dir_all(parent)?;
      }

      let contents = toml::to_string_pretty(self)?;
      fs::write(path, contents)?;

      Ok(())
   }

   pub fn config_path() -> Result<PathBuf> {
      let config_dir = if let Ok(home) = env::var("GATTBRIDGE_HOME") {
         PathBuf::from(home)
      } else if let Ok(config_home) = env::var("XDG_CONFIG_HOME") {
         PathBuf::from(config_home)
      } else if let Ok(home) = env::var("HOME") {
         PathBuf::from(home).join(".config")
      } else {
         dirs::config_dir().ok_or(BridgeError::ConfigDirNotFound)?
      };

      Ok(config_dir.join("gattbridge").join("config.toml"))
   }

   pub fn pump_interval(&self) -> Duration {
      Duration::from_millis(self.pump_interval_ms.max(1))
   }

   pub fn message_target(&self) -> MessageTarget {
      MessageTarget {
         object: SmolStr::new(&self.receiver_object),
         method: SmolStr::new(&self.receiver_method),
      }
   }
}
