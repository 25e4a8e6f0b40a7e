//! Configuration management for the advertisement manager.
//!
//! This module handles loading and saving configuration from disk,
//! including integration matchers and timing parameters.

use std::{env, fs, path::PathBuf, time::Duration};

use bluer::Address;
use log::warn;
use serde::{Deserialize, Serialize};
use smol_str::SmolStr;

use crate::{
   bluetooth::{
      matcher::{BluetoothMatcher, IntegrationEntry},
      runtime::RuntimeSettings,
   },
   error::{BluetoothError, Result},
};

/// Main configuration structure for the service.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct Config {
   #[serde(default)]
   pub integrations: Vec<IntegrationMatcherConfig>,

   /// Seconds between unavailability sweeps.
   #[serde(default = "default_unavailable_check_interval")]
   pub unavailable_check_interval: u64,

   /// Seconds between checks for newly plugged adapters.
   #[serde(default = "default_adapter_check_interval")]
   pub adapter_check_interval: u64,

   #[serde(default = "default_local_connection_slots")]
   pub local_connection_slots: usize,

   #[serde(default = "default_persist_history")]
   pub persist_history: bool,

   #[serde(default)]
   pub fallback_intervals: Vec<FallbackInterval>,
}

/// Discovery matcher for one integration domain.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct IntegrationMatcherConfig {
   pub domain: SmolStr,
   #[serde(flatten)]
   pub matcher: BluetoothMatcher,
}

/// Availability interval for a device known to advertise slowly.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct FallbackInterval {
   pub address: String,
   pub seconds: f64,
}

const fn default_unavailable_check_interval() -> u64 {
   300
}

const fn default_adapter_check_interval() -> u64 {
   10
}

const fn default_local_connection_slots() -> usize {
   5
}

const fn default_persist_history() -> bool {
   true
}

impl Default for Config {
   fn default() -> Self {
      Self {
         integrations: vec![],
         unavailable_check_interval: default_unavailable_check_interval(),
         adapter_check_interval: default_adapter_check_interval(),
         local_connection_slots: default_local_connection_slots(),
         persist_history: default_persist_history(),
         fallback_intervals: vec![],
      }
   }
}

impl Config {
   /// Loads configuration from disk or creates default if not exists.
   pub fn load() -> Result<Self> {
      let config_path = Self::config_path()?;

      if config_path.exists() {
         let contents = fs::read_to_string(&config_path)?;
         Ok(toml::from_str(&contents)?)
      } else {
         // Create default config
         let config = Self::default();
         config.save()?;
         Ok(config)
      }
   }

   /// Saves the current configuration to disk.
   pub fn save(&self) -> Result<()> {
      let config_path = Self::config_path()?;

      // Ensure directory exists
      if let Some(parent) = config_path.parent() {
         fs::create_dir_all(parent)?;
      }

      let contents = toml::to_string_pretty(self)?;
      fs::write(&config_path, contents)?;

      Ok(())
   }

   fn config_path() -> Result<PathBuf> {
      let config_dir = if let Ok(blemux_home) = env::var("BLEMUX_HOME") {
         PathBuf::from(blemux_home)
      } else if let Ok(config_home) = env::var("XDG_CONFIG_HOME") {
         PathBuf::from(config_home)
      } else if let Ok(home) = env::var("HOME") {
         PathBuf::from(home).join(".config")
      } else {
         return Err(BluetoothError::ConfigDirNotFound);
      };

      Ok(config_dir.join("blemux").join("config.toml"))
   }

   /// Compiles the configured integration matchers.
   pub fn integration_entries(&self) -> Result<Vec<IntegrationEntry>> {
      self
         .integrations
         .iter()
         .map(|i| IntegrationEntry::new(i.domain.clone(), i.matcher.clone()))
         .collect()
   }

   /// Configured fallback intervals; unparsable addresses are skipped.
   pub fn parsed_fallback_intervals(&self) -> Vec<(Address, f64)> {
      self
         .fallback_intervals
         .iter()
         .filter_map(|f| match f.address.parse() {
            Ok(address) => Some((address, f.seconds)),
            Err(e) => {
               warn!("Ignoring fallback interval for {}: {e}", f.address);
               None
            },
         })
         .collect()
   }

   pub fn runtime_settings(&self) -> RuntimeSettings {
      RuntimeSettings {
         unavailable_check_interval: Duration::from_secs(self.unavailable_check_interval.max(1)),
         ..RuntimeSettings::default()
      }
   }

   pub const fn adapter_check_interval(&self) -> Duration {
      Duration::from_secs(self.adapter_check_interval)
   }
}
