//! Configuration management for the volume daemon.
//!
//! This module handles loading and saving configuration from disk,
//! including the persistence policy and which devices are tracked.

use std::{env, fs, path::PathBuf, time::Duration};

use bluer::Address;
use serde::{Deserialize, Serialize};

use crate::error::{Result, VolumeError};

/// When observed volume changes reach the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, strum::Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum PersistPolicy {
   /// Keep the last change in memory and write it when the session ends.
   #[default]
   Deferred,
   /// Write every user-driven change as it arrives.
   Immediate,
}

/// How a record key is derived from an accessory identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, strum::Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum KeyFormat {
   /// `"<name> [<address>]"`
   #[default]
   NameAndAddress,
   /// `"<address>"`
   Address,
}

/// Main configuration structure for the service.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Config {
   #[serde(default)]
   pub persist_policy: PersistPolicy,

   #[serde(default)]
   pub key_format: KeyFormat,

   #[serde(default)]
   pub track_headset: bool,

   #[serde(default = "default_seed_unknown")]
   pub seed_unknown: bool,

   #[serde(default)]
   pub ignored_devices: Vec<String>,

   #[serde(default = "default_health_check_interval")]
   pub health_check_interval: u64,
}

const fn default_seed_unknown() -> bool {
   true
}

const fn default_health_check_interval() -> u64 {
   5
}

impl Default for Config {
   fn default() -> Self {
      Self {
         persist_policy: PersistPolicy::default(),
         key_format: KeyFormat::default(),
         track_headset: false,
         seed_unknown: default_seed_unknown(),
         ignored_devices: vec![],
         health_check_interval: default_health_check_interval(),
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

      if let Some(parent) = config_path.parent() {
         fs::create_dir_all(parent)?;
      }

      let contents = toml::to_string_pretty(self)?;
      fs::write(&config_path, contents)?;

      Ok(())
   }

   fn config_path() -> Result<PathBuf> {
      let config_dir = if let Ok(home) = env::var("BTVOLUME_HOME") {
         PathBuf::from(home)
      } else if let Ok(config_home) = env::var("XDG_CONFIG_HOME") {
         PathBuf::from(config_home)
      } else if let Ok(home) = env::var("HOME") {
         PathBuf::from(home).join(".config")
      } else {
         return Err(VolumeError::ConfigDirNotFound);
      };

      Ok(config_dir.join("btvolumed").join("config.toml"))
   }

   /// Checks if the given address should never be tracked.
   pub fn is_ignored(&self, address: Address) -> bool {
      let address = address.to_string();
      self
         .ignored_devices
         .iter()
         .any(|d| d.eq_ignore_ascii_case(&address))
   }

   pub fn health_check_interval(&self) -> Duration {
      Duration::from_secs(self.health_check_interval.max(1))
   }
}

#[cfg(test)]
mod tests {
   use super::*;

   #[test]
   fn test_defaults_from_empty_file() {
      let config: Config = toml::from_str("").unwrap();
      assert_eq!(config.persist_policy, PersistPolicy::Deferred);
      assert_eq!(config.key_format, KeyFormat::NameAndAddress);
      assert!(!config.track_headset);
      assert!(config.seed_unknown);
      assert!(config.ignored_devices.is_empty());
      assert_eq!(config.health_check_interval(), Duration::from_secs(5));
   }

   #[test]
   fn test_zero_interval_is_clamped() {
      let config: Config = toml::from_str("health_check_interval = 0").unwrap();
      assert_eq!(config.health_check_interval(), Duration::from_secs(1));
   }

   #[test]
   fn test_parse_overrides() {
      let config: Config = toml::from_str(
         r#"
         persist_policy = "immediate"
         key_format = "address"
         track_headset = true
         ignored_devices = ["aa:bb:cc:dd:ee:ff"]
         "#,
      )
      .unwrap();
      assert_eq!(config.persist_policy, PersistPolicy::Immediate);
      assert_eq!(config.key_format, KeyFormat::Address);
      assert!(config.track_headset);
      assert!(config.is_ignored(Address([0xAA, 0xBB, 0xCC, 0xDD, 0xEE, 0xFF])));
      assert!(!config.is_ignored(Address([0x11, 0x22, 0x33, 0x44, 0x55, 0x66])));
   }

   #[test]
   fn test_roundtrip_through_toml() {
      let config = Config {
         persist_policy: PersistPolicy::Immediate,
         ..Config::default()
      };
      let text = toml::to_string_pretty(&config).unwrap();
      assert!(text.contains("persist_policy = \"immediate\""));
      let back: Config = toml::from_str(&text).unwrap();
      assert_eq!(back.persist_policy, PersistPolicy::Immediate);
   }
}
