//! Error types for the volume daemon.
//!
//! Covers Bluetooth, D-Bus, I/O, configuration and persistence failures.
//! None of these are surfaced to the user; the manager logs them and keeps
//! running with whatever state it still has.

use thiserror::Error;

use crate::store;

/// Main error type for the volume daemon.
#[derive(Error, Debug)]
pub enum VolumeError {
   #[error("Bluetooth error: {0}")]
   Bluetooth(#[from] bluer::Error),

   #[error("D-Bus error: {0}")]
   DBus(#[from] zbus::Error),

   #[error("D-Bus connection error: {0}")]
   DBusConnection(#[from] zbus::fdo::Error),

   #[error("I/O error: {0}")]
   Io(#[from] std::io::Error),

   #[error("Volume store error: {0}")]
   Store(#[from] store::Error),

   #[error("Could not determine config directory")]
   ConfigDirNotFound,

   #[error("TOML parsing error: {0}")]
   TomlParse(#[from] toml::de::Error),

   #[error("TOML serialization error: {0}")]
   TomlSerialize(#[from] toml::ser::Error),

   #[error("Manager has been shut down")]
   ManagerShutdown,
}

/// Convenience type alias for Results with `VolumeError`.
pub type Result<T> = std::result::Result<T, VolumeError>;
