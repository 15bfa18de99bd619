//! Bluetooth side of the daemon.
//!
//! This module follows adapters and audio-capable devices through BlueZ and
//! hosts the manager actor that owns tracking state.

pub mod manager;
pub mod profile;
