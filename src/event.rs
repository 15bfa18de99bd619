//! Event handling for session status updates.
//!
//! The manager reports session lifecycle and volume bookkeeping through an
//! [`EventBus`]; the binary forwards these to D-Bus signals that drive the
//! status indicator.

use std::sync::Arc;

use smol_str::SmolStr;

use crate::{accessory::AccessoryIdentity, audio::Volume};

/// Events that can be emitted by the volume service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VolumeEvent {
   SessionStarted(SmolStr),
   SessionEnded,
   VolumeRestored(Volume),
   VolumeSaved(Volume),
}

/// Trait for implementing event emission.
pub trait EventBus: Send + Sync {
   /// Emits an event to all registered listeners.
   fn emit(&self, accessory: &AccessoryIdentity, event: VolumeEvent);
}

/// Type alias for a thread-safe event sender.
pub type EventSender = Arc<dyn EventBus>;
