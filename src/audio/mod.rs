//! Audio route abstraction.
//!
//! The tracker never talks to an audio server directly. It goes through the
//! [`AudioRoutes`] capability, which exposes the live output routes, their
//! volume, and a switch for forwarding volume-change notifications.
//! Wireless routes are addressed by the accessory they lead to.

use bluer::Address;
use smol_str::SmolStr;

pub mod bluez;

/// Volume level in the route's native range.
pub type Volume = u8;

/// Upper bound of AVRCP absolute volume as exposed by BlueZ.
pub const MAX_VOLUME: Volume = 127;

/// Class of an audio output route.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
pub enum RouteType {
   /// Media stream to a wireless accessory (A2DP sink).
   Bluetooth,
   /// Voice link to a headset (HFP/HSP). Call volume is not tracked.
   BluetoothCall,
   /// Anything else, e.g. a phone streaming to this host.
   Unknown,
}

/// A live audio output path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Route {
   pub route_type: RouteType,
   pub name: SmolStr,
   /// Accessory at the other end, when the backend knows it.
   pub address: Option<Address>,
   pub volume: Volume,
}

impl Route {
   pub const fn is_bluetooth(&self) -> bool {
      matches!(self.route_type, RouteType::Bluetooth)
   }

   /// Whether this is the media route to `address`.
   pub fn leads_to(&self, address: Address) -> bool {
      self.is_bluetooth() && self.address == Some(address)
   }
}

/// Capability interface to the audio subsystem.
///
/// Calls are made from the manager's single event loop. Implementations
/// must not block; [`AudioRoutes::set_volume`] is fire-and-forget and the
/// resulting change comes back as a regular notification.
pub trait AudioRoutes {
   /// Volume of the media route to `address`, if there is one.
   fn current_volume(&self, address: Address) -> Option<Volume>;

   /// Requests a new level on the media route to `address`.
   fn set_volume(&self, address: Address, level: Volume);

   /// Starts forwarding volume-change notifications to the manager.
   fn subscribe(&mut self);

   /// Stops forwarding volume-change notifications.
   fn unsubscribe(&mut self);

   /// Lists the routes that currently carry audio.
   fn active_routes(&self) -> Vec<Route>;
}
