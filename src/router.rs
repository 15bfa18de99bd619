//! Connection event routing.
//!
//! Turns connect/disconnect signals for supported audio profiles into
//! tracker session calls and reports the outcome on the event bus.

use bluer::Address;
use log::{debug, info, warn};
use smol_str::{SmolStr, ToSmolStr};

use crate::{
   accessory::AccessoryIdentity,
   audio::{AudioRoutes, RouteType, Volume},
   config::Config,
   event::{EventSender, VolumeEvent},
   store::VolumeStore,
   tracker::{SessionEnd, SessionInfo, Tracker},
};

/// Bluetooth profile a connection event belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
pub enum ProfileType {
   A2dp,
   Headset,
}

/// Profile connection state reported by the system.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
pub enum ConnectionState {
   Connecting,
   Connected,
   Disconnecting,
   Disconnected,
}

/// Device fields carried by a connection event. Either may be missing.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeviceInfo {
   pub name: Option<SmolStr>,
   pub address: Option<Address>,
}

impl DeviceInfo {
   pub fn new(name: Option<SmolStr>, address: Address) -> Self {
      Self {
         name,
         address: Some(address),
      }
   }

   /// Builds the accessory identity; an unnamed device is named by its
   /// address.
   pub fn identity(&self) -> Option<AccessoryIdentity> {
      let address = self.address?;
      let name = self
         .name
         .clone()
         .filter(|n| !n.is_empty())
         .unwrap_or_else(|| address.to_smolstr());
      Some(AccessoryIdentity::new(name, address))
   }
}

/// A connection state change for one device and profile.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionEvent {
   /// `None` when the device speaks no profile we recognize.
   pub profile: Option<ProfileType>,
   pub state: ConnectionState,
   pub device: Option<DeviceInfo>,
}

/// Drives the tracker from connection events.
pub struct ConnectionRouter<A, S> {
   tracker: Tracker<A, S>,
   events: EventSender,
   config: Config,
}

impl<A: AudioRoutes, S: VolumeStore> ConnectionRouter<A, S> {
   pub fn new(tracker: Tracker<A, S>, events: EventSender, config: Config) -> Self {
      Self {
         tracker,
         events,
         config,
      }
   }

   pub const fn tracker(&self) -> &Tracker<A, S> {
      &self.tracker
   }

   pub fn active_session(&self) -> Option<SessionInfo> {
      self.tracker.active_session()
   }

   pub fn handle(&mut self, event: ConnectionEvent) {
      let supported = match event.profile {
         Some(ProfileType::A2dp) => true,
         Some(ProfileType::Headset) => self.config.track_headset,
         None => false,
      };
      if !supported {
         return;
      }

      match event.state {
         // Start on the earliest signal so the restore lands before audio
         // is routed; the later one only retries a missed restore.
         ConnectionState::Connecting | ConnectionState::Connected => {
            let Some(identity) = event.device.as_ref().and_then(DeviceInfo::identity) else {
               warn!("Dropping {} event without device address", event.state);
               return;
            };
            self.connect(identity);
         },
         ConnectionState::Disconnected => {
            let identity = event.device.as_ref().and_then(DeviceInfo::identity);
            self.disconnect(identity.as_ref());
         },
         ConnectionState::Disconnecting => {},
      }
   }

   /// Forwards a route volume change to the tracker.
   pub fn volume_changed(&mut self, route_type: RouteType, volume: Volume) {
      if let Some(saved) = self.tracker.on_volume_changed(route_type, volume)
         && let Some(session) = self.tracker.active_session()
      {
         self
            .events
            .emit(&session.identity, VolumeEvent::VolumeSaved(saved));
      }
   }

   /// Ends the open session, flushing its volume.
   pub fn shutdown(&mut self) {
      if let Some(end) = self.tracker.end_session() {
         self.report_end(&end);
      }
   }

   fn connect(&mut self, identity: AccessoryIdentity) {
      if self.config.is_ignored(identity.address) {
         debug!("Ignoring connection of {identity}");
         return;
      }

      let start = self.tracker.begin_session(identity.clone());
      if let Some(replaced) = &start.replaced {
         self.report_end(replaced);
      }
      if !start.resumed {
         info!("Session active for {identity}, label: {}", start.label);
         self
            .events
            .emit(&identity, VolumeEvent::SessionStarted(start.label));
      }
      if let Some(level) = start.restored {
         self.events.emit(&identity, VolumeEvent::VolumeRestored(level));
      }
      if let Some(level) = start.seeded {
         self.events.emit(&identity, VolumeEvent::VolumeSaved(level));
      }
   }

   fn disconnect(&mut self, identity: Option<&AccessoryIdentity>) {
      if let Some(identity) = identity
         && self.tracker.active_session().is_some()
         && !self.tracker.is_tracking(identity)
      {
         debug!("Ignoring disconnect of untracked {identity}");
         return;
      }

      self.shutdown();
   }

   fn report_end(&self, end: &SessionEnd) {
      if let Some(saved) = end.saved {
         self
            .events
            .emit(&end.identity, VolumeEvent::VolumeSaved(saved));
      }
      self.events.emit(&end.identity, VolumeEvent::SessionEnded);
   }
}

#[cfg(test)]
mod tests {
   use std::sync::Arc;

   use parking_lot::Mutex;

   use super::*;
   use crate::{
      event::EventBus,
      tracker::{
         TrackerOptions,
         tests::{FakeAudio, HEADPHONES, MemoryStore, SPEAKER},
      },
   };

   #[derive(Default)]
   struct Recorder(Mutex<Vec<(Address, VolumeEvent)>>);

   impl EventBus for Recorder {
      fn emit(&self, accessory: &AccessoryIdentity, event: VolumeEvent) {
         self.0.lock().push((accessory.address, event));
      }
   }

   struct Harness {
      router: ConnectionRouter<FakeAudio, MemoryStore>,
      audio: FakeAudio,
      store: MemoryStore,
      events: Arc<Recorder>,
   }

   impl Harness {
      fn new(config: Config, audio: FakeAudio, store: MemoryStore) -> Self {
         let config = Config {
            seed_unknown: false,
            ..config
         };
         Self::seeding(config, audio, store)
      }

      /// Keeps the configured `seed_unknown` setting.
      fn seeding(config: Config, audio: FakeAudio, store: MemoryStore) -> Self {
         let events = Arc::new(Recorder::default());
         let options = TrackerOptions::from(&config);
         let tracker = Tracker::new(audio.clone(), store.clone(), options);
         Self {
            router: ConnectionRouter::new(tracker, events.clone(), config),
            audio,
            store,
            events,
         }
      }

      fn events(&self) -> Vec<(Address, VolumeEvent)> {
         self.events.0.lock().clone()
      }
   }

   fn event(profile: ProfileType, state: ConnectionState, name: &str, address: Address) -> ConnectionEvent {
      ConnectionEvent {
         profile: Some(profile),
         state,
         device: Some(DeviceInfo::new(Some(name.into()), address)),
      }
   }

   #[test]
   fn test_connect_then_disconnect_saves_volume() {
      let mut h = Harness::new(
         Config::default(),
         FakeAudio::with_route("Headphones", HEADPHONES, 3),
         MemoryStore::default(),
      );

      h.router
         .handle(event(ProfileType::A2dp, ConnectionState::Connecting, "Headphones", HEADPHONES));
      h.router.volume_changed(RouteType::Bluetooth, 7);
      h.router
         .handle(event(ProfileType::A2dp, ConnectionState::Disconnected, "Headphones", HEADPHONES));

      assert_eq!(h.store.record("Headphones [AA:BB:CC:DD:EE:FF]"), Some(7));
      assert_eq!(
         h.events(),
         vec![
            (HEADPHONES, VolumeEvent::SessionStarted("Headphones".into())),
            (HEADPHONES, VolumeEvent::VolumeSaved(7)),
            (HEADPHONES, VolumeEvent::SessionEnded),
         ]
      );
      assert!(!h.audio.subscribed());
   }

   #[test]
   fn test_reconnect_restores_and_discards_echo() {
      let mut h = Harness::new(
         Config::default(),
         FakeAudio::with_route("Headphones", HEADPHONES, 30),
         MemoryStore::with("Headphones [AA:BB:CC:DD:EE:FF]", 7),
      );

      h.router
         .handle(event(ProfileType::A2dp, ConnectionState::Connecting, "Headphones", HEADPHONES));
      assert_eq!(h.audio.set_requests(), vec![7]);
      h.router.volume_changed(RouteType::Bluetooth, 7);
      h.router
         .handle(event(ProfileType::A2dp, ConnectionState::Disconnected, "Headphones", HEADPHONES));

      assert!(h.store.writes().is_empty());
      assert_eq!(
         h.events(),
         vec![
            (HEADPHONES, VolumeEvent::SessionStarted("Headphones".into())),
            (HEADPHONES, VolumeEvent::VolumeRestored(7)),
            (HEADPHONES, VolumeEvent::SessionEnded),
         ]
      );
   }

   #[test]
   fn test_connected_after_connecting_resumes() {
      let mut h = Harness::new(
         Config::default(),
         FakeAudio::default(),
         MemoryStore::with("Headphones [AA:BB:CC:DD:EE:FF]", 7),
      );

      h.router
         .handle(event(ProfileType::A2dp, ConnectionState::Connecting, "Headphones", HEADPHONES));
      h.audio.connect_route("Headphones", HEADPHONES, 50);
      h.router
         .handle(event(ProfileType::A2dp, ConnectionState::Connected, "Headphones", HEADPHONES));

      assert_eq!(h.audio.set_requests(), vec![7]);
      assert_eq!(
         h.events(),
         vec![
            (HEADPHONES, VolumeEvent::SessionStarted("Headphones".into())),
            (HEADPHONES, VolumeEvent::VolumeRestored(7)),
         ]
      );
   }

   #[test]
   fn test_missing_address_is_dropped() {
      let mut h = Harness::new(
         Config::default(),
         FakeAudio::with_route("Headphones", HEADPHONES, 3),
         MemoryStore::default(),
      );

      h.router.handle(ConnectionEvent {
         profile: Some(ProfileType::A2dp),
         state: ConnectionState::Connecting,
         device: Some(DeviceInfo {
            name: Some("Headphones".into()),
            address: None,
         }),
      });
      h.router.handle(ConnectionEvent {
         profile: Some(ProfileType::A2dp),
         state: ConnectionState::Connected,
         device: None,
      });

      assert!(h.router.active_session().is_none());
      assert!(h.events().is_empty());
      assert!(!h.audio.subscribed());
   }

   #[test]
   fn test_unnamed_device_uses_address() {
      let mut h = Harness::new(
         Config::default(),
         FakeAudio::default(),
         MemoryStore::default(),
      );

      h.router.handle(ConnectionEvent {
         profile: Some(ProfileType::A2dp),
         state: ConnectionState::Connected,
         device: Some(DeviceInfo::new(None, HEADPHONES)),
      });

      let session = h.router.active_session().unwrap();
      assert_eq!(session.key, "AA:BB:CC:DD:EE:FF [AA:BB:CC:DD:EE:FF]");
   }

   #[test]
   fn test_unsupported_events_are_ignored() {
      let mut h = Harness::new(
         Config::default(),
         FakeAudio::with_route("Headphones", HEADPHONES, 3),
         MemoryStore::default(),
      );

      h.router
         .handle(event(ProfileType::Headset, ConnectionState::Connected, "Headset", HEADPHONES));
      h.router.handle(ConnectionEvent {
         profile: None,
         state: ConnectionState::Connected,
         device: Some(DeviceInfo::new(Some("Keyboard".into()), SPEAKER)),
      });
      assert!(h.router.active_session().is_none());

      h.router
         .handle(event(ProfileType::A2dp, ConnectionState::Connected, "Headphones", HEADPHONES));
      h.router
         .handle(event(ProfileType::A2dp, ConnectionState::Disconnecting, "Headphones", HEADPHONES));
      assert!(h.router.active_session().is_some());
   }

   #[test]
   fn test_headset_profile_when_enabled() {
      let config = Config {
         track_headset: true,
         ..Config::default()
      };
      let mut h = Harness::new(
         config,
         FakeAudio::with_route("Headset", HEADPHONES, 3),
         MemoryStore::default(),
      );

      h.router
         .handle(event(ProfileType::Headset, ConnectionState::Connecting, "Headset", HEADPHONES));
      assert!(h.router.active_session().is_some());
   }

   #[test]
   fn test_ignored_device_is_never_tracked() {
      let config = Config {
         ignored_devices: vec!["AA:BB:CC:DD:EE:FF".into()],
         ..Config::default()
      };
      let mut h = Harness::new(
         config,
         FakeAudio::with_route("Car", HEADPHONES, 3),
         MemoryStore::default(),
      );

      h.router
         .handle(event(ProfileType::A2dp, ConnectionState::Connected, "Car", HEADPHONES));
      assert!(h.router.active_session().is_none());
      assert!(h.events().is_empty());
   }

   #[test]
   fn test_disconnect_of_other_device_keeps_session() {
      let mut h = Harness::new(
         Config::default(),
         FakeAudio::with_route("Headphones", HEADPHONES, 3),
         MemoryStore::default(),
      );

      h.router
         .handle(event(ProfileType::A2dp, ConnectionState::Connected, "Headphones", HEADPHONES));
      h.router
         .handle(event(ProfileType::A2dp, ConnectionState::Disconnected, "Speaker", SPEAKER));
      assert!(h.router.active_session().is_some());

      // No identity at all: assume it was ours.
      h.router.handle(ConnectionEvent {
         profile: Some(ProfileType::A2dp),
         state: ConnectionState::Disconnected,
         device: None,
      });
      assert!(h.router.active_session().is_none());
   }

   #[test]
   fn test_switch_reports_previous_session_end() {
      let mut h = Harness::new(
         Config::default(),
         FakeAudio::with_route("Headphones", HEADPHONES, 3),
         MemoryStore::default(),
      );

      h.router
         .handle(event(ProfileType::A2dp, ConnectionState::Connected, "Headphones", HEADPHONES));
      h.router.volume_changed(RouteType::Bluetooth, 9);
      h.audio.connect_route("Speaker", SPEAKER, 60);
      h.router
         .handle(event(ProfileType::A2dp, ConnectionState::Connecting, "Speaker", SPEAKER));

      assert_eq!(h.store.record("Headphones [AA:BB:CC:DD:EE:FF]"), Some(9));
      assert_eq!(
         h.events(),
         vec![
            (HEADPHONES, VolumeEvent::SessionStarted("Headphones".into())),
            (HEADPHONES, VolumeEvent::VolumeSaved(9)),
            (HEADPHONES, VolumeEvent::SessionEnded),
            (SPEAKER, VolumeEvent::SessionStarted("Speaker".into())),
         ]
      );
   }

   #[test]
   fn test_seeded_record_is_reported() {
      let mut h = Harness::seeding(
         Config::default(),
         FakeAudio::with_route("Headphones", HEADPHONES, 25),
         MemoryStore::default(),
      );

      h.router
         .handle(event(ProfileType::A2dp, ConnectionState::Connected, "Headphones", HEADPHONES));

      assert_eq!(h.store.record("Headphones [AA:BB:CC:DD:EE:FF]"), Some(25));
      assert_eq!(
         h.events(),
         vec![
            (HEADPHONES, VolumeEvent::SessionStarted("Headphones".into())),
            (HEADPHONES, VolumeEvent::VolumeSaved(25)),
         ]
      );
   }

   #[test]
   fn test_switch_restores_once_new_route_appears() {
      let mut h = Harness::new(
         Config::default(),
         FakeAudio::with_route("Headphones", HEADPHONES, 3),
         MemoryStore::with("Speaker [11:22:33:44:55:66]", 50),
      );

      h.router
         .handle(event(ProfileType::A2dp, ConnectionState::Connected, "Headphones", HEADPHONES));
      h.router
         .handle(event(ProfileType::A2dp, ConnectionState::Connecting, "Speaker", SPEAKER));
      assert!(h.audio.set_requests().is_empty());

      h.audio.connect_route("Speaker", SPEAKER, 40);
      h.router
         .handle(event(ProfileType::A2dp, ConnectionState::Connected, "Speaker", SPEAKER));

      assert_eq!(h.audio.set_requests(), vec![50]);
      assert_eq!(h.audio.volume_of(HEADPHONES), Some(3));
      assert_eq!(
         h.events(),
         vec![
            (HEADPHONES, VolumeEvent::SessionStarted("Headphones".into())),
            (HEADPHONES, VolumeEvent::SessionEnded),
            (SPEAKER, VolumeEvent::SessionStarted("Speaker".into())),
            (SPEAKER, VolumeEvent::VolumeRestored(50)),
         ]
      );
   }
}
