//! Per-accessory volume tracking.
//!
//! The tracker owns at most one [`TrackingSession`]. While a session is open
//! it listens to volume changes on Bluetooth routes, ignores the change its
//! own restore causes, and writes the last user-driven level to the store.
//!
//! Volume notifications carry no accessory identity. Any change on a
//! Bluetooth media route while a session is open is credited to the tracked
//! accessory, so with two wireless accessories playing at once the wrong
//! one can be credited. This is accepted; the tracker does not try to guess.

use log::{debug, error, info};
use serde::Serialize;
use smol_str::SmolStr;

use crate::{
   accessory::AccessoryIdentity,
   audio::{AudioRoutes, RouteType, Volume},
   config::{Config, KeyFormat, PersistPolicy},
   store::VolumeStore,
};

/// Tracker behaviour taken from the configuration.
#[derive(Debug, Clone, Copy)]
pub struct TrackerOptions {
   pub persist_policy: PersistPolicy,
   pub key_format: KeyFormat,
   pub seed_unknown: bool,
}

impl From<&Config> for TrackerOptions {
   fn from(config: &Config) -> Self {
      Self {
         persist_policy: config.persist_policy,
         key_format: config.key_format,
         seed_unknown: config.seed_unknown,
      }
   }
}

impl Default for TrackerOptions {
   fn default() -> Self {
      Self::from(&Config::default())
   }
}

/// State of the accessory currently being tracked.
#[derive(Debug)]
struct TrackingSession {
   identity: AccessoryIdentity,
   key: String,
   label: SmolStr,
   /// Level stored for this accessory when the session started.
   stored: Option<Volume>,
   /// Level the store holds for this session: restored, seeded, or written.
   /// `None` until a Bluetooth route has been seen.
   initial_volume: Option<Volume>,
   /// Last user-driven level, waiting to be flushed.
   current_volume: Option<Volume>,
   /// The next notification is the echo of our own restore.
   self_inflicted: bool,
}

impl TrackingSession {
   const fn settled(&self) -> bool {
      self.initial_volume.is_some()
   }

   /// Level that should reach the store when the session is flushed.
   fn pending(&self) -> Option<Volume> {
      self
         .current_volume
         .filter(|&volume| Some(volume) != self.initial_volume)
   }
}

/// Result of [`Tracker::begin_session`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionStart {
   /// Human-readable label for the status indicator.
   pub label: SmolStr,
   /// Level applied to the route, if a restore was issued.
   pub restored: Option<Volume>,
   /// Starting level written as the first record of an unknown accessory.
   pub seeded: Option<Volume>,
   /// The accessory was already being tracked; this call only retried the
   /// restore.
   pub resumed: bool,
   /// Session that was flushed and closed to make room for this one.
   pub replaced: Option<SessionEnd>,
}

/// What settling a session did once its route showed up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Settled {
   Restored(Volume),
   Seeded(Volume),
   Observed,
}

impl Settled {
   const fn restored(self) -> Option<Volume> {
      match self {
         Self::Restored(level) => Some(level),
         _ => None,
      }
   }

   const fn seeded(self) -> Option<Volume> {
      match self {
         Self::Seeded(level) => Some(level),
         _ => None,
      }
   }
}

/// Result of closing a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionEnd {
   pub identity: AccessoryIdentity,
   /// Level written to the store while flushing, if any.
   pub saved: Option<Volume>,
}

/// Read-only view of the open session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionInfo {
   pub identity: AccessoryIdentity,
   pub key: String,
   pub label: SmolStr,
   pub initial_volume: Option<Volume>,
   pub current_volume: Option<Volume>,
}

/// The stateful core: decides when to restore, record, or ignore.
pub struct Tracker<A, S> {
   audio: A,
   store: S,
   options: TrackerOptions,
   session: Option<TrackingSession>,
   subscribed: bool,
}

impl<A: AudioRoutes, S: VolumeStore> Tracker<A, S> {
   pub const fn new(audio: A, store: S, options: TrackerOptions) -> Self {
      Self {
         audio,
         store,
         options,
         session: None,
         subscribed: false,
      }
   }

   pub const fn store(&self) -> &S {
      &self.store
   }

   /// Checks whether `identity`'s accessory is the one being tracked.
   pub fn is_tracking(&self, identity: &AccessoryIdentity) -> bool {
      self
         .session
         .as_ref()
         .is_some_and(|s| s.identity.address == identity.address)
   }

   pub fn active_session(&self) -> Option<SessionInfo> {
      self.session.as_ref().map(|s| SessionInfo {
         identity: s.identity.clone(),
         key: s.key.clone(),
         label: s.label.clone(),
         initial_volume: s.initial_volume,
         current_volume: s.current_volume,
      })
   }

   /// Starts tracking `identity`, restoring its stored level if there is
   /// one.
   ///
   /// An open session for a different accessory is flushed and replaced.
   /// Calling this again for the accessory already tracked keeps the session
   /// and only retries a restore that could not be applied earlier because
   /// the accessory's media route did not exist yet.
   pub fn begin_session(&mut self, identity: AccessoryIdentity) -> SessionStart {
      if !self.subscribed {
         self.audio.subscribe();
         self.subscribed = true;
      }

      if let Some(mut session) = self.session.take() {
         if session.identity.address == identity.address {
            let settled = self.settle(&mut session);
            let start = SessionStart {
               label: session.label.clone(),
               restored: settled.and_then(Settled::restored),
               seeded: settled.and_then(Settled::seeded),
               resumed: true,
               replaced: None,
            };
            self.session = Some(session);
            return start;
         }

         info!("Replacing session for {} with {identity}", session.identity);
         let replaced = self.close(session);
         let start = self.open(identity);
         return SessionStart {
            replaced: Some(replaced),
            ..start
         };
      }

      self.open(identity)
   }

   /// Handles a volume change reported by the audio subsystem.
   ///
   /// Returns the level written to the store, if any.
   pub fn on_volume_changed(&mut self, route_type: RouteType, volume: Volume) -> Option<Volume> {
      if route_type != RouteType::Bluetooth {
         debug!("Ignoring volume change on {route_type} route");
         return None;
      }

      let session = self.session.as_mut()?;

      if session.self_inflicted {
         session.self_inflicted = false;
         debug!("Ignoring echo of restored volume {volume} for {}", session.identity);
         return None;
      }

      debug!("Volume for {} changed to {volume}", session.identity);
      session.current_volume = Some(volume);

      match self.options.persist_policy {
         PersistPolicy::Deferred => None,
         PersistPolicy::Immediate => {
            let level = session.pending()?;
            if persist(&self.store, &session.key, level) {
               session.initial_volume = Some(level);
               Some(level)
            } else {
               None
            }
         },
      }
   }

   /// Flushes and closes the open session. Does nothing without one.
   pub fn end_session(&mut self) -> Option<SessionEnd> {
      let session = self.session.take()?;
      let end = self.close(session);

      if self.subscribed {
         self.audio.unsubscribe();
         self.subscribed = false;
      }
      Some(end)
   }

   fn open(&mut self, identity: AccessoryIdentity) -> SessionStart {
      let key = identity.record_key(self.options.key_format);
      let stored = match self.store.get(&key) {
         Ok(stored) => stored,
         Err(e) => {
            error!("Failed to read stored volume for {key}: {e}");
            None
         },
      };

      let label = self
         .audio
         .active_routes()
         .into_iter()
         .find(|r| r.leads_to(identity.address))
         .map_or_else(|| identity.name.clone(), |r| r.name);

      info!("Tracking {identity} (stored volume: {stored:?})");

      let mut session = TrackingSession {
         identity,
         key,
         label: label.clone(),
         stored,
         initial_volume: None,
         current_volume: None,
         self_inflicted: false,
      };
      let settled = self.settle(&mut session);
      self.session = Some(session);

      SessionStart {
         label,
         restored: settled.and_then(Settled::restored),
         seeded: settled.and_then(Settled::seeded),
         resumed: false,
         replaced: None,
      }
   }

   /// Applies the stored level, or records the starting level, once the
   /// accessory's own media route is available. Another accessory's route
   /// does not count.
   fn settle(&self, session: &mut TrackingSession) -> Option<Settled> {
      if session.settled() {
         return None;
      }

      let address = session.identity.address;
      let Some(live) = self.audio.current_volume(address) else {
         debug!("No media route to {} yet", session.identity);
         return None;
      };

      match session.stored {
         Some(level) => {
            // Setting the level it already has produces no notification.
            if live != level {
               self.audio.set_volume(address, level);
               session.self_inflicted = true;
            }
            info!("Restored volume {level} for {}", session.identity);
            session.initial_volume = Some(level);
            Some(Settled::Restored(level))
         },
         None => {
            session.initial_volume = Some(live);
            if self.options.seed_unknown && persist(&self.store, &session.key, live) {
               session.stored = Some(live);
               info!("Seeded volume {live} for {}", session.identity);
               return Some(Settled::Seeded(live));
            }
            Some(Settled::Observed)
         },
      }
   }

   fn close(&self, session: TrackingSession) -> SessionEnd {
      let saved = session
         .pending()
         .filter(|&level| persist(&self.store, &session.key, level));

      info!("Stopped tracking {} (saved: {saved:?})", session.identity);
      SessionEnd {
         identity: session.identity,
         saved,
      }
   }
}

/// Writes `volume` under `key`, logging failures. Returns whether it stuck.
fn persist<S: VolumeStore>(store: &S, key: &str, volume: Volume) -> bool {
   match store.set(key, volume) {
      Ok(()) => {
         debug!("Stored volume {volume} for {key}");
         true
      },
      Err(e) => {
         error!("Failed to store volume {volume} for {key}: {e}");
         false
      },
   }
}
