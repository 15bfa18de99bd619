//! BlueZ media transports as audio routes.
//!
//! Every `org.bluez.MediaTransport1` object is an active audio route to a
//! connected device. Its `Volume` property is the AVRCP absolute volume
//! (0..=127) of the stream, which is what gets remembered per accessory.
//!
//! A monitor task follows transports through the BlueZ object manager and
//! keeps a route cache current. Volume changes are only forwarded to the
//! manager while someone is subscribed.

use std::{
   collections::HashMap,
   str::FromStr,
   sync::{
      Arc,
      atomic::{AtomicBool, Ordering},
   },
};

use bluer::Address;
use futures::StreamExt;
use log::{debug, info, warn};
use parking_lot::Mutex;
use smol_str::SmolStr;
use tokio::{select, sync::mpsc, task::JoinHandle};
use zbus::{Connection, fdo::ObjectManagerProxy, proxy, zvariant::OwnedObjectPath};

use crate::{
   audio::{AudioRoutes, MAX_VOLUME, Route, RouteType, Volume},
   bluetooth::profile,
   error::Result,
};

const BLUEZ_SERVICE: &str = "org.bluez";
const TRANSPORT_INTERFACE: &str = "org.bluez.MediaTransport1";
/// Channel buffer size
const CHANNEL_BUFFER_SIZE: usize = 256;

#[proxy(
   interface = "org.bluez.MediaTransport1",
   default_service = "org.bluez",
   gen_blocking = false
)]
trait MediaTransport1 {
   #[zbus(property)]
   fn device(&self) -> zbus::Result<OwnedObjectPath>;

   #[zbus(property, name = "UUID")]
   fn uuid(&self) -> zbus::Result<String>;

   #[zbus(property)]
   fn volume(&self) -> zbus::Result<u16>;

   #[zbus(property)]
   fn set_volume(&self, volume: u16) -> zbus::Result<()>;
}

#[proxy(
   interface = "org.bluez.Device1",
   default_service = "org.bluez",
   gen_blocking = false
)]
trait Device1 {
   #[zbus(property)]
   fn address(&self) -> zbus::Result<String>;

   #[zbus(property)]
   fn alias(&self) -> zbus::Result<String>;
}

/// Notifications produced by the transport monitor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouteEvent {
   /// A transport for a device appeared; the profile link is up.
   Added {
      route_type: RouteType,
      address: Option<Address>,
      name: Option<SmolStr>,
   },
   VolumeChanged(RouteType, Volume),
}

#[derive(Debug, Clone)]
struct TransportRoute {
   path: OwnedObjectPath,
   route: Route,
}

#[derive(Debug, Default)]
struct Shared {
   /// Ordered by arrival, most recent last.
   routes: Mutex<Vec<TransportRoute>>,
   forwarding: AtomicBool,
}

impl Shared {
   fn upsert(&self, path: &OwnedObjectPath, route: Route) {
      let mut routes = self.routes.lock();
      if let Some(existing) = routes.iter_mut().find(|r| &r.path == path) {
         existing.route = route;
      } else {
         routes.push(TransportRoute {
            path: path.clone(),
            route,
         });
      }
   }

   fn update_volume(&self, path: &OwnedObjectPath, volume: Volume) -> Option<RouteType> {
      let mut routes = self.routes.lock();
      let entry = routes.iter_mut().find(|r| &r.path == path)?;
      entry.route.volume = volume;
      Some(entry.route.route_type)
   }

   fn remove(&self, path: &OwnedObjectPath) {
      self.routes.lock().retain(|r| &r.path != path);
   }

   /// Most recent media transport to `address`.
   fn media_route(&self, address: Address) -> Option<TransportRoute> {
      self
         .routes
         .lock()
         .iter()
         .rev()
         .find(|r| r.route.leads_to(address))
         .cloned()
   }
}

/// [`AudioRoutes`] backed by BlueZ media transports on the system bus.
pub struct BluezRoutes {
   connection: Connection,
   shared: Arc<Shared>,
   monitor: JoinHandle<()>,
}

impl BluezRoutes {
   /// Starts following media transports. Route events arrive on the
   /// returned receiver.
   pub fn start(connection: Connection) -> (Self, mpsc::Receiver<RouteEvent>) {
      let (tx, rx) = mpsc::channel(CHANNEL_BUFFER_SIZE);
      let shared = Arc::new(Shared::default());

      let monitor = {
         let connection = connection.clone();
         let shared = shared.clone();
         tokio::spawn(async move {
            if let Err(e) = monitor_transports(connection, shared, tx).await {
               warn!("Media transport monitor stopped: {e}");
            }
         })
      };

      (
         Self {
            connection,
            shared,
            monitor,
         },
         rx,
      )
   }
}

impl Drop for BluezRoutes {
   fn drop(&mut self) {
      self.monitor.abort();
   }
}

impl AudioRoutes for BluezRoutes {
   fn current_volume(&self, address: Address) -> Option<Volume> {
      self.shared.media_route(address).map(|r| r.route.volume)
   }

   fn set_volume(&self, address: Address, level: Volume) {
      let Some(target) = self.shared.media_route(address) else {
         debug!("No media transport to {address} to set volume {level} on");
         return;
      };

      let connection = self.connection.clone();
      tokio::spawn(async move {
         let result = async {
            MediaTransport1Proxy::builder(&connection)
               .path(target.path.clone())?
               .build()
               .await?
               .set_volume(u16::from(level))
               .await
         }
         .await;
         if let Err(e) = result {
            warn!("Failed to set volume {level} on {}: {e}", target.route.name);
         }
      });
   }

   fn subscribe(&mut self) {
      self.shared.forwarding.store(true, Ordering::Relaxed);
   }

   fn unsubscribe(&mut self) {
      self.shared.forwarding.store(false, Ordering::Relaxed);
   }

   fn active_routes(&self) -> Vec<Route> {
      self
         .shared
         .routes
         .lock()
         .iter()
         .map(|r| r.route.clone())
         .collect()
   }
}

/// Clamps a raw transport volume into the native range.
fn native_volume(raw: u16) -> Volume {
   Volume::try_from(raw).map_or(MAX_VOLUME, |v| v.min(MAX_VOLUME))
}

async fn monitor_transports(
   connection: Connection,
   shared: Arc<Shared>,
   tx: mpsc::Sender<RouteEvent>,
) -> Result<()> {
   let manager = ObjectManagerProxy::builder(&connection)
      .destination(BLUEZ_SERVICE)?
      .path("/")?
      .build()
      .await?;

   // Subscribe before listing so nothing falls between the two.
   let mut added = manager.receive_interfaces_added().await?;
   let mut removed = manager.receive_interfaces_removed().await?;

   let mut watchers: HashMap<OwnedObjectPath, JoinHandle<()>> = HashMap::new();

   for (path, interfaces) in manager.get_managed_objects().await? {
      if interfaces.keys().any(|i| i.as_str() == TRANSPORT_INTERFACE) {
         let handle = spawn_watcher(&connection, &shared, &tx, path.clone());
         watchers.insert(path, handle);
      }
   }

   loop {
      select! {
         Some(signal) = added.next() => {
            let args = signal.args()?;
            if args
               .interfaces_and_properties()
               .keys()
               .any(|i| i.as_str() == TRANSPORT_INTERFACE)
            {
               let path = OwnedObjectPath::from(args.object_path().to_owned());
               let handle = spawn_watcher(&connection, &shared, &tx, path.clone());
               if let Some(previous) = watchers.insert(path, handle) {
                  previous.abort();
               }
            }
         }
         Some(signal) = removed.next() => {
            let args = signal.args()?;
            if args.interfaces().iter().any(|i| i.as_str() == TRANSPORT_INTERFACE) {
               let path = OwnedObjectPath::from(args.object_path().to_owned());
               if let Some(handle) = watchers.remove(&path) {
                  handle.abort();
               }
               shared.remove(&path);
               debug!("Media transport removed: {}", path.as_str());
            }
         }
         else => break,
      }
   }

   for handle in watchers.into_values() {
      handle.abort();
   }
   Ok(())
}

fn spawn_watcher(
   connection: &Connection,
   shared: &Arc<Shared>,
   tx: &mpsc::Sender<RouteEvent>,
   path: OwnedObjectPath,
) -> JoinHandle<()> {
   let connection = connection.clone();
   let shared = shared.clone();
   let tx = tx.clone();
   tokio::spawn(async move {
      if let Err(e) = watch_transport(&connection, &shared, &tx, &path).await {
         warn!("Stopped watching transport {}: {e}", path.as_str());
      }
   })
}

async fn watch_transport(
   connection: &Connection,
   shared: &Shared,
   tx: &mpsc::Sender<RouteEvent>,
   path: &OwnedObjectPath,
) -> Result<()> {
   let transport = MediaTransport1Proxy::builder(connection)
      .path(path.clone())?
      .build()
      .await?;

   let route_type = profile::classify_transport(&transport.uuid().await?);
   let device = Device1Proxy::builder(connection)
      .path(transport.device().await?)?
      .build()
      .await?;

   let address = match device.address().await {
      Ok(address) => Address::from_str(&address).ok(),
      Err(e) => {
         warn!("Transport {} has no device address: {e}", path.as_str());
         None
      },
   };
   let name = device.alias().await.ok().map(SmolStr::from);

   // Transports without absolute volume still mark the profile as up.
   match transport.volume().await {
      Ok(raw) => {
         let route = Route {
            route_type,
            name: name.clone().unwrap_or_else(|| SmolStr::new_static("Bluetooth")),
            address,
            volume: native_volume(raw),
         };
         info!(
            "Media transport for {} ({route_type}) at volume {}",
            route.name, route.volume
         );
         shared.upsert(path, route);
      },
      Err(e) => {
         debug!("Transport {} has no volume: {e}", path.as_str());
      },
   }

   if tx
      .send(RouteEvent::Added {
         route_type,
         address,
         name,
      })
      .await
      .is_err()
   {
      return Ok(());
   }

   let mut changes = transport.receive_volume_changed().await;
   while let Some(change) = changes.next().await {
      let raw = match change.get().await {
         Ok(raw) => raw,
         Err(e) => {
            debug!("Unreadable volume change on {}: {e}", path.as_str());
            continue;
         },
      };
      let volume = native_volume(raw);
      let Some(route_type) = shared.update_volume(path, volume) else {
         continue;
      };
      if shared.forwarding.load(Ordering::Relaxed)
         && tx
            .send(RouteEvent::VolumeChanged(route_type, volume))
            .await
            .is_err()
      {
         break;
      }
   }

   Ok(())
}

#[cfg(test)]
mod tests {
   use super::*;

   fn path(s: &str) -> OwnedObjectPath {
      OwnedObjectPath::try_from(s).unwrap()
   }

   const HEADPHONES: Address = Address([0xAA, 0xBB, 0xCC, 0xDD, 0xEE, 0xFF]);
   const SPEAKER: Address = Address([0x11, 0x22, 0x33, 0x44, 0x55, 0x66]);

   fn route(route_type: RouteType, name: &str, address: Address, volume: Volume) -> Route {
      Route {
         route_type,
         name: name.into(),
         address: Some(address),
         volume,
      }
   }

   #[test]
   fn test_native_volume_clamps() {
      assert_eq!(native_volume(0), 0);
      assert_eq!(native_volume(64), 64);
      assert_eq!(native_volume(127), 127);
      assert_eq!(native_volume(200), MAX_VOLUME);
      assert_eq!(native_volume(u16::MAX), MAX_VOLUME);
   }

   #[test]
   fn test_media_route_matches_accessory() {
      let shared = Shared::default();
      let a = path("/org/bluez/hci0/dev_AA_BB_CC_DD_EE_FF/sep1/fd0");
      let b = path("/org/bluez/hci0/dev_11_22_33_44_55_66/sep1/fd1");
      let call = path("/org/bluez/hci0/dev_11_22_33_44_55_66/fd2");

      shared.upsert(&a, route(RouteType::Bluetooth, "Headphones", HEADPHONES, 40));
      shared.upsert(&call, route(RouteType::BluetoothCall, "Speaker", SPEAKER, 10));

      // Only a call link to the speaker so far.
      assert!(shared.media_route(SPEAKER).is_none());
      assert_eq!(shared.media_route(HEADPHONES).unwrap().route.volume, 40);

      shared.upsert(&b, route(RouteType::Bluetooth, "Speaker", SPEAKER, 90));
      let media = shared.media_route(SPEAKER).unwrap();
      assert_eq!(media.path, b);
      assert_eq!(media.route.volume, 90);
      assert_eq!(shared.media_route(HEADPHONES).unwrap().route.name, "Headphones");

      shared.remove(&b);
      assert!(shared.media_route(SPEAKER).is_none());
   }

   #[test]
   fn test_update_volume_reports_route_type() {
      let shared = Shared::default();
      let a = path("/org/bluez/hci0/dev_AA_BB_CC_DD_EE_FF/sep1/fd0");

      assert_eq!(shared.update_volume(&a, 10), None);

      shared.upsert(&a, route(RouteType::Bluetooth, "Headphones", HEADPHONES, 40));
      assert_eq!(shared.update_volume(&a, 10), Some(RouteType::Bluetooth));
      assert_eq!(shared.media_route(HEADPHONES).unwrap().route.volume, 10);

      // Re-adding the same transport replaces it in place.
      shared.upsert(&a, route(RouteType::Bluetooth, "Headphones", HEADPHONES, 55));
      assert_eq!(shared.routes.lock().len(), 1);
   }
}
