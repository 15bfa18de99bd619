//! Bluetooth accessory volume memory for BlueZ.
//!
//! This service remembers the last media volume used with each paired
//! Bluetooth audio accessory, restores it when the accessory reconnects,
//! and publishes session status on the session bus.

use std::{sync::Arc, time::Duration};

use crossbeam::queue::SegQueue;
use log::{info, warn};
use tokio::{signal, sync::Notify, time};
use zbus::{Connection, connection, object_server::InterfaceRef};

use accessory::AccessoryIdentity;
use audio::bluez::BluezRoutes;
use bluetooth::manager::BluetoothManager;
use dbus::VolumeService;
use event::{EventBus, VolumeEvent};
use store::VolumeDb;

mod accessory;
mod audio;
mod bluetooth;
mod config;
mod dbus;
mod error;
mod event;
mod router;
mod store;
mod tracker;

use crate::{dbus::VolumeServiceSignals, error::Result};

const OBJECT_PATH: &str = "/org/btvolume/manager";

#[tokio::main]
async fn main() -> Result<()> {
   env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

   info!("Starting btvolumed...");

   let config = config::Config::load()?;
   info!(
      "Loaded configuration (persist policy: {}, key format: {}, {} ignored devices)",
      config.persist_policy,
      config.key_format,
      config.ignored_devices.len()
   );

   let store = VolumeDb::open()?;

   let event_bus = EventProcessor::new();

   // BlueZ lives on the system bus
   let system_bus = Connection::system().await?;
   let routes = BluezRoutes::start(system_bus);

   let bluetooth_manager =
      BluetoothManager::new(config, event_bus.clone(), routes, store).await?;

   let service = VolumeService::new(bluetooth_manager.clone());

   let connection = connection::Builder::session()?
      .name("org.btvolume")?
      .serve_at(OBJECT_PATH, service)?
      .build()
      .await?;

   info!("btvolumed D-Bus service started at org.btvolume");

   event_bus.spawn_dispatcher(connection).await?;

   signal::ctrl_c().await?;
   info!("Shutting down btvolumed...");

   // Flush the open session before exiting
   bluetooth_manager.shutdown().await?;

   Ok(())
}

struct EventProcessor {
   queue: SegQueue<(AccessoryIdentity, VolumeEvent)>,
   notifier: Notify,
}

impl EventProcessor {
   fn new() -> Arc<Self> {
      Arc::new(Self {
         queue: SegQueue::new(),
         notifier: Notify::new(),
      })
   }
}

impl EventProcessor {
   async fn recv(self: &Arc<Self>) -> Option<(AccessoryIdentity, VolumeEvent)> {
      loop {
         if let Some(event) = self.queue.pop() {
            return Some(event);
         }
         let notify = self.notifier.notified();
         if let Some(event) = self.queue.pop() {
            return Some(event);
         }
         if Arc::strong_count(self) == 1 {
            return None;
         }
         let _ = time::timeout(Duration::from_secs(1), notify).await;
      }
   }

   async fn dispatch(
      &self,
      iface: &InterfaceRef<VolumeService>,
      (accessory, event): (AccessoryIdentity, VolumeEvent),
   ) -> Result<()> {
      let addr_str = accessory.address.to_string();
      match event {
         VolumeEvent::SessionStarted(label) => {
            iface.session_started(&addr_str, &label).await?;
            iface
               .get()
               .await
               .active_label_changed(iface.signal_emitter())
               .await?;
         },
         VolumeEvent::SessionEnded => {
            iface.session_ended(&addr_str).await?;
            iface
               .get()
               .await
               .active_label_changed(iface.signal_emitter())
               .await?;
         },
         VolumeEvent::VolumeRestored(level) => {
            iface.volume_restored(&addr_str, level).await?;
         },
         VolumeEvent::VolumeSaved(level) => {
            iface.volume_saved(&addr_str, level).await?;
            iface
               .get()
               .await
               .record_count_changed(iface.signal_emitter())
               .await?;
         },
      }
      Ok(())
   }

   async fn spawn_dispatcher(self: Arc<Self>, connection: Connection) -> Result<()> {
      let iface = connection
         .object_server()
         .interface::<_, VolumeService>(OBJECT_PATH)
         .await?;
      tokio::spawn(async move {
         while let Some(event) = self.recv().await {
            if let Err(e) = self.dispatch(&iface, event).await {
               warn!("Error dispatching event: {e}");
            }
         }
      });

      Ok(())
   }
}

impl EventBus for EventProcessor {
   fn emit(&self, accessory: &AccessoryIdentity, event: VolumeEvent) {
      self.queue.push((accessory.clone(), event));
      self.notifier.notify_waiters();
   }
}
