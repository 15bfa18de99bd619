//! Bluetooth manager for audio accessories.
//!
//! The manager actor is the single owner of tracking state. Adapter and
//! device monitors, the media transport monitor, and D-Bus queries all post
//! commands to it, so connection events and volume changes are handled one
//! at a time and in order.

use std::{
   collections::{HashMap, HashSet},
   time::Duration,
};

use bluer::{Adapter, AdapterEvent, Address, Device, DeviceEvent, DeviceProperty, Session};
use futures::stream::StreamExt;
use log::{debug, error, info, warn};
use rand::Rng;
use smol_str::SmolStr;
use tokio::{
   select,
   sync::{mpsc, oneshot},
   task::JoinHandle,
   time::{self, MissedTickBehavior},
};

use crate::{
   audio::{
      Volume,
      bluez::{BluezRoutes, RouteEvent},
   },
   bluetooth::profile,
   config::Config,
   error::{Result, VolumeError},
   event::EventSender,
   router::{ConnectionEvent, ConnectionRouter, ConnectionState, DeviceInfo, ProfileType},
   store::{VolumeDb, VolumeStore},
   tracker::{SessionInfo, Tracker, TrackerOptions},
};

/// Interval to check for new adapters
const ADAPTER_CHECK_INTERVAL: Duration = Duration::from_secs(10);
/// Maximum adapter recovery delay
const MAX_RETRY_DELAY: Duration = Duration::from_secs(120);
/// Channel buffer size
const CHANNEL_BUFFER_SIZE: usize = 1000;

// === Adapter Management ===

#[derive(Debug, Clone, PartialEq)]
enum AdapterState {
   Active,
   Lost,
   Failed(String),
}

struct AdapterInfo {
   adapter: Adapter,
   state: AdapterState,
   monitor_handle: Option<JoinHandle<()>>,
   retry_count: u32,
}

// === Device Management ===

struct WatchedDevice {
   profile: ProfileType,
   connected: bool,
   adapter_name: SmolStr,
   monitor_handle: Option<JoinHandle<()>>,
}

// === Commands ===

#[derive(Debug)]
enum ManagerCommand {
   // Adapter events
   AdapterAvailable(SmolStr, Adapter),
   AdapterLost(SmolStr),
   AdapterError(SmolStr, String), // adapter_name, error

   // Device events
   DeviceDiscovered(Address, SmolStr), // address, adapter_name
   DeviceConnected(Address),
   DeviceDisconnected(Address),
   DeviceLost(Address),

   // Queries
   GetActiveSession(oneshot::Sender<Option<SessionInfo>>),
   GetVolumes(oneshot::Sender<Result<Vec<(String, Volume)>>>),
   Shutdown(oneshot::Sender<()>),
}

// === Main Manager ===

/// Handle to the manager actor.
///
/// Cheap to clone; all clones talk to the same actor.
#[derive(Clone)]
pub struct BluetoothManager {
   inbox: mpsc::Sender<ManagerCommand>,
}

impl BluetoothManager {
   pub async fn new(
      config: Config,
      event_tx: EventSender,
      routes: (BluezRoutes, mpsc::Receiver<RouteEvent>),
      store: VolumeDb,
   ) -> Result<Self> {
      let (command_tx, command_rx) = mpsc::channel(CHANNEL_BUFFER_SIZE);
      let session = Session::new().await?;
      tokio::spawn(ManagerActor::new(config, event_tx, command_rx, session, routes, store).run());
      Ok(Self { inbox: command_tx })
   }

   pub async fn active_session(&self) -> Option<SessionInfo> {
      let (tx, rx) = oneshot::channel();
      if self
         .inbox
         .send(ManagerCommand::GetActiveSession(tx))
         .await
         .is_err()
      {
         return None;
      }
      rx.await.ok().flatten()
   }

   pub async fn volumes(&self) -> Result<Vec<(String, Volume)>> {
      let (tx, rx) = oneshot::channel();
      self
         .inbox
         .send(ManagerCommand::GetVolumes(tx))
         .await
         .map_err(|_| VolumeError::ManagerShutdown)?;
      rx.await.map_err(|_| VolumeError::ManagerShutdown)?
   }

   /// Ends any open session and stops the actor.
   pub async fn shutdown(&self) -> Result<()> {
      let (tx, rx) = oneshot::channel();
      self
         .inbox
         .send(ManagerCommand::Shutdown(tx))
         .await
         .map_err(|_| VolumeError::ManagerShutdown)?;
      rx.await.map_err(|_| VolumeError::ManagerShutdown)
   }
}

// === Manager Actor ===

struct ManagerActor {
   config: Config,
   command_rx: mpsc::Receiver<ManagerCommand>,
   loopback_rx: mpsc::Receiver<ManagerCommand>,
   loopback_tx: mpsc::Sender<ManagerCommand>,
   route_rx: mpsc::Receiver<RouteEvent>,
   session: Session,
   router: ConnectionRouter<BluezRoutes, VolumeDb>,

   // State
   adapters: HashMap<SmolStr, AdapterInfo>,
   devices: HashMap<Address, WatchedDevice>,
   ignored: HashSet<Address>, // Devices without an audio profile
}

impl ManagerActor {
   fn new(
      config: Config,
      event_tx: EventSender,
      command_rx: mpsc::Receiver<ManagerCommand>,
      session: Session,
      (routes, route_rx): (BluezRoutes, mpsc::Receiver<RouteEvent>),
      store: VolumeDb,
   ) -> Self {
      let tracker = Tracker::new(routes, store, TrackerOptions::from(&config));
      let router = ConnectionRouter::new(tracker, event_tx, config.clone());

      let (loopback_tx, loopback_rx) = mpsc::channel(CHANNEL_BUFFER_SIZE);
      Self {
         config,
         command_rx,
         loopback_rx,
         loopback_tx,
         route_rx,
         session,
         router,
         adapters: HashMap::new(),
         devices: HashMap::new(),
         ignored: HashSet::new(),
      }
   }

   async fn run(mut self) {
      info!("Bluetooth manager starting up");

      self.initialize_adapters().await;

      let mut health_check_interval = time::interval(self.config.health_check_interval());
      health_check_interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

      let mut adapter_check_interval = time::interval(ADAPTER_CHECK_INTERVAL);
      adapter_check_interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

      // Main event loop
      loop {
         select! {
             _ = health_check_interval.tick() => {
                 self.check_connection_health().await;
             }
             _ = adapter_check_interval.tick() => {
                 self.discover_new_adapters().await;
             }
             cmd = self.command_rx.recv() => {
                 let Some(cmd) = cmd else {
                     info!("Bluetooth manager shutting down");
                     break;
                 };
                 if !self.handle_command(cmd).await {
                     break;
                 }
             }
             Some(cmd) = self.loopback_rx.recv() => {
                 if !self.handle_command(cmd).await {
                     break;
                 }
             }
             Some(event) = self.route_rx.recv() => {
                 self.handle_route_event(event);
             }
         }
      }

      self.cleanup().await;
   }

   async fn initialize_adapters(&mut self) {
      match self.session.adapter_names().await {
         Ok(names) => {
            for name in names {
               self.initialize_adapter(name.into()).await;
            }
         },
         Err(e) => {
            error!("Failed to get adapter names: {e}");
         },
      }

      // If no adapters found, try default
      if self.adapters.is_empty() {
         self.initialize_adapter(SmolStr::new_static("hci0")).await;
      }
   }

   async fn initialize_adapter(&mut self, name: SmolStr) {
      match self.session.adapter(&name) {
         Ok(adapter) => {
            info!("Initializing adapter: {name}");

            self.adapters.insert(
               name.clone(),
               AdapterInfo {
                  state: AdapterState::Active,
                  monitor_handle: Some(Self::start_adapter_monitor(
                     self.loopback_tx.clone(),
                     name.clone(),
                     adapter.clone(),
                  )),
                  adapter,
                  retry_count: 0,
               },
            );

            self.check_known_devices(&name).await;
         },
         Err(e) => {
            warn!("Failed to initialize adapter {name}: {e}");
         },
      }
   }

   fn start_adapter_monitor(
      loopback: mpsc::Sender<ManagerCommand>,
      name: SmolStr,
      adapter: Adapter,
   ) -> JoinHandle<()> {
      tokio::spawn(async move {
         let Ok(mut events) = adapter.events().await else {
            if let Err(e) = loopback
               .send(ManagerCommand::AdapterError(
                  name.clone(),
                  "Failed to get adapter events".to_string(),
               ))
               .await
            {
               warn!("Channel overflow sending adapter error: {e}");
            }
            return;
         };

         while let Some(event) = events.next().await {
            match event {
               AdapterEvent::DeviceAdded(addr) => {
                  debug!("Device added on {name}: {addr}");
                  let _ = loopback
                     .send(ManagerCommand::DeviceDiscovered(addr, name.clone()))
                     .await;
               },
               AdapterEvent::DeviceRemoved(addr) => {
                  debug!("Device removed on {name}: {addr}");
                  let _ = loopback.send(ManagerCommand::DeviceLost(addr)).await;
               },
               _ => {},
            }
         }

         // If we exit the event loop, adapter is probably gone
         if let Err(e) = loopback.send(ManagerCommand::AdapterLost(name)).await {
            warn!("Channel overflow sending adapter lost: {e}");
         }
      })
   }

   /// Watches `Connected` on one device. Adapter events only report
   /// additions and removals.
   fn start_device_monitor(loopback: mpsc::Sender<ManagerCommand>, device: Device) -> JoinHandle<()> {
      tokio::spawn(async move {
         let addr = device.address();
         let Ok(mut events) = device.events().await else {
            warn!("Failed to get device events for {addr}");
            return;
         };

         while let Some(event) = events.next().await {
            let cmd = match event {
               DeviceEvent::PropertyChanged(DeviceProperty::Connected(true)) => {
                  ManagerCommand::DeviceConnected(addr)
               },
               DeviceEvent::PropertyChanged(DeviceProperty::Connected(false)) => {
                  ManagerCommand::DeviceDisconnected(addr)
               },
               _ => continue,
            };
            if loopback.send(cmd).await.is_err() {
               break;
            }
         }
      })
   }

   async fn check_known_devices(&self, adapter_name: &SmolStr) {
      let Some(adapter_info) = self.adapters.get(adapter_name) else {
         return;
      };

      let Ok(addresses) = adapter_info.adapter.device_addresses().await else {
         return;
      };

      for addr in addresses {
         if !self.devices.contains_key(&addr) {
            let _ = self
               .loopback_tx
               .send(ManagerCommand::DeviceDiscovered(addr, adapter_name.clone()))
               .await;
         }
      }
   }

   async fn handle_command(&mut self, cmd: ManagerCommand) -> bool {
      match cmd {
         ManagerCommand::AdapterAvailable(name, adapter) => {
            self.handle_adapter_available(name, adapter).await;
         },
         ManagerCommand::AdapterLost(name) => {
            self.handle_adapter_lost(name);
         },
         ManagerCommand::AdapterError(name, error) => {
            self.handle_adapter_error(&name, error);
         },
         ManagerCommand::DeviceDiscovered(addr, adapter_name) => {
            self.handle_device_discovered(addr, adapter_name).await;
         },
         ManagerCommand::DeviceConnected(addr) => {
            self.handle_device_connected(addr).await;
         },
         ManagerCommand::DeviceDisconnected(addr) => {
            self.handle_device_disconnected(addr).await;
         },
         ManagerCommand::DeviceLost(addr) => {
            self.handle_device_lost(addr).await;
         },
         ManagerCommand::GetActiveSession(reply) => {
            let _ = reply.send(self.router.active_session());
         },
         ManagerCommand::GetVolumes(reply) => {
            let _ = reply.send(self.router.tracker().store().entries());
         },
         ManagerCommand::Shutdown(reply) => {
            self.router.shutdown();
            let _ = reply.send(());
            return false;
         },
      }
      true
   }

   fn handle_route_event(&mut self, event: RouteEvent) {
      match event {
         RouteEvent::Added {
            route_type,
            address,
            name,
         } => {
            self.router.handle(ConnectionEvent {
               profile: profile::route_profile(route_type),
               state: ConnectionState::Connected,
               device: Some(DeviceInfo { name, address }),
            });
         },
         RouteEvent::VolumeChanged(route_type, volume) => {
            self.router.volume_changed(route_type, volume);
         },
      }
   }

   async fn handle_adapter_available(&mut self, name: SmolStr, adapter: Adapter) {
      info!("Adapter available: {name}");

      if let Some(info) = self.adapters.get_mut(&name) {
         info.adapter = adapter;
         info.state = AdapterState::Active;
         info.retry_count = 0;

         if info.monitor_handle.is_none() {
            info.monitor_handle = Some(Self::start_adapter_monitor(
               self.loopback_tx.clone(),
               name.clone(),
               info.adapter.clone(),
            ));
         }

         self.check_known_devices(&name).await;
      } else {
         self.initialize_adapter(name).await;
      }
   }

   fn handle_adapter_lost(&mut self, name: SmolStr) {
      warn!("Adapter lost: {name}");

      let Some(info) = self.adapters.get_mut(&name) else {
         return;
      };
      info.state = AdapterState::Lost;
      info.retry_count += 1;
      let delay = calc_retry_delay(info.retry_count);

      if let Some(handle) = info.monitor_handle.take() {
         handle.abort();
      }

      // Devices on a lost adapter are gone; close their sessions.
      let lost: Vec<Address> = self
         .devices
         .iter()
         .filter(|(_, d)| d.adapter_name == name)
         .map(|(addr, _)| *addr)
         .collect();
      for addr in lost {
         self.forget_device(addr, None);
      }

      // Schedule adapter recovery with exponential backoff
      let loopback = self.loopback_tx.clone();
      let session = self.session.clone();

      tokio::spawn(async move {
         time::sleep(delay).await;

         match session.adapter(&name) {
            Ok(adapter) => {
               let _ = loopback
                  .send(ManagerCommand::AdapterAvailable(name, adapter))
                  .await;
            },
            Err(e) => {
               let _ = loopback
                  .send(ManagerCommand::AdapterError(
                     name,
                     format!("Recovery failed: {e}"),
                  ))
                  .await;
            },
         }
      });
   }

   fn handle_adapter_error(&mut self, name: &SmolStr, error: String) {
      error!("Adapter error on {name}: {error}");

      if let Some(info) = self.adapters.get_mut(name) {
         info.state = AdapterState::Failed(error);
      }
   }

   async fn handle_device_discovered(&mut self, addr: Address, adapter_name: SmolStr) {
      if self.devices.contains_key(&addr) || self.ignored.contains(&addr) {
         return;
      }

      let Some(adapter_info) = self.adapters.get(&adapter_name) else {
         return;
      };
      let Ok(device) = adapter_info.adapter.device(addr) else {
         return;
      };

      let uuids = device.uuids().await.ok().flatten().unwrap_or_default();
      let Some(profile) = profile::classify_device(&uuids) else {
         debug!("Device {addr} has no audio profile");
         self.ignored.insert(addr);
         return;
      };

      let connected = device.is_connected().await.unwrap_or(false);
      info!("Watching {profile} device {addr} on {adapter_name}");

      self.devices.insert(
         addr,
         WatchedDevice {
            profile,
            connected: false,
            adapter_name,
            monitor_handle: Some(Self::start_device_monitor(
               self.loopback_tx.clone(),
               device,
            )),
         },
      );

      if connected {
         self.handle_device_connected(addr).await;
      }
   }

   async fn handle_device_connected(&mut self, addr: Address) {
      let Some(device) = self.devices.get_mut(&addr) else {
         return;
      };
      if device.connected {
         return;
      }
      device.connected = true;
      let profile = device.profile;
      let adapter_name = device.adapter_name.clone();
      let name = self.device_name(addr, &adapter_name).await;

      self.router.handle(ConnectionEvent {
         profile: Some(profile),
         state: ConnectionState::Connecting,
         device: Some(DeviceInfo::new(name, addr)),
      });
   }

   async fn handle_device_disconnected(&mut self, addr: Address) {
      let Some(device) = self.devices.get_mut(&addr) else {
         return;
      };
      if !device.connected {
         return;
      }
      device.connected = false;
      let profile = device.profile;
      let adapter_name = device.adapter_name.clone();
      let name = self.device_name(addr, &adapter_name).await;

      self.router.handle(ConnectionEvent {
         profile: Some(profile),
         state: ConnectionState::Disconnected,
         device: Some(DeviceInfo::new(name, addr)),
      });
   }

   async fn handle_device_lost(&mut self, addr: Address) {
      let adapter_name = self.devices.get(&addr).map(|d| d.adapter_name.clone());
      let name = match adapter_name {
         Some(adapter_name) => self.device_name(addr, &adapter_name).await,
         None => None,
      };
      self.forget_device(addr, name);
      self.ignored.remove(&addr);
   }

   /// Stops watching `addr`, reporting a disconnect if it was connected.
   fn forget_device(&mut self, addr: Address, name: Option<SmolStr>) {
      let Some(mut device) = self.devices.remove(&addr) else {
         return;
      };
      if let Some(handle) = device.monitor_handle.take() {
         handle.abort();
      }
      if device.connected {
         self.router.handle(ConnectionEvent {
            profile: Some(device.profile),
            state: ConnectionState::Disconnected,
            device: Some(DeviceInfo::new(name, addr)),
         });
      }
   }

   async fn device_name(&self, addr: Address, adapter_name: &SmolStr) -> Option<SmolStr> {
      let adapter_info = self.adapters.get(adapter_name)?;
      let device = adapter_info.adapter.device(addr).ok()?;
      match device.alias().await {
         Ok(alias) => Some(alias.into()),
         Err(_) => device.name().await.ok().flatten().map(SmolStr::from),
      }
   }

   async fn cleanup(&mut self) {
      use tokio::time::timeout;
      info!("Cleaning up Bluetooth manager");

      self.router.shutdown();

      for info in self.adapters.values_mut() {
         if let Some(handle) = info.monitor_handle.take() {
            handle.abort();
            let _ = timeout(Duration::from_secs(1), handle).await;
         }
      }

      for device in self.devices.values_mut() {
         if let Some(handle) = device.monitor_handle.take() {
            handle.abort();
         }
      }
   }

   async fn discover_new_adapters(&mut self) {
      match self.session.adapter_names().await {
         Ok(names) => {
            for name in names.into_iter().map(SmolStr::from) {
               if !self.adapters.contains_key(&name)
                  || matches!(
                     self.adapters.get(&name).map(|info| &info.state),
                     Some(AdapterState::Lost | AdapterState::Failed(_))
                  )
               {
                  self.initialize_adapter(name).await;
               }
            }
         },
         Err(e) => {
            warn!("Failed to poll adapter names: {e}. Retrying later.");
         },
      }
   }

   /// Catches connection changes the device monitors missed.
   async fn check_connection_health(&self) {
      for (addr, device) in &self.devices {
         if let Some(adapter_info) = self.adapters.get(&device.adapter_name)
            && adapter_info.state == AdapterState::Active
            && let Ok(bluer_device) = adapter_info.adapter.device(*addr)
         {
            let is_connected = bluer_device.is_connected().await.unwrap_or(false);

            match (device.connected, is_connected) {
               (true, false) => {
                  let _ = self
                     .loopback_tx
                     .send(ManagerCommand::DeviceDisconnected(*addr))
                     .await;
               },
               (false, true) => {
                  let _ = self
                     .loopback_tx
                     .send(ManagerCommand::DeviceConnected(*addr))
                     .await;
               },
               _ => {},
            }
         }
      }
   }
}

fn calc_retry_delay(retry_count: u32) -> Duration {
   let base_delay = Duration::from_secs(2);
   let exponential = base_delay * (1 << retry_count.min(4));
   let delay = exponential.min(MAX_RETRY_DELAY);
   let jitter = rand::thread_rng().gen_range(0..1000);
   delay + Duration::from_millis(jitter)
}
