use log::debug;
use serde_json::json;
use zbus::{interface, object_server::SignalEmitter};

use crate::bluetooth::manager::BluetoothManager;

pub struct VolumeService {
   bluetooth_manager: BluetoothManager,
}

impl VolumeService {
   pub const fn new(bluetooth_manager: BluetoothManager) -> Self {
      Self { bluetooth_manager }
   }
}

#[interface(name = "org.btvolume.Manager")]
impl VolumeService {
   /// Remembered volume per record key, as a JSON array.
   async fn get_volumes(&self) -> zbus::fdo::Result<String> {
      let volumes: Vec<serde_json::Value> = self
         .bluetooth_manager
         .volumes()
         .await
         .map_err(|e| zbus::fdo::Error::Failed(e.to_string()))?
         .into_iter()
         .map(|(key, volume)| json!({ "key": key, "volume": volume }))
         .collect();
      serde_json::to_string(&volumes).map_err(|e| zbus::fdo::Error::Failed(e.to_string()))
   }

   /// The accessory being tracked, as JSON, or `null`.
   async fn get_active_session(&self) -> zbus::fdo::Result<String> {
      let session = self.bluetooth_manager.active_session().await;
      serde_json::to_string(&session).map_err(|e| zbus::fdo::Error::Failed(e.to_string()))
   }

   // Signals
   #[zbus(signal)]
   pub async fn session_started(
      emitter: &SignalEmitter<'_>,
      address: &str,
      label: &str,
   ) -> zbus::Result<()>;

   #[zbus(signal)]
   pub async fn session_ended(emitter: &SignalEmitter<'_>, address: &str) -> zbus::Result<()>;

   #[zbus(signal)]
   pub async fn volume_restored(
      emitter: &SignalEmitter<'_>,
      address: &str,
      level: u8,
   ) -> zbus::Result<()>;

   #[zbus(signal)]
   pub async fn volume_saved(emitter: &SignalEmitter<'_>, address: &str, level: u8)
   -> zbus::Result<()>;

   // Properties for polling-free updates
   #[zbus(property)]
   async fn active_label(&self) -> String {
      self
         .bluetooth_manager
         .active_session()
         .await
         .map(|s| s.label.to_string())
         .unwrap_or_default()
   }

   #[zbus(property)]
   async fn record_count(&self) -> u32 {
      match self.bluetooth_manager.volumes().await {
         Ok(volumes) => u32::try_from(volumes.len()).unwrap_or(u32::MAX),
         Err(e) => {
            debug!("Failed to count stored volumes: {e}");
            0
         },
      }
   }
}
