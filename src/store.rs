//! Persistent volume store using heed (LMDB).
//!
//! Maps a record key (see [`AccessoryIdentity::record_key`]) to the last
//! volume level seen on that accessory. Every write commits its own
//! transaction, so a stored level survives the daemon being killed and
//! restarted between connections.
//!
//! [`AccessoryIdentity::record_key`]: crate::accessory::AccessoryIdentity::record_key

use std::{
   path::{Path, PathBuf},
   sync::Arc,
};

use heed::{
   Database, Env, EnvOpenOptions,
   types::{SerdeBincode, Str},
};
use thiserror::Error;

use crate::{audio::Volume, error::Result};

/// Errors that can occur in volume store operations.
#[derive(Error, Debug)]
pub enum Error {
   #[error("Failed to create volume store directory: {0}")]
   CreateDirectory(#[from] std::io::Error),

   #[error("Failed to open heed environment: {0}")]
   OpenEnvironment(heed::Error),

   #[error("Database transaction error: {0}")]
   Transaction(heed::Error),

   #[error("Database operation error: {0}")]
   DatabaseOperation(heed::Error),

   #[error("Could not find local data directory")]
   DataDirectoryNotFound,
}

/// Key-value persistence for remembered volume levels.
///
/// Last write wins; there is no versioning.
pub trait VolumeStore {
   fn get(&self, key: &str) -> Result<Option<Volume>>;

   fn set(&self, key: &str, volume: Volume) -> Result<()>;

   /// All stored records, ordered by key.
   fn entries(&self) -> Result<Vec<(String, Volume)>>;
}

#[derive(Debug)]
struct Db {
   env: Env,
   /// Record key -> volume
   volumes: Database<Str, SerdeBincode<Volume>>,
}

/// LMDB-backed [`VolumeStore`]. Cheaply cloneable.
#[derive(Clone, Debug)]
pub struct VolumeDb {
   db: Arc<Db>,
}

impl VolumeDb {
   /// Open or create the volume database at the default location.
   pub fn open() -> Result<Self> {
      Self::open_at(&Self::db_path()?)
   }

   /// Open or create the volume database in `path`.
   pub fn open_at(path: &Path) -> Result<Self> {
      std::fs::create_dir_all(path).map_err(Error::CreateDirectory)?;

      let env = unsafe {
         EnvOpenOptions::new()
            .map_size(1024 * 1024) // a few bytes per device
            .max_dbs(1)
            .open(path)
            .map_err(Error::OpenEnvironment)?
      };

      let mut wtxn = env.write_txn().map_err(Error::Transaction)?;

      let volumes = env
         .create_database(&mut wtxn, Some("volumes"))
         .map_err(Error::DatabaseOperation)?;

      wtxn.commit().map_err(Error::Transaction)?;

      Ok(Self {
         db: Arc::new(Db { env, volumes }),
      })
   }

   fn db_path() -> Result<PathBuf> {
      if let Ok(path) = std::env::var("BTVOLUME_DB_PATH") {
         return Ok(PathBuf::from(path));
      }

      // ~/.local/share/btvolumed/volumes.db
      let base = dirs::data_local_dir().ok_or(Error::DataDirectoryNotFound)?;
      Ok(base.join("btvolumed").join("volumes.db"))
   }
}

impl VolumeStore for VolumeDb {
   fn get(&self, key: &str) -> Result<Option<Volume>> {
      let rtxn = self.db.env.read_txn().map_err(Error::Transaction)?;
      let volume = self
         .db
         .volumes
         .get(&rtxn, key)
         .map_err(Error::DatabaseOperation)?;
      Ok(volume)
   }

   fn set(&self, key: &str, volume: Volume) -> Result<()> {
      let mut wtxn = self.db.env.write_txn().map_err(Error::Transaction)?;

      self
         .db
         .volumes
         .put(&mut wtxn, key, &volume)
         .map_err(Error::DatabaseOperation)?;

      wtxn.commit().map_err(Error::Transaction)?;

      Ok(())
   }

   fn entries(&self) -> Result<Vec<(String, Volume)>> {
      let rtxn = self.db.env.read_txn().map_err(Error::Transaction)?;

      let mut entries = Vec::new();
      for item in self.db.volumes.iter(&rtxn).map_err(Error::DatabaseOperation)? {
         let (key, volume) = item.map_err(Error::DatabaseOperation)?;
         entries.push((key.to_owned(), volume));
      }
      Ok(entries)
   }
}
