//! Persistent scanner history using heed (LMDB).
//!
//! Each scanner's device cache is stored under its source id so a restart
//! does not forget devices that advertise rarely.

use std::{collections::HashMap, path::PathBuf, sync::Arc};

use heed::{
   Database, Env, EnvOpenOptions,
   types::{SerdeBincode, Str},
};
use log::debug;
use smol_str::SmolStr;
use thiserror::Error;

use crate::{bluetooth::scanner::DiscoveredDeviceHistory, error::Result};

/// Errors that can occur in history storage operations.
#[derive(Error, Debug)]
pub enum Error {
   #[error("Failed to create history directory: {0}")]
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

#[derive(Debug)]
struct Db {
   env: Env,
   /// Scanner source -> cached devices
   histories: Database<Str, SerdeBincode<DiscoveredDeviceHistory>>,
}

/// Thread-safe handle to the history database.
#[derive(Clone, Debug)]
pub struct HistoryStore {
   db: Arc<Db>,
}

impl HistoryStore {
   /// Opens the database at the default location.
   pub fn open_default() -> Result<Self> {
      Self::open(Self::db_path()?)
   }

   /// Opens or creates the database in directory `path`.
   pub fn open(path: PathBuf) -> Result<Self> {
      std::fs::create_dir_all(&path).map_err(Error::CreateDirectory)?;

      let env = unsafe {
         EnvOpenOptions::new()
            .map_size(64 * 1024 * 1024)
            .max_dbs(1)
            .open(&path)
            .map_err(Error::OpenEnvironment)?
      };

      let mut wtxn = env.write_txn().map_err(Error::Transaction)?;
      let histories = env
         .create_database(&mut wtxn, Some("histories"))
         .map_err(Error::DatabaseOperation)?;
      wtxn.commit().map_err(Error::Transaction)?;

      debug!("Opened history store at {}", path.display());
      Ok(Self {
         db: Arc::new(Db { env, histories }),
      })
   }

   fn db_path() -> Result<PathBuf> {
      if let Ok(path) = std::env::var("BLEMUX_HISTORY_DB_PATH") {
         return Ok(PathBuf::from(path));
      }

      // ~/.local/share/blemux/history.db
      let base = dirs::data_local_dir().ok_or(Error::DataDirectoryNotFound)?;
      Ok(base.join("blemux").join("history.db"))
   }

   pub fn load_all(&self) -> Result<HashMap<SmolStr, DiscoveredDeviceHistory>> {
      let rtxn = self.db.env.read_txn().map_err(Error::Transaction)?;
      let mut histories = HashMap::new();
      for entry in self
         .db
         .histories
         .iter(&rtxn)
         .map_err(Error::DatabaseOperation)?
      {
         let (source, history) = entry.map_err(Error::DatabaseOperation)?;
         histories.insert(SmolStr::new(source), history);
      }
      Ok(histories)
   }

   pub fn get(&self, source: &str) -> Result<Option<DiscoveredDeviceHistory>> {
      let rtxn = self.db.env.read_txn().map_err(Error::Transaction)?;
      Ok(
         self
            .db
            .histories
            .get(&rtxn, source)
            .map_err(Error::DatabaseOperation)?,
      )
   }

   pub fn set(&self, source: &str, history: &DiscoveredDeviceHistory) -> Result<()> {
      let mut wtxn = self.db.env.write_txn().map_err(Error::Transaction)?;
      self
         .db
         .histories
         .put(&mut wtxn, source, history)
         .map_err(Error::DatabaseOperation)?;
      wtxn.commit().map_err(Error::Transaction)?;
      Ok(())
   }

   pub fn remove(&self, source: &str) -> Result<bool> {
      let mut wtxn = self.db.env.write_txn().map_err(Error::Transaction)?;
      let removed = self
         .db
         .histories
         .delete(&mut wtxn, source)
         .map_err(Error::DatabaseOperation)?;
      wtxn.commit().map_err(Error::Transaction)?;
      Ok(removed)
   }
}
