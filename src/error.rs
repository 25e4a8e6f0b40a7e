//! Error types for the Bluetooth advertisement manager.
//!
//! Errors raised on the ingestion path never leave the manager; everything
//! here is surfaced from configuration, persistence, adapter queries and
//! connection establishment.

use bluer::Address;
use smol_str::SmolStr;
use thiserror::Error;

use crate::storage;

/// Main error type for the manager service.
#[derive(Error, Debug)]
pub enum BluetoothError {
   #[error("Bluetooth error: {0}")]
   Bluetooth(#[from] bluer::Error),

   #[error("D-Bus error: {0}")]
   DBus(#[from] zbus::Error),

   #[error("D-Bus connection error: {0}")]
   DBusConnection(#[from] zbus::fdo::Error),

   #[error("I/O error: {0}")]
   Io(#[from] std::io::Error),

   #[error("History storage error: {0}")]
   Storage(#[from] storage::Error),

   #[error(
      "No backend with an available connection slot that can reach address {0} was found"
   )]
   NoAvailableSlot(Address),

   #[error("Scanner not found: {0}")]
   ScannerNotFound(SmolStr),

   #[error("Scanner {0} cannot establish connections")]
   NotConnectable(SmolStr),

   #[error("Local name matcher is too broad: {0}")]
   MatcherTooBroad(SmolStr),

   #[error("Invalid local name pattern: {0}")]
   InvalidPattern(#[from] glob::PatternError),

   #[error("Invalid advertisement: {0}")]
   InvalidAdvertisement(String),

   #[error("JSON error: {0}")]
   Json(#[from] serde_json::Error),

   #[error("Hex decoding error: {0}")]
   Hex(#[from] hex::FromHexError),

   #[error("Could not determine config directory")]
   ConfigDirNotFound,

   #[error("TOML parsing error: {0}")]
   TomlParse(#[from] toml::de::Error),

   #[error("TOML serialization error: {0}")]
   TomlSerialize(#[from] toml::ser::Error),

   #[error("Manager has been shut down")]
   ManagerShutdown,

   #[error("No manager has been installed for the compatibility layer")]
   ManagerNotInstalled,

   #[error("Adapter not found: {0}")]
   AdapterNotFound(SmolStr),
}

/// Convenience type alias for Results with `BluetoothError`.
pub type Result<T> = std::result::Result<T, BluetoothError>;
