//! Bluetooth advertisement management.
//!
//! Scanners feed advertisements into a single [`manager::BluetoothManager`]
//! that merges them into one view per address, decides when a device has
//! gone away and fans updates out to subscribers.

pub mod local;
pub mod manager;
pub mod matcher;
pub mod models;
pub mod runtime;
pub mod scanner;
pub mod slots;
pub mod tracker;
pub mod wrappers;

#[cfg(test)]
pub(crate) mod testing;
