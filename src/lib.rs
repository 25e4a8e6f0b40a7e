//! Multiplexes Bluetooth LE advertisements from local and remote scanners.

pub mod bluetooth;
pub mod config;
pub mod dbus;
pub mod error;
pub mod event;
pub mod storage;
