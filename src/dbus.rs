use std::{collections::HashMap, str::FromStr, sync::Arc};

use bluer::{Address, Session};
use log::info;
use parking_lot::Mutex;
use serde::Deserialize;
use smol_str::SmolStr;
use uuid::Uuid;
use zbus::{interface, object_server::SignalEmitter};

use crate::{
   bluetooth::{
      local::discover_adapters,
      models::{AdvertisementData, monotonic_time},
      runtime::{ManagerHandle, Registration},
      scanner::{RawAdvertisement, RemoteScanner},
   },
   error::{BluetoothError, Result},
};

/// Object path the service is served at.
pub const MANAGER_PATH: &str = "/org/blemux/manager";

struct RemoteEntry {
   scanner: Arc<RemoteScanner>,
   registration: Registration,
}

pub struct BluetoothService {
   handle: ManagerHandle,
   session: Session,
   remotes: Mutex<HashMap<SmolStr, RemoteEntry>>,
}

impl BluetoothService {
   pub fn new(handle: ManagerHandle, session: Session) -> Self {
      Self {
         handle,
         session,
         remotes: Mutex::new(HashMap::new()),
      }
   }

   fn remote(&self, source: &str) -> zbus::fdo::Result<Arc<RemoteScanner>> {
      self
         .remotes
         .lock()
         .get(source)
         .map(|entry| entry.scanner.clone())
         .ok_or_else(|| zbus::fdo::Error::Failed(format!("Unknown remote scanner: {source}")))
   }
}

fn parse_address(address: &str) -> zbus::fdo::Result<Address> {
   Address::from_str(address).map_err(|e| zbus::fdo::Error::InvalidArgs(e.to_string()))
}

fn failed(e: BluetoothError) -> zbus::fdo::Error {
   zbus::fdo::Error::Failed(e.to_string())
}

#[interface(name = "org.blemux.Manager")]
impl BluetoothService {
   async fn get_diagnostics(&self) -> zbus::fdo::Result<String> {
      let diagnostics = self.handle.diagnostics().await.map_err(failed)?;
      Ok(diagnostics.to_string())
   }

   async fn get_discovered_devices(&self, connectable: bool) -> zbus::fdo::Result<String> {
      let devices: Vec<serde_json::Value> = self
         .handle
         .discovered_service_info(connectable)
         .await
         .iter()
         .map(|info| info.to_json())
         .collect();
      Ok(serde_json::Value::from(devices).to_string())
   }

   async fn get_service_info(&self, address: String, connectable: bool) -> zbus::fdo::Result<String> {
      let addr = parse_address(&address)?;
      let info = self
         .handle
         .last_service_info(addr, connectable)
         .await
         .ok_or_else(|| zbus::fdo::Error::Failed("Device not found".into()))?;
      Ok(info.to_json().to_string())
   }

   async fn get_adapters(&self) -> zbus::fdo::Result<String> {
      let adapters = discover_adapters(&self.session).await.map_err(failed)?;
      serde_json::to_string(&adapters).map_err(|e| zbus::fdo::Error::Failed(e.to_string()))
   }

   async fn scanner_count(&self, connectable: bool) -> u32 {
      self.handle.scanner_count(connectable).await as u32
   }

   async fn add_remote_scanner(
      &self,
      source: String,
      adapter: String,
      connectable: bool,
      connection_slots: u32,
   ) -> zbus::fdo::Result<bool> {
      let source = SmolStr::new(source);
      if self.remotes.lock().contains_key(&source) {
         return Err(zbus::fdo::Error::InvalidArgs(format!(
            "Remote scanner {source} is already registered"
         )));
      }

      let scanner = Arc::new(RemoteScanner::new(source.clone(), adapter, connectable));
      scanner.base().set_scanning(true);
      let slots = remote_connection_slots(connectable, connection_slots);
      let registration = self
         .handle
         .register_scanner(scanner.clone(), slots)
         .await
         .map_err(failed)?;

      info!("Remote scanner {source} added");
      self.remotes.lock().insert(
         source,
         RemoteEntry {
            scanner,
            registration,
         },
      );
      Ok(true)
   }

   async fn remove_remote_scanner(&self, source: String) -> zbus::fdo::Result<bool> {
      let Some(entry) = self.remotes.lock().remove(source.as_str()) else {
         return Ok(false);
      };
      entry.scanner.base().set_scanning(false);
      entry.registration.cancel().await;
      info!("Remote scanner {source} removed");
      Ok(true)
   }

   async fn set_remote_scanning(&self, source: String, scanning: bool) -> zbus::fdo::Result<bool> {
      self.remote(&source)?.base().set_scanning(scanning);
      Ok(true)
   }

   /// Feeds one advertisement heard by a remote scanner. See
   /// [`parse_remote_advertisement`] for the payload format.
   async fn remote_advertisement(&self, source: String, advertisement: String) -> zbus::fdo::Result<bool> {
      let scanner = self.remote(&source)?;
      let raw = parse_remote_advertisement(&advertisement)
         .map_err(|e| zbus::fdo::Error::InvalidArgs(e.to_string()))?;
      let info = scanner.base().on_advertisement(raw, monotonic_time());
      self.handle.advertisement(info).await.map_err(failed)?;
      Ok(true)
   }

   async fn rediscover_address(&self, address: String) -> zbus::fdo::Result<bool> {
      let addr = parse_address(&address)?;
      self.handle.rediscover_address(addr).await.map_err(failed)?;
      Ok(true)
   }

   async fn set_fallback_interval(&self, address: String, seconds: f64) -> zbus::fdo::Result<bool> {
      let addr = parse_address(&address)?;
      if !seconds.is_finite() || seconds <= 0.0 {
         return Err(zbus::fdo::Error::InvalidArgs(format!(
            "Invalid interval: {seconds}"
         )));
      }
      self
         .handle
         .call(move |manager| manager.set_fallback_availability_interval(addr, seconds))
         .await
         .map_err(failed)?;
      Ok(true)
   }

   // Signals
   #[zbus(signal)]
   pub async fn discovery_requested(
      emitter: &SignalEmitter<'_>,
      domain: &str,
      address: &str,
      service_info: &str,
   ) -> zbus::Result<()>;

   #[zbus(signal)]
   pub async fn discovery_dismissed(emitter: &SignalEmitter<'_>, address: &str) -> zbus::Result<()>;

   #[zbus(property)]
   async fn connectable_scanners(&self) -> u32 {
      self.handle.scanner_count(true).await as u32
   }
}

/// Slot limit for a remote scanner. Connectable proxies are always tracked,
/// so one reporting zero slots is never picked for a connection.
fn remote_connection_slots(connectable: bool, connection_slots: u32) -> Option<usize> {
   connectable.then_some(connection_slots as usize)
}

/// Advertisement as posted by a remote proxy. Payloads are hex strings;
/// manufacturer ids are decimal object keys.
#[derive(Debug, Deserialize)]
struct RemoteAdvertisement {
   address: String,
   #[serde(default)]
   name: Option<SmolStr>,
   #[serde(default)]
   local_name: Option<SmolStr>,
   rssi: i16,
   #[serde(default)]
   tx_power: Option<i16>,
   #[serde(default)]
   manufacturer_data: HashMap<u16, String>,
   #[serde(default)]
   service_data: HashMap<Uuid, String>,
   #[serde(default)]
   service_uuids: Vec<Uuid>,
}

/// Parses a remote advertisement, e.g.
///
/// ```json
/// {"address": "44:44:33:11:23:45", "rssi": -60, "local_name": "sensor",
///  "manufacturer_data": {"76": "0215aa"},
///  "service_data": {"0000fe95-0000-1000-8000-00805f9b34fb": "01"}}
/// ```
pub fn parse_remote_advertisement(json: &str) -> Result<RawAdvertisement> {
   let remote: RemoteAdvertisement = serde_json::from_str(json)?;
   let address = Address::from_str(&remote.address)
      .map_err(|e| BluetoothError::InvalidAdvertisement(format!("{}: {e}", remote.address)))?;

   let manufacturer_data = remote
      .manufacturer_data
      .into_iter()
      .map(|(id, data)| Ok((id, hex::decode(data)?)))
      .collect::<Result<_>>()?;
   let service_data = remote
      .service_data
      .into_iter()
      .map(|(uuid, data)| Ok((uuid, hex::decode(data)?)))
      .collect::<Result<_>>()?;

   Ok(RawAdvertisement {
      address,
      device_name: remote.name,
      advertisement: AdvertisementData {
         local_name: remote.local_name,
         rssi: remote.rssi,
         tx_power: remote.tx_power,
         manufacturer_data,
         service_data,
         service_uuids: remote.service_uuids,
      },
   })
}
