//! Scanner abstraction and the shared per-scanner device cache.
//!
//! Every source of advertisements (a local adapter or a remote proxy)
//! implements [`Scanner`]. [`BaseScanner`] keeps the latest merged record for
//! each address the scanner has heard and handles expiry and persistence.

use std::{
   collections::{HashMap, HashSet},
   sync::Arc,
};

use bluer::Address;
use futures::future::{self, BoxFuture};
use log::debug;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::json;
use smol_str::SmolStr;
use uuid::Uuid;

use crate::{
   bluetooth::models::{
      AdvertisementData, BleDevice, CONNECTABLE_FALLBACK_MAXIMUM_STALE_ADVERTISEMENT_SECONDS,
      FALLBACK_MAXIMUM_STALE_ADVERTISEMENT_SECONDS, ServiceInfo,
   },
   error::{BluetoothError, Result},
};

/// A source of advertisements.
pub trait Scanner: Send + Sync {
   /// Unique identifier of this scanner, usually the adapter address.
   fn source(&self) -> &SmolStr;

   /// Adapter name used for connection slot accounting.
   fn adapter(&self) -> &SmolStr;

   fn name(&self) -> SmolStr {
      smol_str::format_smolstr!("{} ({})", self.adapter(), self.source())
   }

   /// Whether this scanner can also establish connections.
   fn connectable(&self) -> bool;

   /// Whether this scanner is currently receiving advertisements.
   fn scanning(&self) -> bool;

   /// Addresses currently present in this scanner's cache.
   fn discovered_addresses(&self) -> HashSet<Address>;

   /// Latest record this scanner holds for `address`.
   fn discovered_device(&self, address: Address) -> Option<ServiceInfo>;

   fn discovered_devices(&self) -> Vec<ServiceInfo>;

   /// Drops cached records older than the scanner's expiry window.
   fn expire_devices(&self, _now: f64) {}

   /// Snapshot of the cache for persistence, if this scanner keeps one.
   fn serialize_history(&self, _now_mono: f64, _now_wall: f64) -> Option<DiscoveredDeviceHistory> {
      None
   }

   /// Reloads a persisted snapshot into the cache.
   fn restore_history(&self, _history: &DiscoveredDeviceHistory, _now_mono: f64, _now_wall: f64) {}

   fn diagnostics(&self) -> serde_json::Value;

   /// Opens a connection to `address` through this scanner.
   fn connect(&self, _address: Address) -> BoxFuture<'static, Result<()>> {
      Box::pin(future::ready(Err(BluetoothError::NotConnectable(
         self.source().clone(),
      ))))
   }

   fn disconnect(&self, _address: Address) -> BoxFuture<'static, Result<()>> {
      Box::pin(future::ready(Ok(())))
   }
}

/// Fields of one advertisement as delivered by a scanner backend.
#[derive(Debug, Clone, PartialEq)]
pub struct RawAdvertisement {
   pub address: Address,
   pub device_name: Option<SmolStr>,
   pub advertisement: AdvertisementData,
}

/// Persisted form of one cached record. Times are wall clock seconds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredAdvertisement {
   pub address: String,
   pub device_name: Option<String>,
   pub local_name: Option<String>,
   pub rssi: i16,
   pub tx_power: Option<i16>,
   pub manufacturer_data: Vec<(u16, Vec<u8>)>,
   pub service_data: Vec<(Uuid, Vec<u8>)>,
   pub service_uuids: Vec<Uuid>,
   pub time: f64,
}

/// Persisted cache of one scanner.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiscoveredDeviceHistory {
   pub connectable: bool,
   pub expire_seconds: f64,
   pub devices: Vec<StoredAdvertisement>,
}

#[derive(Debug, Default)]
struct BaseState {
   scanning: bool,
   devices: HashMap<Address, ServiceInfo>,
}

/// Device cache shared by all scanner implementations.
#[derive(Debug)]
pub struct BaseScanner {
   source: SmolStr,
   adapter: SmolStr,
   connectable: bool,
   expire_seconds: f64,
   state: Mutex<BaseState>,
}

impl BaseScanner {
   pub fn new(source: impl Into<SmolStr>, adapter: impl Into<SmolStr>, connectable: bool) -> Self {
      let expire_seconds = if connectable {
         CONNECTABLE_FALLBACK_MAXIMUM_STALE_ADVERTISEMENT_SECONDS
      } else {
         FALLBACK_MAXIMUM_STALE_ADVERTISEMENT_SECONDS
      };
      Self {
         source: source.into(),
         adapter: adapter.into(),
         connectable,
         expire_seconds,
         state: Mutex::new(BaseState {
            scanning: true,
            devices: HashMap::new(),
         }),
      }
   }

   pub const fn source(&self) -> &SmolStr {
      &self.source
   }

   pub const fn adapter(&self) -> &SmolStr {
      &self.adapter
   }

   pub const fn connectable(&self) -> bool {
      self.connectable
   }

   pub const fn expire_seconds(&self) -> f64 {
      self.expire_seconds
   }

   pub fn scanning(&self) -> bool {
      self.state.lock().scanning
   }

   pub fn set_scanning(&self, scanning: bool) {
      self.state.lock().scanning = scanning;
   }

   /// Merges `raw` into the cached record for its address and returns the
   /// record to hand to the manager.
   ///
   /// Partial advertisements accumulate: the longer name wins, UUIDs are
   /// unioned and data maps are overlaid.
   pub fn on_advertisement(&self, raw: RawAdvertisement, time: f64) -> ServiceInfo {
      let RawAdvertisement {
         address,
         device_name,
         mut advertisement,
      } = raw;

      let mut state = self.state.lock();
      let mut device_name = device_name;
      if let Some(previous) = state.devices.get(&address) {
         let prev_adv = previous.advertisement();
         if let Some(prev_name) = &prev_adv.local_name
            && advertisement
               .local_name
               .as_ref()
               .is_none_or(|name| name.len() < prev_name.len())
         {
            advertisement.local_name = Some(prev_name.clone());
         }
         if device_name.is_none() {
            device_name.clone_from(&previous.device().name);
         }

         let mut uuids = prev_adv.service_uuids.clone();
         for uuid in advertisement.service_uuids.drain(..) {
            if !uuids.contains(&uuid) {
               uuids.push(uuid);
            }
         }
         advertisement.service_uuids = uuids;

         let mut service_data = prev_adv.service_data.clone();
         service_data.extend(advertisement.service_data.drain());
         advertisement.service_data = service_data;

         let mut manufacturer_data = prev_adv.manufacturer_data.clone();
         manufacturer_data.extend(advertisement.manufacturer_data.drain());
         advertisement.manufacturer_data = manufacturer_data;

         if advertisement.tx_power.is_none() {
            advertisement.tx_power = prev_adv.tx_power;
         }
      }

      let info = ServiceInfo::new(
         Arc::new(BleDevice::new(address, device_name)),
         Arc::new(advertisement),
         self.source.clone(),
         self.connectable,
         time,
      );
      state.devices.insert(address, info.clone());
      info
   }

   pub fn remove_device(&self, address: Address) -> Option<ServiceInfo> {
      self.state.lock().devices.remove(&address)
   }

   pub fn clear(&self) {
      self.state.lock().devices.clear();
   }

   pub fn discovered_addresses(&self) -> HashSet<Address> {
      self.state.lock().devices.keys().copied().collect()
   }

   pub fn discovered_device(&self, address: Address) -> Option<ServiceInfo> {
      self.state.lock().devices.get(&address).cloned()
   }

   pub fn discovered_devices(&self) -> Vec<ServiceInfo> {
      self.state.lock().devices.values().cloned().collect()
   }

   pub fn expire_devices(&self, now: f64) {
      let mut state = self.state.lock();
      let before = state.devices.len();
      state
         .devices
         .retain(|_, info| now - info.time() <= self.expire_seconds);
      let expired = before - state.devices.len();
      if expired > 0 {
         debug!("{}: expired {expired} cached devices", self.source);
      }
   }

   pub fn serialize(&self, now_mono: f64, now_wall: f64) -> DiscoveredDeviceHistory {
      let state = self.state.lock();
      let devices = state
         .devices
         .values()
         .map(|info| {
            let adv = info.advertisement();
            StoredAdvertisement {
               address: info.address().to_string(),
               device_name: info.device().name.as_ref().map(ToString::to_string),
               local_name: adv.local_name.as_ref().map(ToString::to_string),
               rssi: adv.rssi,
               tx_power: adv.tx_power,
               manufacturer_data: adv
                  .manufacturer_data
                  .iter()
                  .map(|(id, data)| (*id, data.clone()))
                  .collect(),
               service_data: adv
                  .service_data
                  .iter()
                  .map(|(uuid, data)| (*uuid, data.clone()))
                  .collect(),
               service_uuids: adv.service_uuids.clone(),
               time: now_wall - (now_mono - info.time()),
            }
         })
         .collect();
      DiscoveredDeviceHistory {
         connectable: self.connectable,
         expire_seconds: self.expire_seconds,
         devices,
      }
   }

   /// Loads persisted records, translating wall clock times back onto the
   /// monotonic clock. Records already past expiry are skipped.
   pub fn restore(&self, history: &DiscoveredDeviceHistory, now_mono: f64, now_wall: f64) -> usize {
      let mut state = self.state.lock();
      let mut restored = 0;
      for stored in &history.devices {
         let Ok(address) = stored.address.parse::<Address>() else {
            debug!("{}: skipping stored device with bad address {}", self.source, stored.address);
            continue;
         };
         let time = now_mono - (now_wall - stored.time);
         if now_mono - time > self.expire_seconds {
            continue;
         }
         let advertisement = AdvertisementData {
            local_name: stored.local_name.as_deref().map(SmolStr::new),
            rssi: stored.rssi,
            tx_power: stored.tx_power,
            manufacturer_data: stored.manufacturer_data.iter().cloned().collect(),
            service_data: stored.service_data.iter().cloned().collect(),
            service_uuids: stored.service_uuids.clone(),
         };
         let info = ServiceInfo::new(
            Arc::new(BleDevice::new(address, stored.device_name.as_deref().map(SmolStr::new))),
            Arc::new(advertisement),
            self.source.clone(),
            self.connectable,
            time,
         );
         state.devices.insert(address, info);
         restored += 1;
      }
      restored
   }

   pub fn diagnostics(&self) -> serde_json::Value {
      let state = self.state.lock();
      json!({
         "source": self.source.as_str(),
         "adapter": self.adapter.as_str(),
         "connectable": self.connectable,
         "scanning": state.scanning,
         "expire_seconds": self.expire_seconds,
         "discovered_devices": state.devices.values().map(ServiceInfo::to_json).collect::<Vec<_>>(),
      })
   }
}

/// Scanner fed over the daemon's D-Bus interface by an external proxy.
#[derive(Debug)]
pub struct RemoteScanner {
   base: BaseScanner,
}

impl RemoteScanner {
   pub fn new(source: impl Into<SmolStr>, adapter: impl Into<SmolStr>, connectable: bool) -> Self {
      Self {
         base: BaseScanner::new(source, adapter, connectable),
      }
   }

   pub const fn base(&self) -> &BaseScanner {
      &self.base
   }
}

impl Scanner for RemoteScanner {
   fn source(&self) -> &SmolStr {
      self.base.source()
   }

   fn adapter(&self) -> &SmolStr {
      self.base.adapter()
   }

   fn connectable(&self) -> bool {
      self.base.connectable()
   }

   fn scanning(&self) -> bool {
      self.base.scanning()
   }

   fn discovered_addresses(&self) -> HashSet<Address> {
      self.base.discovered_addresses()
   }

   fn discovered_device(&self, address: Address) -> Option<ServiceInfo> {
      self.base.discovered_device(address)
   }

   fn discovered_devices(&self) -> Vec<ServiceInfo> {
      self.base.discovered_devices()
   }

   fn expire_devices(&self, now: f64) {
      self.base.expire_devices(now);
   }

   fn serialize_history(&self, now_mono: f64, now_wall: f64) -> Option<DiscoveredDeviceHistory> {
      Some(self.base.serialize(now_mono, now_wall))
   }

   fn restore_history(&self, history: &DiscoveredDeviceHistory, now_mono: f64, now_wall: f64) {
      let restored = self.base.restore(history, now_mono, now_wall);
      debug!("{}: restored {restored} devices", self.base.source());
   }

   fn diagnostics(&self) -> serde_json::Value {
      let mut diagnostics = self.base.diagnostics();
      diagnostics["type"] = json!("remote");
      diagnostics
   }
}
