//! Advertisement records shared by scanners, the manager and subscribers.
//!
//! A [`ServiceInfo`] is an immutable snapshot of one advertisement as seen by
//! one scanner. The heavy parts (device handle and raw payload) sit behind
//! `Arc` so a record can live in both history maps and be handed to any
//! number of subscribers without copying.

use std::{
   collections::HashMap,
   fmt,
   sync::{Arc, LazyLock},
   time::{Instant, SystemTime},
};

use bluer::Address;
use serde_json::json;
use smol_str::{SmolStr, ToSmolStr};
use uuid::Uuid;

/// Number of timestamps collected before an advertising interval is learned.
pub const ADVERTISING_TIMES_NEEDED: usize = 16;
/// Allowance for scanners that batch advertisements before reporting them.
pub const TRACKER_BUFFERING_WOBBLE_SECONDS: f64 = 5.0;
/// Staleness window used when no interval is known for an address.
pub const FALLBACK_MAXIMUM_STALE_ADVERTISEMENT_SECONDS: f64 = 60.0 * 15.0;
/// Cache expiry window for connectable scanners.
pub const CONNECTABLE_FALLBACK_MAXIMUM_STALE_ADVERTISEMENT_SECONDS: f64 = 195.0;
/// A new source must beat the current one by more than this many dBm.
pub const RSSI_SWITCH_THRESHOLD: i16 = 5;
/// RSSI used in comparisons when a scanner reports none.
pub const NO_RSSI_VALUE: i16 = -127;

static BASE_TIME: LazyLock<Instant> = LazyLock::new(Instant::now);

/// Seconds on the process-wide monotonic clock.
pub fn monotonic_time() -> f64 {
   BASE_TIME.elapsed().as_secs_f64()
}

/// Seconds since the Unix epoch.
pub fn unix_time() -> f64 {
   SystemTime::UNIX_EPOCH
      .elapsed()
      .map_or(0.0, |d| d.as_secs_f64())
}

/// Kind of change delivered to advertisement callbacks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display, strum::IntoStaticStr)]
pub enum ChangeKind {
   Advertisement,
}

/// Handle to a remote device as reported by one scanner.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BleDevice {
   pub address: Address,
   pub name: Option<SmolStr>,
}

impl BleDevice {
   pub fn new(address: Address, name: Option<SmolStr>) -> Self {
      Self { address, name }
   }
}

/// Raw advertisement payload.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct AdvertisementData {
   pub local_name: Option<SmolStr>,
   pub rssi: i16,
   pub tx_power: Option<i16>,
   pub manufacturer_data: HashMap<u16, Vec<u8>>,
   pub service_data: HashMap<Uuid, Vec<u8>>,
   pub service_uuids: Vec<Uuid>,
}

/// One observed advertisement, tagged with the scanner that produced it.
#[derive(Debug, Clone)]
pub struct ServiceInfo {
   device: Arc<BleDevice>,
   advertisement: Arc<AdvertisementData>,
   source: SmolStr,
   connectable: bool,
   time: f64,
}

impl ServiceInfo {
   pub fn new(
      device: Arc<BleDevice>,
      advertisement: Arc<AdvertisementData>,
      source: SmolStr,
      connectable: bool,
      time: f64,
   ) -> Self {
      Self {
         device,
         advertisement,
         source,
         connectable,
         time,
      }
   }

   /// Returns a copy of this record flagged as connectable.
   ///
   /// The original is left untouched since it may still be referenced by
   /// the history maps.
   #[must_use]
   pub fn as_connectable(&self) -> Self {
      Self {
         connectable: true,
         ..self.clone()
      }
   }

   pub fn address(&self) -> Address {
      self.device.address
   }

   /// Advertised local name, else the device name, else the address.
   pub fn name(&self) -> SmolStr {
      self
         .advertisement
         .local_name
         .as_ref()
         .or(self.device.name.as_ref())
         .cloned()
         .unwrap_or_else(|| self.device.address.to_smolstr())
   }

   pub fn rssi(&self) -> i16 {
      self.advertisement.rssi
   }

   /// RSSI for comparisons; scanners report 0 when they have no reading.
   pub fn effective_rssi(&self) -> i16 {
      match self.advertisement.rssi {
         0 => NO_RSSI_VALUE,
         rssi => rssi,
      }
   }

   pub fn manufacturer_data(&self) -> &HashMap<u16, Vec<u8>> {
      &self.advertisement.manufacturer_data
   }

   pub fn service_data(&self) -> &HashMap<Uuid, Vec<u8>> {
      &self.advertisement.service_data
   }

   pub fn service_uuids(&self) -> &[Uuid] {
      &self.advertisement.service_uuids
   }

   pub fn source(&self) -> &SmolStr {
      &self.source
   }

   pub const fn connectable(&self) -> bool {
      self.connectable
   }

   pub const fn time(&self) -> f64 {
      self.time
   }

   pub fn device(&self) -> &Arc<BleDevice> {
      &self.device
   }

   pub fn advertisement(&self) -> &Arc<AdvertisementData> {
      &self.advertisement
   }

   /// True when both records carry the same payload as far as subscribers
   /// are concerned.
   pub fn same_payload(&self, other: &Self) -> bool {
      self.manufacturer_data() == other.manufacturer_data()
         && self.service_data() == other.service_data()
         && self.service_uuids() == other.service_uuids()
         && self.name() == other.name()
   }

   /// True when `other` is this very record rather than an equal one.
   pub fn is_same_record(&self, other: &Self) -> bool {
      Arc::ptr_eq(&self.device, &other.device)
         && Arc::ptr_eq(&self.advertisement, &other.advertisement)
         && self.source == other.source
         && self.time == other.time
   }

   pub fn to_json(&self) -> serde_json::Value {
      json!({
         "address": self.address().to_string(),
         "name": self.name().as_str(),
         "rssi": self.rssi(),
         "tx_power": self.advertisement.tx_power,
         "source": self.source.as_str(),
         "connectable": self.connectable,
         "time": self.time,
         "manufacturer_data": self
            .manufacturer_data()
            .iter()
            .map(|(id, data)| (id.to_string(), hex::encode(data)))
            .collect::<HashMap<_, _>>(),
         "service_data": self
            .service_data()
            .iter()
            .map(|(uuid, data)| (uuid.to_string(), hex::encode(data)))
            .collect::<HashMap<_, _>>(),
         "service_uuids": self
            .service_uuids()
            .iter()
            .map(Uuid::to_string)
            .collect::<Vec<_>>(),
      })
   }
}

impl fmt::Display for ServiceInfo {
   fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
      write!(
         f,
         "{} ({}) rssi={} source={} connectable={}",
         self.name(),
         self.address(),
         self.rssi(),
         self.source,
         self.connectable
      )
   }
}

/// Serde helper storing an optional address as its `AA:BB:..` string form.
pub(crate) mod serde_address {
   use bluer::Address;
   use serde::{Deserialize, Deserializer, Serializer, de};

   pub fn serialize<S: Serializer>(address: &Option<Address>, s: S) -> Result<S::Ok, S::Error> {
      match address {
         Some(address) => s.serialize_some(&address.to_string()),
         None => s.serialize_none(),
      }
   }

   pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Address>, D::Error> {
      let Some(text) = Option::<String>::deserialize(d)? else {
         return Ok(None);
      };
      text.parse().map(Some).map_err(de::Error::custom)
   }
}
