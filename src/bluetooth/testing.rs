//! Fabricated devices, advertisements and scanners for unit tests.

use std::{collections::HashSet, sync::Arc};

use bluer::Address;
use futures::future::{self, BoxFuture};
use parking_lot::Mutex;
use smol_str::SmolStr;

use crate::{
   bluetooth::{
      models::{AdvertisementData, BleDevice, ServiceInfo},
      scanner::{BaseScanner, DiscoveredDeviceHistory, RawAdvertisement, Scanner},
   },
   error::{BluetoothError, Result},
   event::{DiscoveryBus, DiscoveryEvent},
};

pub fn addr(text: &str) -> Address {
   text.parse().unwrap()
}

pub fn advertisement(local_name: &str, rssi: i16) -> AdvertisementData {
   AdvertisementData {
      local_name: Some(SmolStr::new(local_name)),
      rssi,
      ..Default::default()
   }
}

pub fn service_info_at(
   address: Address,
   adv: &AdvertisementData,
   source: &str,
   connectable: bool,
   time: f64,
) -> ServiceInfo {
   ServiceInfo::new(
      Arc::new(BleDevice::new(address, None)),
      Arc::new(adv.clone()),
      SmolStr::new(source),
      connectable,
      time,
   )
}

/// Discovery bus that remembers everything it was asked to do.
#[derive(Default)]
pub struct RecordingBus {
   events: Mutex<Vec<DiscoveryEvent>>,
}

impl RecordingBus {
   pub fn new() -> Arc<Self> {
      Arc::new(Self::default())
   }

   pub fn flows(&self) -> Vec<(SmolStr, Address)> {
      self
         .events
         .lock()
         .iter()
         .filter_map(|event| match event {
            DiscoveryEvent::FlowRequested { domain, info } => Some((domain.clone(), info.address())),
            DiscoveryEvent::FlowsDismissed(_) => None,
         })
         .collect()
   }

   pub fn dismissed(&self) -> Vec<Address> {
      self
         .events
         .lock()
         .iter()
         .filter_map(|event| match event {
            DiscoveryEvent::FlowsDismissed(address) => Some(*address),
            DiscoveryEvent::FlowRequested { .. } => None,
         })
         .collect()
   }
}

impl DiscoveryBus for RecordingBus {
   fn create_flow(&self, domain: &SmolStr, info: &ServiceInfo) {
      self.events.lock().push(DiscoveryEvent::FlowRequested {
         domain: domain.clone(),
         info: info.clone(),
      });
   }

   fn dismiss_flows(&self, address: Address) {
      self.events.lock().push(DiscoveryEvent::FlowsDismissed(address));
   }
}

/// Scanner whose cache is filled by the test and whose connections always
/// succeed unless told otherwise.
pub struct TestScanner {
   base: BaseScanner,
   fail_connect: bool,
   connects: Arc<Mutex<Vec<Address>>>,
}

impl TestScanner {
   pub fn new(source: &str, adapter: &str, connectable: bool) -> Arc<Self> {
      Arc::new(Self {
         base: BaseScanner::new(source, adapter, connectable),
         fail_connect: false,
         connects: Arc::default(),
      })
   }

   pub fn failing(source: &str, adapter: &str) -> Arc<Self> {
      Arc::new(Self {
         base: BaseScanner::new(source, adapter, true),
         fail_connect: true,
         connects: Arc::default(),
      })
   }

   /// Caches `adv` for `address` and returns the record the scanner would
   /// hand to the manager.
   pub fn receive(&self, address: Address, adv: &AdvertisementData, time: f64) -> ServiceInfo {
      self.base.on_advertisement(
         RawAdvertisement {
            address,
            device_name: None,
            advertisement: adv.clone(),
         },
         time,
      )
   }

   pub fn forget(&self, address: Address) {
      self.base.remove_device(address);
   }

   pub fn set_scanning(&self, scanning: bool) {
      self.base.set_scanning(scanning);
   }

   pub fn connects(&self) -> Vec<Address> {
      self.connects.lock().clone()
   }
}

impl Scanner for TestScanner {
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
      self.base.restore(history, now_mono, now_wall);
   }

   fn diagnostics(&self) -> serde_json::Value {
      self.base.diagnostics()
   }

   fn connect(&self, address: Address) -> BoxFuture<'static, Result<()>> {
      if self.fail_connect {
         return Box::pin(future::ready(Err(BluetoothError::NotConnectable(
            self.base.source().clone(),
         ))));
      }
      self.connects.lock().push(address);
      Box::pin(future::ready(Ok(())))
   }
}
