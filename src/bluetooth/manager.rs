//! Core advertisement coordinator.
//!
//! This module arbitrates between scanners reporting the same device, keeps
//! the per-address history, drives unavailability detection, and fans every
//! accepted advertisement out to callbacks, bleak-style subscribers and
//! discovery flows. It is a plain state machine; [`super::runtime`] owns it
//! on a single task.

use std::{
   any::Any,
   collections::{HashMap, HashSet},
   panic::{self, AssertUnwindSafe},
   sync::Arc,
};

use bluer::Address;
use log::{Level, debug, error, info, log_enabled, warn};
use serde_json::json;
use smol_str::SmolStr;
use uuid::Uuid;

use crate::{
   bluetooth::{
      matcher::{
         AdvertisementCallback, BluetoothMatcher, CallbackEntry, CallbackId, CallbackIndex,
         IndexedMatcher, IntegrationEntry, IntegrationMatcher,
      },
      models::{
         AdvertisementData, BleDevice, ChangeKind, RSSI_SWITCH_THRESHOLD, ServiceInfo,
         monotonic_time, unix_time,
      },
      scanner::{BaseScanner, DiscoveredDeviceHistory, Scanner},
      slots::SlotManager,
      tracker::AdvertisementTracker,
   },
   error::{BluetoothError, Result},
   event::DiscoverySender,
};

/// Apple's company identifier.
pub const APPLE_MFR_ID: u16 = 76;
/// Apple payload sub-types worth processing: iBeacon, HomeKit, device id
/// and HomeKit encrypted notification.
pub const APPLE_START_BYTES_WANTED: [u8; 4] = [0x02, 0x06, 0x10, 0x11];

/// Called with the last record of a device that went away.
pub type UnavailableCallback = Arc<dyn Fn(&ServiceInfo) + Send + Sync>;
/// Called with the raw device and payload, bleak style.
pub type BleakCallback = Arc<dyn Fn(&Arc<BleDevice>, &Arc<AdvertisementData>) + Send + Sync>;

/// Filters requested by a bleak-style subscriber.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BleakFilter {
   /// Only deliver advertisements listing at least one of these UUIDs.
   pub service_uuids: Option<HashSet<Uuid>>,
}

impl BleakFilter {
   fn accepts(&self, adv: &AdvertisementData) -> bool {
      self
         .service_uuids
         .as_ref()
         .filter(|uuids| !uuids.is_empty())
         .is_none_or(|uuids| adv.service_uuids.iter().any(|u| uuids.contains(u)))
   }
}

struct BleakSubscriber {
   id: CallbackId,
   callback: BleakCallback,
   filter: BleakFilter,
}

type UnavailableCallbacks = HashMap<Address, Vec<(CallbackId, UnavailableCallback)>>;

/// Advertisement that only repeats Apple's continuity chatter.
fn is_apple_noise(info: &ServiceInfo) -> bool {
   let manufacturer_data = info.manufacturer_data();
   manufacturer_data.len() == 1
      && info.service_data().is_empty()
      && manufacturer_data
         .get(&APPLE_MFR_ID)
         .and_then(|data| data.first())
         .is_some_and(|byte| !APPLE_START_BYTES_WANTED.contains(byte))
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
   panic
      .downcast_ref::<&str>()
      .copied()
      .or_else(|| panic.downcast_ref::<String>().map(String::as_str))
      .unwrap_or("unknown panic")
}

/// Runs subscriber code so that a panic is logged instead of unwinding into
/// the ingestion path.
fn run_isolated(kind: &str, f: impl FnOnce()) {
   if let Err(panic) = panic::catch_unwind(AssertUnwindSafe(f)) {
      error!("Error in {kind} callback: {}", panic_message(panic.as_ref()));
   }
}

/// Multiplexes every scanner into a single view of nearby devices.
pub struct BluetoothManager {
   discovery: DiscoverySender,
   integration_matcher: IntegrationMatcher,
   tracker: AdvertisementTracker,
   slots: SlotManager,

   scanners: HashMap<SmolStr, Arc<dyn Scanner>>,
   all_history: HashMap<Address, ServiceInfo>,
   connectable_history: HashMap<Address, ServiceInfo>,

   callbacks: CallbackIndex,
   unavailable_callbacks: UnavailableCallbacks,
   connectable_unavailable_callbacks: UnavailableCallbacks,
   bleak_callbacks: Vec<BleakSubscriber>,
   next_callback_id: u64,

   /// Persisted scanner caches waiting for their scanner to register.
   pending_history: HashMap<SmolStr, DiscoveredDeviceHistory>,
   /// Wall clock minus monotonic clock when history was restored.
   clock_offset: f64,
}

impl BluetoothManager {
   pub fn new(discovery: DiscoverySender, integrations: Vec<IntegrationEntry>) -> Self {
      Self {
         discovery,
         integration_matcher: IntegrationMatcher::new(integrations),
         tracker: AdvertisementTracker::new(),
         slots: SlotManager::new(),
         scanners: HashMap::new(),
         all_history: HashMap::new(),
         connectable_history: HashMap::new(),
         callbacks: CallbackIndex::default(),
         unavailable_callbacks: HashMap::new(),
         connectable_unavailable_callbacks: HashMap::new(),
         bleak_callbacks: Vec::new(),
         next_callback_id: 0,
         pending_history: HashMap::new(),
         clock_offset: unix_time() - monotonic_time(),
      }
   }

   fn allocate_callback_id(&mut self) -> CallbackId {
      self.next_callback_id += 1;
      CallbackId(self.next_callback_id)
   }

   fn history(&self, connectable: bool) -> &HashMap<Address, ServiceInfo> {
      if connectable {
         &self.connectable_history
      } else {
         &self.all_history
      }
   }

   fn source_is_scanning(&self, source: &str) -> bool {
      self.scanners.get(source).is_some_and(|s| s.scanning())
   }

   // === Ingestion ===

   /// Ingests one advertisement from a scanner.
   pub fn scanner_adv_received(&mut self, info: ServiceInfo) {
      if is_apple_noise(&info) {
         return;
      }

      let address = info.address();
      let connectable = info.connectable();
      let source = info.source().clone();
      let old_info = self.all_history.get(&address).cloned();
      let old_connectable_info = self.connectable_history.get(&address).cloned();

      if let Some(old) = &old_info
         && old.source() != &source
         && self.source_is_scanning(old.source())
         && self.prefer_previous(old, &info)
      {
         if connectable {
            let keep_connectable = old_connectable_info.as_ref().is_some_and(|old_conn| {
               old_conn.is_same_record(old)
                  || (old_conn.source() != &source
                     && self.source_is_scanning(old_conn.source())
                     && self.prefer_previous(old_conn, &info))
            });
            if !keep_connectable {
               self.connectable_history.insert(address, info);
            }
         }
         return;
      }

      if connectable {
         self.connectable_history.insert(address, info.clone());
      }
      self.all_history.insert(address, info.clone());

      if let Some(old) = &old_info
         && old.source() != &source
         && log_enabled!(Level::Debug)
      {
         debug!(
            "{address}: switching from {} to {source} (rssi {} -> {})",
            old.source(),
            old.rssi(),
            info.rssi()
         );
      }

      if self
         .tracker
         .source(address)
         .is_some_and(|tracked| tracked != &source)
      {
         self.tracker.remove_address(address);
      }
      if self.tracker.interval(address).is_none() {
         self.tracker.collect(&info);
      }

      if !(connectable && old_connectable_info.is_none())
         && old_info.as_ref().is_some_and(|old| old.same_payload(&info))
      {
         return;
      }

      let info = if !connectable && old_connectable_info.is_some() {
         info.as_connectable()
      } else {
         info
      };
      self.dispatch(&info);
   }

   /// True when the previous record from another source should be kept
   /// over `new`.
   fn prefer_previous(&self, old: &ServiceInfo, new: &ServiceInfo) -> bool {
      let stale_window = self.tracker.stale_window(new.address());
      if new.time() - old.time() > stale_window {
         if log_enabled!(Level::Debug) {
            debug!(
               "{}: {} is stale after {:.1}s, preferring {}",
               new.address(),
               old.source(),
               new.time() - old.time(),
               new.source()
            );
         }
         return false;
      }
      new.effective_rssi() - RSSI_SWITCH_THRESHOLD <= old.effective_rssi()
   }

   fn dispatch(&mut self, info: &ServiceInfo) {
      let domains = self.integration_matcher.match_domains(info);

      for entry in self.callbacks.matching(info) {
         run_isolated("bluetooth", || (entry.callback)(info, ChangeKind::Advertisement));
      }

      for domain in &domains {
         debug!("{}: matched domain {domain}", info.address());
         run_isolated("discovery", || self.discovery.create_flow(domain, info));
      }

      if info.connectable() {
         for subscriber in &self.bleak_callbacks {
            dispatch_bleak(subscriber, info.device(), info.advertisement());
         }
      }
   }

   // === Unavailability ===

   pub fn check_unavailable(&mut self) {
      self.check_unavailable_at(monotonic_time());
   }

   /// Forgets devices no scanning scanner holds anymore.
   ///
   /// Connectable history is pruned as soon as a device leaves every
   /// connectable scanner. The full history additionally waits for the
   /// address's stale window to elapse.
   pub fn check_unavailable_at(&mut self, now: f64) {
      for connectable in [true, false] {
         let present: HashSet<Address> = self
            .scanners
            .values()
            .filter(|s| s.scanning() && (!connectable || s.connectable()))
            .flat_map(|s| s.discovered_addresses())
            .collect();
         let disappeared: Vec<Address> = self
            .history(connectable)
            .keys()
            .filter(|address| !present.contains(address))
            .copied()
            .collect();

         for address in disappeared {
            if !connectable {
               let Some(last) = self.all_history.get(&address) else {
                  continue;
               };
               if now - last.time() <= self.tracker.stale_window(address) {
                  continue;
               }
               self.tracker.remove_fallback_interval(address);
               self.tracker.remove_address(address);
               self.integration_matcher.clear_address(address);
               run_isolated("discovery", || self.discovery.dismiss_flows(address));
            }

            let removed = if connectable {
               self.connectable_history.remove(&address)
            } else {
               self.all_history.remove(&address)
            };
            let Some(info) = removed else {
               continue;
            };
            debug!(
               "{address}: unavailable ({})",
               if connectable { "connectable" } else { "all" }
            );

            let callbacks = if connectable {
               &self.connectable_unavailable_callbacks
            } else {
               &self.unavailable_callbacks
            };
            for (_, callback) in callbacks.get(&address).into_iter().flatten() {
               run_isolated("unavailable", || callback(&info));
            }
         }
      }
   }

   /// Invokes `callback` when `address` disappears from the chosen history.
   pub fn track_unavailable(
      &mut self,
      address: Address,
      connectable: bool,
      callback: UnavailableCallback,
   ) -> CallbackId {
      let id = self.allocate_callback_id();
      let callbacks = if connectable {
         &mut self.connectable_unavailable_callbacks
      } else {
         &mut self.unavailable_callbacks
      };
      callbacks.entry(address).or_default().push((id, callback));
      id
   }

   pub fn untrack_unavailable(&mut self, id: CallbackId) {
      for callbacks in [
         &mut self.unavailable_callbacks,
         &mut self.connectable_unavailable_callbacks,
      ] {
         callbacks.retain(|_, entries| {
            entries.retain(|(entry_id, _)| *entry_id != id);
            !entries.is_empty()
         });
      }
   }

   // === Scanners ===

   /// Adds a scanner. A scanner already registered under the same source is
   /// replaced.
   pub fn register_scanner(&mut self, scanner: Arc<dyn Scanner>, connection_slots: Option<usize>) {
      let source = scanner.source().clone();
      if let Some(history) = self.pending_history.remove(&source) {
         let now_mono = monotonic_time();
         scanner.restore_history(&history, now_mono, now_mono + self.clock_offset);
      }
      if let Some(slots) = connection_slots {
         self.slots.register_adapter(scanner.adapter().clone(), slots);
      }
      info!(
         "Registered scanner {} (connectable: {})",
         scanner.name(),
         scanner.connectable()
      );
      if self.scanners.insert(source.clone(), scanner).is_some() {
         warn!("Scanner {source} was already registered and has been replaced");
      }
   }

   /// Removes the scanner registered under `source`, returning it so its
   /// cache can be persisted. Unknown sources are ignored.
   pub fn unregister_scanner(&mut self, source: &str) -> Option<Arc<dyn Scanner>> {
      let scanner = self.scanners.remove(source)?;
      self.tracker.remove_source(source);
      let adapter = scanner.adapter();
      if !self.scanners.values().any(|s| s.adapter() == adapter) {
         self.slots.remove_adapter(adapter);
      }
      info!("Unregistered scanner {}", scanner.name());
      Some(scanner)
   }

   pub fn scanner_count(&self, connectable: bool) -> usize {
      if connectable {
         self.scanners.values().filter(|s| s.connectable()).count()
      } else {
         self.scanners.len()
      }
   }

   pub fn scanner_by_source(&self, source: &str) -> Option<Arc<dyn Scanner>> {
      self.scanners.get(source).cloned()
   }

   /// Every scanner currently holding `address`, with its own record.
   pub fn scanner_devices_by_address(
      &self,
      address: Address,
      connectable: bool,
   ) -> Vec<(Arc<dyn Scanner>, ServiceInfo)> {
      self
         .scanners
         .values()
         .filter(|s| !connectable || s.connectable())
         .filter_map(|s| s.discovered_device(address).map(|info| (s.clone(), info)))
         .collect()
   }

   pub fn expire_scanner_devices(&self, now: f64) {
      for scanner in self.scanners.values() {
         scanner.expire_devices(now);
      }
   }

   // === Callbacks ===

   /// Registers `callback` for advertisements accepted by `matcher`.
   ///
   /// Matching records already in history are replayed immediately.
   pub fn register_callback(
      &mut self,
      callback: AdvertisementCallback,
      matcher: Option<BluetoothMatcher>,
   ) -> Result<CallbackId> {
      let id = self.allocate_callback_id();
      let entry = CallbackEntry::new(id, callback, matcher.unwrap_or_default())?;
      let history = self.history(entry.matcher().requires_connectable());
      let replay: Vec<&ServiceInfo> = match entry.matcher().address {
         Some(address) => history.get(&address).into_iter().collect(),
         None => history.values().collect(),
      };
      for info in replay.into_iter().filter(|info| entry.compiled().matches(info)) {
         run_isolated("bluetooth", || (entry.callback)(info, ChangeKind::Advertisement));
      }
      self.callbacks.add(entry);
      Ok(id)
   }

   pub fn unregister_callback(&mut self, id: CallbackId) -> bool {
      self.callbacks.remove_where(|entry| entry.id == id).is_some()
   }

   /// Registers a bleak-style subscriber and replays connectable history.
   pub fn register_bleak_callback(&mut self, callback: BleakCallback, filter: BleakFilter) -> CallbackId {
      let id = self.allocate_callback_id();
      let subscriber = BleakSubscriber {
         id,
         callback,
         filter,
      };
      for info in self.connectable_history.values() {
         dispatch_bleak(&subscriber, info.device(), info.advertisement());
      }
      self.bleak_callbacks.push(subscriber);
      id
   }

   pub fn unregister_bleak_callback(&mut self, id: CallbackId) {
      self.bleak_callbacks.retain(|subscriber| subscriber.id != id);
   }

   // === Queries ===

   pub fn discovered_service_info(&self, connectable: bool) -> Vec<ServiceInfo> {
      self.history(connectable).values().cloned().collect()
   }

   pub fn last_service_info(&self, address: Address, connectable: bool) -> Option<ServiceInfo> {
      self.history(connectable).get(&address).cloned()
   }

   pub fn address_present(&self, address: Address, connectable: bool) -> bool {
      self.history(connectable).contains_key(&address)
   }

   pub fn ble_device_from_address(&self, address: Address, connectable: bool) -> Option<Arc<BleDevice>> {
      self
         .history(connectable)
         .get(&address)
         .map(|info| info.device().clone())
   }

   pub fn learned_advertising_interval(&self, address: Address) -> Option<f64> {
      self.tracker.interval(address)
   }

   pub fn fallback_availability_interval(&self, address: Address) -> Option<f64> {
      self.tracker.fallback_interval(address)
   }

   pub fn set_fallback_availability_interval(&mut self, address: Address, interval: f64) {
      self.tracker.set_fallback_interval(address, interval);
   }

   // === Discovery ===

   /// Forgets match history for `address` and re-runs discovery on its last
   /// record.
   pub fn rediscover_address(&mut self, address: Address) {
      self.integration_matcher.clear_address(address);
      let Some(info) = self.all_history.get(&address).cloned() else {
         return;
      };
      for domain in &self.integration_matcher.match_domains(&info) {
         run_isolated("discovery", || self.discovery.create_flow(domain, &info));
      }
   }

   // === Connections ===

   /// Picks the strongest scanning connectable scanner that can reach
   /// `address` and still has a free slot, reserving that slot.
   pub fn select_connection_backend(&mut self, address: Address) -> Result<Arc<dyn Scanner>> {
      let mut candidates: Vec<(i16, Arc<dyn Scanner>)> = self
         .scanners
         .values()
         .filter(|s| s.scanning() && s.connectable())
         .filter_map(|s| {
            s.discovered_device(address)
               .map(|info| (info.effective_rssi(), s.clone()))
         })
         .collect();
      candidates.sort_by(|a, b| b.0.cmp(&a.0));

      for (rssi, scanner) in candidates {
         if self.slots.allocate_slot(scanner.adapter(), address) {
            debug!("{address}: connecting through {} (rssi {rssi})", scanner.name());
            return Ok(scanner);
         }
      }
      Err(BluetoothError::NoAvailableSlot(address))
   }

   pub fn release_connection_slot(&mut self, adapter: &str, address: Address) {
      self.slots.release_slot(adapter, address);
   }

   pub fn free_connection_slots(&self, adapter: &str) -> Option<usize> {
      self.slots.free_slots(adapter)
   }

   // === Persistence ===

   /// Seeds history from persisted scanner caches. Each cache is also kept
   /// until its scanner registers so the scanner can restore it.
   pub fn restore_history(
      &mut self,
      histories: HashMap<SmolStr, DiscoveredDeviceHistory>,
      now_mono: f64,
      now_wall: f64,
   ) {
      self.clock_offset = now_wall - now_mono;
      for (source, history) in histories {
         let cache = BaseScanner::new(source.clone(), source.clone(), history.connectable);
         cache.restore(&history, now_mono, now_wall);
         let restored = cache.discovered_devices();
         debug!("Restored {} devices from {source}", restored.len());
         for info in restored {
            let address = info.address();
            let newer = |existing: Option<&ServiceInfo>| existing.is_none_or(|e| e.time() < info.time());
            if info.connectable() && newer(self.connectable_history.get(&address)) {
               self.connectable_history.insert(address, info.clone());
            }
            if newer(self.all_history.get(&address)) {
               self.all_history.insert(address, info);
            }
         }
         self.pending_history.insert(source, history);
      }
   }

   /// Persistable caches of every registered scanner, keyed by source.
   pub fn serialize_scanner_histories(
      &self,
      now_mono: f64,
      now_wall: f64,
   ) -> Vec<(SmolStr, DiscoveredDeviceHistory)> {
      self
         .scanners
         .iter()
         .filter_map(|(source, scanner)| {
            scanner
               .serialize_history(now_mono, now_wall)
               .map(|history| (source.clone(), history))
         })
         .collect()
   }

   // === Diagnostics ===

   pub fn diagnostics(&self) -> serde_json::Value {
      let history_json = |history: &HashMap<Address, ServiceInfo>| {
         history
            .iter()
            .map(|(address, info)| (address.to_string(), info.to_json()))
            .collect::<serde_json::Map<_, _>>()
      };
      json!({
         "scanners": self.scanners.values().map(|s| s.diagnostics()).collect::<Vec<_>>(),
         "slot_manager": self.slots.diagnostics(),
         "connectable_history": history_json(&self.connectable_history),
         "all_history": history_json(&self.all_history),
         "advertisement_tracker": self.tracker.diagnostics(),
         "callbacks": self.callbacks.len(),
         "bleak_callbacks": self.bleak_callbacks.len(),
      })
   }
}

fn dispatch_bleak(subscriber: &BleakSubscriber, device: &Arc<BleDevice>, adv: &Arc<AdvertisementData>) {
   if !subscriber.filter.accepts(adv) {
      return;
   }
   run_isolated("bleak", || (subscriber.callback)(device, adv));
}

#[cfg(test)]
mod tests {
   use std::sync::atomic::{AtomicUsize, Ordering};

   use parking_lot::Mutex;

   use super::*;
   use crate::bluetooth::{
      models::FALLBACK_MAXIMUM_STALE_ADVERTISEMENT_SECONDS,
      testing::{RecordingBus, TestScanner, addr, advertisement, service_info_at},
   };

   const ADDRESS: &str = "44:44:33:11:23:45";
   const SWITCHBOT_UUID: Uuid = Uuid::from_u128(0xcba20d00_224d_11e6_9fb8_0002a5d5c51b);

   fn manager() -> (BluetoothManager, Arc<RecordingBus>) {
      let bus = RecordingBus::new();
      (BluetoothManager::new(bus.clone(), Vec::new()), bus)
   }

   fn with_scanners(
      manager: &mut BluetoothManager,
      scanners: &[(&str, bool)],
   ) -> Vec<Arc<TestScanner>> {
      scanners
         .iter()
         .map(|(source, connectable)| {
            let scanner = TestScanner::new(source, source, *connectable);
            manager.register_scanner(scanner.clone(), None);
            scanner
         })
         .collect()
   }

   fn counting_callback() -> (AdvertisementCallback, Arc<Mutex<Vec<ServiceInfo>>>) {
      let seen = Arc::new(Mutex::new(Vec::new()));
      let sink = seen.clone();
      let callback: AdvertisementCallback = Arc::new(move |info: &ServiceInfo, _: ChangeKind| {
         sink.lock().push(info.clone());
      });
      (callback, seen)
   }

   fn source_of(manager: &BluetoothManager, connectable: bool) -> Option<SmolStr> {
      manager
         .last_service_info(addr(ADDRESS), connectable)
         .map(|info| info.source().clone())
   }

   #[test]
   fn test_apple_noise_is_dropped() {
      let (mut manager, _) = manager();
      let address = addr(ADDRESS);

      let mut noise = advertisement("phone", -60);
      noise.manufacturer_data.insert(APPLE_MFR_ID, vec![0x07, 0x19]);
      manager.scanner_adv_received(service_info_at(address, &noise, "hci0", true, 1.0));
      assert!(!manager.address_present(address, false));

      let mut ibeacon = advertisement("beacon", -60);
      ibeacon.manufacturer_data.insert(APPLE_MFR_ID, vec![0x02, 0x15]);
      manager.scanner_adv_received(service_info_at(address, &ibeacon, "hci0", true, 2.0));
      assert!(manager.address_present(address, false));

      let other = addr("44:44:33:11:23:46");
      let mut with_service_data = noise.clone();
      with_service_data.service_data.insert(SWITCHBOT_UUID, vec![0x01]);
      manager.scanner_adv_received(service_info_at(other, &with_service_data, "hci0", true, 3.0));
      assert!(manager.address_present(other, false));
   }

   #[test]
   fn test_identical_advertisement_is_suppressed() {
      let (mut manager, _) = manager();
      with_scanners(&mut manager, &[("hci0", true)]);
      let (callback, seen) = counting_callback();
      manager.register_callback(callback, None).unwrap();

      let adv = advertisement("wohand", -60);
      let first = service_info_at(addr(ADDRESS), &adv, "hci0", true, 1.0);
      manager.scanner_adv_received(first.clone());
      manager.scanner_adv_received(first.clone());

      assert_eq!(seen.lock().len(), 1);
      let stored = manager.last_service_info(addr(ADDRESS), true).unwrap();
      assert!(stored.is_same_record(&first));
   }

   #[test]
   fn test_switches_source_only_above_rssi_threshold() {
      let (mut manager, _) = manager();
      with_scanners(&mut manager, &[("hci0", false), ("hci1", false)]);
      let address = addr(ADDRESS);

      manager.scanner_adv_received(service_info_at(address, &advertisement("wohand", -60), "hci0", false, 1.0));
      manager.scanner_adv_received(service_info_at(address, &advertisement("wohand", -56), "hci1", false, 2.0));
      assert_eq!(source_of(&manager, false).as_deref(), Some("hci0"));

      manager.scanner_adv_received(service_info_at(address, &advertisement("wohand", -54), "hci1", false, 3.0));
      assert_eq!(source_of(&manager, false).as_deref(), Some("hci1"));
   }

   #[test]
   fn test_stale_source_is_replaced_regardless_of_rssi() {
      let (mut manager, _) = manager();
      with_scanners(&mut manager, &[("hci0", false), ("hci1", false)]);
      let address = addr(ADDRESS);

      manager.scanner_adv_received(service_info_at(address, &advertisement("wohand", -30), "hci0", false, 0.0));
      manager.scanner_adv_received(service_info_at(
         address,
         &advertisement("wohand", -90),
         "hci1",
         false,
         FALLBACK_MAXIMUM_STALE_ADVERTISEMENT_SECONDS + 1.0,
      ));
      assert_eq!(source_of(&manager, false).as_deref(), Some("hci1"));
   }

   #[test]
   fn test_learned_interval_shortens_stale_window() {
      let (mut manager, _) = manager();
      with_scanners(&mut manager, &[("hci0", false), ("hci1", false)]);
      let address = addr(ADDRESS);

      for i in 0..16 {
         let mut adv = advertisement("wohand", -30);
         adv.manufacturer_data.insert(1, vec![i]);
         manager.scanner_adv_received(service_info_at(address, &adv, "hci0", false, f64::from(i) * 2.0));
      }
      assert_eq!(manager.learned_advertising_interval(address), Some(2.0));

      // Last hci0 record at 30; 2s interval plus 5s wobble puts it past stale at 38.
      manager.scanner_adv_received(service_info_at(address, &advertisement("wohand", -90), "hci1", false, 36.0));
      assert_eq!(source_of(&manager, false).as_deref(), Some("hci0"));
      manager.scanner_adv_received(service_info_at(address, &advertisement("wohand", -90), "hci1", false, 38.0));
      assert_eq!(source_of(&manager, false).as_deref(), Some("hci1"));
   }

   #[test]
   fn test_switches_when_previous_scanner_stops() {
      let (mut manager, _) = manager();
      let scanners = with_scanners(&mut manager, &[("hci0", false), ("hci1", false)]);
      let address = addr(ADDRESS);

      manager.scanner_adv_received(service_info_at(address, &advertisement("wohand", -30), "hci0", false, 1.0));
      scanners[0].set_scanning(false);
      manager.scanner_adv_received(service_info_at(address, &advertisement("wohand", -90), "hci1", false, 2.0));
      assert_eq!(source_of(&manager, false).as_deref(), Some("hci1"));
   }

   #[test]
   fn test_rejected_connectable_still_enters_connectable_history() {
      let (mut manager, _) = manager();
      with_scanners(&mut manager, &[("proxy", false), ("hci0", true)]);
      let address = addr(ADDRESS);

      manager.scanner_adv_received(service_info_at(address, &advertisement("wohand", -40), "proxy", false, 1.0));
      manager.scanner_adv_received(service_info_at(address, &advertisement("wohand", -80), "hci0", true, 2.0));

      assert_eq!(source_of(&manager, false).as_deref(), Some("proxy"));
      assert_eq!(source_of(&manager, true).as_deref(), Some("hci0"));
   }

   #[test]
   fn test_preferred_connectable_record_survives_weaker_connectable() {
      let (mut manager, _) = manager();
      with_scanners(&mut manager, &[("proxy", false), ("hci0", true), ("hci1", true)]);
      let address = addr(ADDRESS);

      manager.scanner_adv_received(service_info_at(address, &advertisement("wohand", -40), "proxy", false, 1.0));
      manager.scanner_adv_received(service_info_at(address, &advertisement("wohand", -60), "hci0", true, 2.0));
      manager.scanner_adv_received(service_info_at(address, &advertisement("wohand", -70), "hci1", true, 3.0));
      assert_eq!(source_of(&manager, false).as_deref(), Some("proxy"));
      assert_eq!(source_of(&manager, true).as_deref(), Some("hci0"));

      // Strong enough to beat hci0 but not the proxy.
      manager.scanner_adv_received(service_info_at(address, &advertisement("wohand", -50), "hci1", true, 4.0));
      assert_eq!(source_of(&manager, false).as_deref(), Some("proxy"));
      assert_eq!(source_of(&manager, true).as_deref(), Some("hci1"));
   }

   #[test]
   fn test_connectable_switch_waits_for_wobble() {
      let (mut manager, _) = manager();
      with_scanners(&mut manager, &[("hci0", true), ("hci1", true)]);
      let address = addr(ADDRESS);

      manager.scanner_adv_received(service_info_at(address, &advertisement("wohand", -60), "hci0", true, 0.0));
      manager.set_fallback_availability_interval(address, 10.0);

      manager.scanner_adv_received(service_info_at(address, &advertisement("wohand", -99), "hci1", true, 11.0));
      assert_eq!(source_of(&manager, true).as_deref(), Some("hci0"));

      manager.scanner_adv_received(service_info_at(address, &advertisement("wohand", -99), "hci1", true, 16.0));
      assert_eq!(source_of(&manager, true).as_deref(), Some("hci1"));
   }

   #[test]
   fn test_non_connectable_is_promoted_when_connectable_known() {
      let (mut manager, _) = manager();
      with_scanners(&mut manager, &[("hci0", true), ("proxy", false)]);
      let address = addr(ADDRESS);
      let (callback, seen) = counting_callback();
      manager.register_callback(callback, None).unwrap();

      manager.scanner_adv_received(service_info_at(address, &advertisement("wohand", -80), "hci0", true, 1.0));
      let mut adv = advertisement("wohand", -40);
      adv.manufacturer_data.insert(1, vec![0x01]);
      manager.scanner_adv_received(service_info_at(address, &adv, "proxy", false, 2.0));

      let seen = seen.lock();
      assert_eq!(seen.len(), 2);
      assert!(seen[1].connectable());
      assert_eq!(seen[1].source(), "proxy");
      assert!(!manager.last_service_info(address, false).unwrap().connectable());
   }

   #[test]
   fn test_integration_discovery_and_bleak_filter() {
      let bus = RecordingBus::new();
      let integrations = vec![
         IntegrationEntry::new("switchbot", BluetoothMatcher::new().with_service_uuid(SWITCHBOT_UUID)).unwrap(),
      ];
      let mut manager = BluetoothManager::new(bus.clone(), integrations);
      with_scanners(&mut manager, &[("hci0", true)]);

      let delivered = Arc::new(AtomicUsize::new(0));
      let counter = delivered.clone();
      manager.register_bleak_callback(
         Arc::new(move |_: &Arc<BleDevice>, _: &Arc<AdvertisementData>| {
            counter.fetch_add(1, Ordering::SeqCst);
         }),
         BleakFilter {
            service_uuids: Some(HashSet::from([SWITCHBOT_UUID])),
         },
      );

      let address = addr(ADDRESS);
      manager.scanner_adv_received(service_info_at(address, &advertisement("other", -60), "hci0", true, 1.0));
      assert_eq!(delivered.load(Ordering::SeqCst), 0);

      let mut adv = advertisement("wohand", -60);
      adv.service_uuids = vec![SWITCHBOT_UUID];
      manager.scanner_adv_received(service_info_at(address, &adv, "hci0", true, 2.0));
      assert_eq!(delivered.load(Ordering::SeqCst), 1);
      assert_eq!(bus.flows(), [(SmolStr::new_static("switchbot"), address)]);

      manager.rediscover_address(address);
      assert_eq!(bus.flows().len(), 2);
   }

   #[test]
   fn test_panicking_callback_does_not_block_others() {
      let (mut manager, _) = manager();
      with_scanners(&mut manager, &[("hci0", true)]);
      manager
         .register_callback(Arc::new(|_: &ServiceInfo, _: ChangeKind| panic!("subscriber failure")), None)
         .unwrap();
      let (callback, seen) = counting_callback();
      manager.register_callback(callback, None).unwrap();

      manager.scanner_adv_received(service_info_at(addr(ADDRESS), &advertisement("wohand", -60), "hci0", true, 1.0));
      assert_eq!(seen.lock().len(), 1);
   }

   #[test]
   fn test_register_callback_replays_history() {
      let (mut manager, _) = manager();
      with_scanners(&mut manager, &[("hci0", true)]);
      let address = addr(ADDRESS);
      manager.scanner_adv_received(service_info_at(address, &advertisement("wohand", -60), "hci0", true, 1.0));

      let (callback, seen) = counting_callback();
      let id = manager
         .register_callback(callback, Some(BluetoothMatcher::new().with_address(address)))
         .unwrap();
      assert_eq!(seen.lock().len(), 1);

      let (other, other_seen) = counting_callback();
      manager
         .register_callback(
            other,
            Some(BluetoothMatcher::new().with_address(addr("11:22:33:44:55:66"))),
         )
         .unwrap();
      assert!(other_seen.lock().is_empty());

      assert!(manager.unregister_callback(id));
      assert!(!manager.unregister_callback(id));
   }

   #[test]
   fn test_broad_local_name_matcher_is_rejected() {
      let (mut manager, _) = manager();
      let (callback, _) = counting_callback();
      let result = manager.register_callback(callback, Some(BluetoothMatcher::new().with_local_name("w*")));
      assert!(matches!(result, Err(BluetoothError::MatcherTooBroad(_))));
   }

   #[test]
   fn test_unavailable_sweep_respects_grace_window() {
      let (mut manager, bus) = manager();
      let scanners = with_scanners(&mut manager, &[("proxy", false)]);
      let address = addr(ADDRESS);
      let adv = advertisement("sensor", -60);
      manager.scanner_adv_received(scanners[0].receive(address, &adv, 0.0));
      manager.set_fallback_availability_interval(address, 60.0);

      let calls = Arc::new(AtomicUsize::new(0));
      let counter = calls.clone();
      manager.track_unavailable(
         address,
         false,
         Arc::new(move |_: &ServiceInfo| {
            counter.fetch_add(1, Ordering::SeqCst);
         }),
      );

      scanners[0].forget(address);
      manager.check_unavailable_at(60.0);
      assert!(manager.address_present(address, false));
      assert_eq!(calls.load(Ordering::SeqCst), 0);

      manager.check_unavailable_at(66.0);
      assert!(!manager.address_present(address, false));
      assert_eq!(calls.load(Ordering::SeqCst), 1);
      assert_eq!(manager.fallback_availability_interval(address), None);
      assert_eq!(bus.dismissed(), [address]);

      manager.check_unavailable_at(1000.0);
      assert_eq!(calls.load(Ordering::SeqCst), 1);
   }

   #[test]
   fn test_connectable_history_swept_without_grace() {
      let (mut manager, _) = manager();
      let scanners = with_scanners(&mut manager, &[("hci0", true)]);
      let address = addr(ADDRESS);
      manager.scanner_adv_received(scanners[0].receive(address, &advertisement("lock", -60), 10.0));

      let calls = Arc::new(AtomicUsize::new(0));
      let counter = calls.clone();
      let id = manager.track_unavailable(
         address,
         true,
         Arc::new(move |_: &ServiceInfo| {
            counter.fetch_add(1, Ordering::SeqCst);
         }),
      );

      manager.check_unavailable_at(11.0);
      assert!(manager.address_present(address, true));

      scanners[0].forget(address);
      manager.check_unavailable_at(11.0);
      assert!(!manager.address_present(address, true));
      assert!(manager.address_present(address, false));
      assert_eq!(calls.load(Ordering::SeqCst), 1);

      manager.untrack_unavailable(id);
      manager.untrack_unavailable(id);
   }

   #[test]
   fn test_unregister_scanner_is_idempotent_and_purges_tracker() {
      let (mut manager, _) = manager();
      let scanners = with_scanners(&mut manager, &[("hci0", true)]);
      let address = addr(ADDRESS);
      manager.scanner_adv_received(scanners[0].receive(address, &advertisement("lock", -60), 1.0));
      assert_eq!(manager.scanner_count(true), 1);

      assert!(manager.unregister_scanner("hci0").is_some());
      assert!(manager.unregister_scanner("hci0").is_none());
      assert_eq!(manager.scanner_count(false), 0);
      assert!(manager.tracker.source(address).is_none());
   }

   #[test]
   fn test_duplicate_scanner_registration_replaces() {
      let (mut manager, _) = manager();
      with_scanners(&mut manager, &[("hci0", true)]);
      let replacement = TestScanner::new("hci0", "hci0", false);
      manager.register_scanner(replacement, None);

      assert_eq!(manager.scanner_count(false), 1);
      assert_eq!(manager.scanner_count(true), 0);
   }

   #[test]
   fn test_connection_backend_prefers_rssi_with_free_slot() {
      let (mut manager, _) = manager();
      let weak = TestScanner::new("aa", "hci0", true);
      let strong = TestScanner::new("bb", "hci1", true);
      manager.register_scanner(weak.clone(), Some(1));
      manager.register_scanner(strong.clone(), Some(1));
      let address = addr(ADDRESS);
      let other = addr("44:44:33:11:23:46");
      for scanner in [&weak, &strong] {
         let rssi = if Arc::ptr_eq(scanner, &weak) { -80 } else { -40 };
         scanner.receive(address, &advertisement("lock", rssi), 1.0);
         scanner.receive(other, &advertisement("lock", rssi), 1.0);
      }

      assert_eq!(manager.select_connection_backend(address).unwrap().source(), "bb");
      assert_eq!(manager.select_connection_backend(other).unwrap().source(), "aa");
      assert!(matches!(
         manager.select_connection_backend(addr("44:44:33:11:23:47")),
         Err(BluetoothError::NoAvailableSlot(_))
      ));

      let third = addr("44:44:33:11:23:48");
      weak.receive(third, &advertisement("lock", -80), 1.0);
      assert!(matches!(
         manager.select_connection_backend(third),
         Err(BluetoothError::NoAvailableSlot(a)) if a == third
      ));

      manager.release_connection_slot("hci1", address);
      assert_eq!(manager.free_connection_slots("hci1"), Some(1));
   }

   #[test]
   fn test_scanners_sharing_adapter_share_slots() {
      let (mut manager, _) = manager();
      let first = TestScanner::new("aa", "hci0", true);
      manager.register_scanner(first.clone(), Some(1));
      let address = addr(ADDRESS);
      let other = addr("44:44:33:11:23:46");
      first.receive(address, &advertisement("lock", -60), 1.0);
      assert_eq!(manager.select_connection_backend(address).unwrap().source(), "aa");

      let second = TestScanner::new("bb", "hci0", true);
      manager.register_scanner(second.clone(), Some(1));
      second.receive(other, &advertisement("lock", -60), 1.0);
      assert!(matches!(
         manager.select_connection_backend(other),
         Err(BluetoothError::NoAvailableSlot(_))
      ));

      manager.register_scanner(first.clone(), Some(1));
      assert_eq!(manager.free_connection_slots("hci0"), Some(0));

      manager.release_connection_slot("hci0", address);
      assert_eq!(manager.select_connection_backend(other).unwrap().source(), "bb");
   }

   #[test]
   fn test_zero_slot_backend_is_never_selected() {
      let (mut manager, _) = manager();
      let proxy = TestScanner::new("proxy", "proxy", true);
      manager.register_scanner(proxy.clone(), Some(0));
      let address = addr(ADDRESS);
      proxy.receive(address, &advertisement("lock", -40), 1.0);

      assert!(matches!(
         manager.select_connection_backend(address),
         Err(BluetoothError::NoAvailableSlot(a)) if a == address
      ));
   }

   #[test]
   fn test_history_restore_seeds_history_and_scanner() {
      let (mut original, _) = manager();
      let scanners = with_scanners(&mut original, &[("proxy", false)]);
      let address = addr(ADDRESS);
      original.scanner_adv_received(scanners[0].receive(address, &advertisement("sensor", -60), 100.0));
      let saved: HashMap<_, _> = original
         .serialize_scanner_histories(110.0, 5000.0)
         .into_iter()
         .collect();

      // Restarted 20s later on a fresh monotonic clock.
      let (mut restored, _) = manager();
      restored.restore_history(saved, 20.0, 5010.0);
      let info = restored.last_service_info(address, false).unwrap();
      assert_eq!(info.name(), "sensor");
      assert_eq!(info.time(), 0.0);
      assert!(!restored.address_present(address, true));

      let scanner = TestScanner::new("proxy", "proxy", false);
      restored.register_scanner(scanner.clone(), None);
      assert!(scanner.discovered_addresses().contains(&address));
   }

   #[test]
   fn test_scanner_devices_by_address() {
      let (mut manager, _) = manager();
      let scanners = with_scanners(&mut manager, &[("hci0", true), ("proxy", false)]);
      let address = addr(ADDRESS);
      scanners[0].receive(address, &advertisement("lock", -60), 1.0);
      scanners[1].receive(address, &advertisement("lock", -50), 1.0);

      assert_eq!(manager.scanner_devices_by_address(address, false).len(), 2);
      let connectable = manager.scanner_devices_by_address(address, true);
      assert_eq!(connectable.len(), 1);
      assert_eq!(connectable[0].0.source(), "hci0");
      assert!(manager.diagnostics()["scanners"].is_array());
   }
}
