//! Single-task owner of the [`BluetoothManager`].
//!
//! Scanners and subscribers live on other tasks and reach the manager only
//! through a [`ManagerHandle`], so every advertisement is processed in arrival
//! order and no two updates for one address ever race.

use std::{collections::HashMap, sync::Arc, time::Duration};

use bluer::Address;
use log::{debug, error, info, warn};
use smol_str::SmolStr;
use tokio::{
   select,
   sync::{mpsc, oneshot},
   task::JoinHandle,
   time::{self, MissedTickBehavior},
};

use crate::{
   bluetooth::{
      manager::{BleakCallback, BleakFilter, BluetoothManager, UnavailableCallback},
      matcher::{AdvertisementCallback, BluetoothMatcher, CallbackId},
      models::{BleDevice, ServiceInfo, monotonic_time, unix_time},
      scanner::Scanner,
   },
   error::{BluetoothError, Result},
   storage::HistoryStore,
};

/// Default period of the unavailability sweep.
pub const UNAVAILABLE_TRACK_SECONDS: Duration = Duration::from_secs(60 * 5);
/// Period of the scanner cache expiry.
pub const SCANNER_EXPIRE_INTERVAL: Duration = Duration::from_secs(30);
/// Channel buffer size
const CHANNEL_BUFFER_SIZE: usize = 1000;

type ManagerCall = Box<dyn FnOnce(&mut BluetoothManager) + Send>;

// === Commands ===

enum ManagerCommand {
   Advertisement(ServiceInfo),
   RegisterScanner(Arc<dyn Scanner>, Option<usize>),
   UnregisterScanner(SmolStr),
   Call(ManagerCall),
   Shutdown(oneshot::Sender<()>),
}

/// Timer settings for the actor.
#[derive(Debug, Clone, Copy)]
pub struct RuntimeSettings {
   pub unavailable_check_interval: Duration,
   pub expire_interval: Duration,
}

impl Default for RuntimeSettings {
   fn default() -> Self {
      Self {
         unavailable_check_interval: UNAVAILABLE_TRACK_SECONDS,
         expire_interval: SCANNER_EXPIRE_INTERVAL,
      }
   }
}

// === Handle ===

/// Cloneable handle to the manager task.
#[derive(Clone)]
pub struct ManagerHandle {
   inbox: mpsc::Sender<ManagerCommand>,
}

impl ManagerHandle {
   /// Moves `manager` onto its own task.
   pub fn spawn(
      manager: BluetoothManager,
      store: Option<HistoryStore>,
      settings: RuntimeSettings,
   ) -> (Self, JoinHandle<()>) {
      let (command_tx, command_rx) = mpsc::channel(CHANNEL_BUFFER_SIZE);
      let actor = ManagerActor {
         manager,
         command_rx,
         store,
         settings,
      };
      (Self { inbox: command_tx }, tokio::spawn(actor.run()))
   }

   async fn send(&self, command: ManagerCommand) -> Result<()> {
      self
         .inbox
         .send(command)
         .await
         .map_err(|_| BluetoothError::ManagerShutdown)
   }

   /// Runs `f` on the manager task and returns its result.
   pub async fn call<R, F>(&self, f: F) -> Result<R>
   where
      R: Send + 'static,
      F: FnOnce(&mut BluetoothManager) -> R + Send + 'static,
   {
      let (tx, rx) = oneshot::channel();
      self
         .send(ManagerCommand::Call(Box::new(move |manager| {
            let _ = tx.send(f(manager));
         })))
         .await?;
      rx.await.map_err(|_| BluetoothError::ManagerShutdown)
   }

   /// Delivers one advertisement from a scanner.
   pub async fn advertisement(&self, info: ServiceInfo) -> Result<()> {
      self.send(ManagerCommand::Advertisement(info)).await
   }

   /// Same as [`Self::advertisement`] for callers outside async context.
   /// Advertisements are dropped while the inbox is full.
   pub fn try_advertisement(&self, info: ServiceInfo) -> Result<()> {
      match self.inbox.try_send(ManagerCommand::Advertisement(info)) {
         Ok(()) => Ok(()),
         Err(mpsc::error::TrySendError::Full(_)) => {
            debug!("Manager inbox full, dropping advertisement");
            Ok(())
         },
         Err(mpsc::error::TrySendError::Closed(_)) => Err(BluetoothError::ManagerShutdown),
      }
   }

   pub async fn register_scanner(
      &self,
      scanner: Arc<dyn Scanner>,
      connection_slots: Option<usize>,
   ) -> Result<Registration> {
      let source = scanner.source().clone();
      self
         .send(ManagerCommand::RegisterScanner(scanner, connection_slots))
         .await?;
      Ok(self.registration(RegistrationKind::Scanner(source)))
   }

   pub async fn unregister_scanner(&self, source: SmolStr) -> Result<()> {
      self.send(ManagerCommand::UnregisterScanner(source)).await
   }

   pub async fn register_callback(
      &self,
      callback: AdvertisementCallback,
      matcher: Option<BluetoothMatcher>,
   ) -> Result<Registration> {
      let id = self
         .call(move |manager| manager.register_callback(callback, matcher))
         .await??;
      Ok(self.registration(RegistrationKind::Callback(id)))
   }

   pub async fn track_unavailable(
      &self,
      address: Address,
      connectable: bool,
      callback: UnavailableCallback,
   ) -> Result<Registration> {
      let id = self
         .call(move |manager| manager.track_unavailable(address, connectable, callback))
         .await?;
      Ok(self.registration(RegistrationKind::Unavailable(id)))
   }

   pub async fn register_bleak_callback(
      &self,
      callback: BleakCallback,
      filter: BleakFilter,
   ) -> Result<Registration> {
      let id = self
         .call(move |manager| manager.register_bleak_callback(callback, filter))
         .await?;
      Ok(self.registration(RegistrationKind::Bleak(id)))
   }

   fn registration(&self, kind: RegistrationKind) -> Registration {
      Registration {
         handle: self.clone(),
         kind,
      }
   }

   pub async fn discovered_service_info(&self, connectable: bool) -> Vec<ServiceInfo> {
      self
         .call(move |manager| manager.discovered_service_info(connectable))
         .await
         .unwrap_or_default()
   }

   pub async fn last_service_info(&self, address: Address, connectable: bool) -> Option<ServiceInfo> {
      self
         .call(move |manager| manager.last_service_info(address, connectable))
         .await
         .ok()
         .flatten()
   }

   pub async fn address_present(&self, address: Address, connectable: bool) -> bool {
      self
         .call(move |manager| manager.address_present(address, connectable))
         .await
         .unwrap_or(false)
   }

   pub async fn ble_device_from_address(
      &self,
      address: Address,
      connectable: bool,
   ) -> Option<Arc<BleDevice>> {
      self
         .call(move |manager| manager.ble_device_from_address(address, connectable))
         .await
         .ok()
         .flatten()
   }

   pub async fn scanner_count(&self, connectable: bool) -> usize {
      self
         .call(move |manager| manager.scanner_count(connectable))
         .await
         .unwrap_or_default()
   }

   pub async fn scanner_by_source(&self, source: SmolStr) -> Option<Arc<dyn Scanner>> {
      self
         .call(move |manager| manager.scanner_by_source(&source))
         .await
         .ok()
         .flatten()
   }

   pub async fn rediscover_address(&self, address: Address) -> Result<()> {
      self
         .call(move |manager| manager.rediscover_address(address))
         .await
   }

   pub async fn select_connection_backend(&self, address: Address) -> Result<Arc<dyn Scanner>> {
      self
         .call(move |manager| manager.select_connection_backend(address))
         .await?
   }

   pub async fn release_connection_slot(&self, adapter: SmolStr, address: Address) -> Result<()> {
      self
         .call(move |manager| manager.release_connection_slot(&adapter, address))
         .await
   }

   pub async fn diagnostics(&self) -> Result<serde_json::Value> {
      self.call(|manager| manager.diagnostics()).await
   }

   /// Stops the manager task after persisting scanner history.
   pub async fn shutdown(&self) -> Result<()> {
      let (tx, rx) = oneshot::channel();
      self.send(ManagerCommand::Shutdown(tx)).await?;
      rx.await.map_err(|_| BluetoothError::ManagerShutdown)
   }
}

// === Registrations ===

#[derive(Debug, Clone)]
enum RegistrationKind {
   Scanner(SmolStr),
   Callback(CallbackId),
   Unavailable(CallbackId),
   Bleak(CallbackId),
}

/// Undo token returned by every registration.
///
/// Dropping it leaves the registration in place; call [`Self::cancel`] or
/// [`Self::cancel_detached`] to remove it.
pub struct Registration {
   handle: ManagerHandle,
   kind: RegistrationKind,
}

impl Registration {
   fn into_command(self) -> (ManagerHandle, ManagerCommand) {
      let command = match self.kind {
         RegistrationKind::Scanner(source) => ManagerCommand::UnregisterScanner(source),
         RegistrationKind::Callback(id) => ManagerCommand::Call(Box::new(move |manager| {
            manager.unregister_callback(id);
         })),
         RegistrationKind::Unavailable(id) => {
            ManagerCommand::Call(Box::new(move |manager| manager.untrack_unavailable(id)))
         },
         RegistrationKind::Bleak(id) => {
            ManagerCommand::Call(Box::new(move |manager| manager.unregister_bleak_callback(id)))
         },
      };
      (self.handle, command)
   }

   /// Removes the registration. Does nothing once the manager has stopped.
   pub async fn cancel(self) {
      let (handle, command) = self.into_command();
      if handle.send(command).await.is_err() {
         debug!("Manager already stopped, ignoring cancellation");
      }
   }

   /// Same as [`Self::cancel`] for callers outside async context, such as
   /// `Drop` impls.
   pub fn cancel_detached(self) {
      let (handle, command) = self.into_command();
      match handle.inbox.try_send(command) {
         Ok(()) => {},
         Err(mpsc::error::TrySendError::Full(_)) => {
            warn!("Manager inbox full, registration left in place");
         },
         Err(mpsc::error::TrySendError::Closed(_)) => {
            debug!("Manager already stopped, ignoring cancellation");
         },
      }
   }
}

// === Actor ===

struct ManagerActor {
   manager: BluetoothManager,
   command_rx: mpsc::Receiver<ManagerCommand>,
   store: Option<HistoryStore>,
   settings: RuntimeSettings,
}

impl ManagerActor {
   async fn run(mut self) {
      info!("Bluetooth manager starting up");
      self.load_history();

      let mut unavailable_interval = time::interval(self.settings.unavailable_check_interval);
      unavailable_interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

      let mut expire_interval = time::interval(self.settings.expire_interval);
      expire_interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

      // Main event loop
      loop {
         select! {
            _ = unavailable_interval.tick() => {
               self.manager.check_unavailable();
            }
            _ = expire_interval.tick() => {
               self.manager.expire_scanner_devices(monotonic_time());
            }
            cmd = self.command_rx.recv() => {
               let Some(cmd) = cmd else {
                  info!("Bluetooth manager shutting down");
                  self.save_all_history();
                  break;
               };
               if !self.handle_command(cmd) {
                  break;
               }
            }
         }
      }
   }

   fn handle_command(&mut self, cmd: ManagerCommand) -> bool {
      match cmd {
         ManagerCommand::Advertisement(info) => {
            self.manager.scanner_adv_received(info);
         },
         ManagerCommand::RegisterScanner(scanner, slots) => {
            self.manager.register_scanner(scanner, slots);
         },
         ManagerCommand::UnregisterScanner(source) => {
            if let Some(scanner) = self.manager.unregister_scanner(&source) {
               self.save_history(&source, scanner.as_ref());
            }
         },
         ManagerCommand::Call(f) => f(&mut self.manager),
         ManagerCommand::Shutdown(reply) => {
            info!("Bluetooth manager shutting down");
            self.save_all_history();
            let _ = reply.send(());
            return false;
         },
      }
      true
   }

   fn load_history(&mut self) {
      let Some(store) = &self.store else {
         return;
      };
      match store.load_all() {
         Ok(histories) => {
            info!("Loaded history for {} scanners", histories.len());
            self
               .manager
               .restore_history(histories, monotonic_time(), unix_time());
         },
         Err(e) => warn!("Failed to load scanner history: {e}"),
      }
   }

   fn save_history(&self, source: &str, scanner: &dyn Scanner) {
      let Some(store) = &self.store else {
         return;
      };
      let Some(history) = scanner.serialize_history(monotonic_time(), unix_time()) else {
         return;
      };
      if let Err(e) = store.set(source, &history) {
         error!("Failed to save history for {source}: {e}");
      }
   }

   fn save_all_history(&self) {
      let Some(store) = &self.store else {
         return;
      };
      let histories: HashMap<_, _> = self
         .manager
         .serialize_scanner_histories(monotonic_time(), unix_time())
         .into_iter()
         .collect();
      for (source, history) in &histories {
         if let Err(e) = store.set(source, history) {
            error!("Failed to save history for {source}: {e}");
         }
      }
      debug!("Saved history for {} scanners", histories.len());
   }
}

#[cfg(test)]
mod tests {
   use std::sync::atomic::{AtomicUsize, Ordering};

   use super::*;
   use crate::bluetooth::{
      models::{AdvertisementData, ChangeKind},
      testing::{RecordingBus, TestScanner, addr, advertisement},
   };

   const ADDRESS: &str = "44:44:33:11:23:45";

   fn spawn(store: Option<HistoryStore>) -> ManagerHandle {
      let manager = BluetoothManager::new(RecordingBus::new(), Vec::new());
      ManagerHandle::spawn(manager, store, RuntimeSettings::default()).0
   }

   #[tokio::test]
   async fn test_advertisements_reach_history_in_order() {
      let handle = spawn(None);
      let scanner = TestScanner::new("hci0", "hci0", true);
      handle.register_scanner(scanner.clone(), Some(2)).await.unwrap();

      let address = addr(ADDRESS);
      for (i, name) in ["first", "second"].into_iter().enumerate() {
         let info = scanner.receive(address, &advertisement(name, -60), i as f64);
         handle.advertisement(info).await.unwrap();
      }

      let info = handle.last_service_info(address, true).await.unwrap();
      assert_eq!(info.name(), "second");
      assert_eq!(handle.scanner_count(true).await, 1);
      assert!(handle.address_present(address, false).await);
      assert!(handle.ble_device_from_address(address, true).await.is_some());
   }

   #[tokio::test]
   async fn test_callback_registration_cancel() {
      let handle = spawn(None);
      let scanner = TestScanner::new("hci0", "hci0", true);
      handle.register_scanner(scanner.clone(), None).await.unwrap();

      let calls = Arc::new(AtomicUsize::new(0));
      let counter = calls.clone();
      let registration = handle
         .register_callback(
            Arc::new(move |_: &ServiceInfo, _: ChangeKind| {
               counter.fetch_add(1, Ordering::SeqCst);
            }),
            None,
         )
         .await
         .unwrap();

      let address = addr(ADDRESS);
      handle
         .advertisement(scanner.receive(address, &advertisement("one", -60), 1.0))
         .await
         .unwrap();
      registration.cancel().await;
      handle
         .advertisement(scanner.receive(address, &advertisement("two", -60), 2.0))
         .await
         .unwrap();

      // Round-trip so both advertisements have been processed.
      handle.scanner_count(false).await;
      assert_eq!(calls.load(Ordering::SeqCst), 1);
   }

   #[tokio::test]
   async fn test_detached_cancel_removes_bleak_subscriber() {
      let handle = spawn(None);
      let registration = handle
         .register_bleak_callback(
            Arc::new(|_: &Arc<BleDevice>, _: &Arc<AdvertisementData>| {}),
            BleakFilter::default(),
         )
         .await
         .unwrap();
      let count = || handle.call(|manager| manager.diagnostics()["bleak_callbacks"].clone());
      assert_eq!(count().await.unwrap(), 1);

      registration.cancel_detached();
      assert_eq!(count().await.unwrap(), 0);
   }

   #[tokio::test]
   async fn test_operations_after_shutdown() {
      let handle = spawn(None);
      let registration = handle
         .register_scanner(TestScanner::new("hci0", "hci0", true), None)
         .await
         .unwrap();
      handle.shutdown().await.unwrap();

      registration.cancel().await;
      assert!(matches!(
         handle.diagnostics().await,
         Err(BluetoothError::ManagerShutdown)
      ));
      assert!(handle.discovered_service_info(true).await.is_empty());
      assert!(matches!(
         handle.try_advertisement(
            TestScanner::new("x", "x", true).receive(addr(ADDRESS), &advertisement("x", -60), 1.0)
         ),
         Err(BluetoothError::ManagerShutdown)
      ));
   }

   #[tokio::test]
   async fn test_history_persisted_on_unregister_and_shutdown() {
      let dir = tempfile::tempdir().unwrap();
      let store = HistoryStore::open(dir.path().join("history.db")).unwrap();
      let handle = spawn(Some(store.clone()));

      let address = addr(ADDRESS);
      let proxy = TestScanner::new("proxy", "proxy", false);
      let registration = handle.register_scanner(proxy.clone(), None).await.unwrap();
      handle
         .advertisement(proxy.receive(address, &advertisement("sensor", -60), monotonic_time()))
         .await
         .unwrap();
      registration.cancel().await;
      handle.scanner_count(false).await;
      assert_eq!(store.get("proxy").unwrap().unwrap().devices.len(), 1);

      let other = TestScanner::new("other", "other", false);
      handle.register_scanner(other.clone(), None).await.unwrap();
      handle.shutdown().await.unwrap();
      assert!(store.get("other").unwrap().is_some());
   }

   #[tokio::test]
   async fn test_persisted_history_restored_on_start() {
      let dir = tempfile::tempdir().unwrap();
      let store = HistoryStore::open(dir.path().join("history.db")).unwrap();
      let address = addr(ADDRESS);
      {
         let proxy = TestScanner::new("proxy", "proxy", false);
         proxy.receive(address, &advertisement("sensor", -60), monotonic_time());
         let history = proxy.serialize_history(monotonic_time(), unix_time()).unwrap();
         store.set("proxy", &history).unwrap();
      }

      let handle = spawn(Some(store));
      let info = handle.last_service_info(address, false).await.unwrap();
      assert_eq!(info.name(), "sensor");

      let proxy = TestScanner::new("proxy", "proxy", false);
      handle.register_scanner(proxy.clone(), None).await.unwrap();
      handle.scanner_count(false).await;
      assert!(proxy.discovered_addresses().contains(&address));
   }
}
