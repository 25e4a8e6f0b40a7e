//! Compatibility adapter for code written against a generic BLE scanner and
//! client API.
//!
//! Such callers construct their own scanner and client objects with no way
//! to pass the manager in, so the parameterless constructors here look it up
//! from a process-wide slot installed by the daemon. This is the only place
//! in the crate that uses global state; everything else receives a
//! [`ManagerHandle`] explicitly.

use std::{
   collections::HashMap,
   sync::{Arc, OnceLock},
};

use bluer::Address;
use log::{debug, warn};
use smol_str::SmolStr;

use crate::{
   bluetooth::{
      manager::{BleakCallback, BleakFilter},
      models::{AdvertisementData, BleDevice},
      runtime::{ManagerHandle, Registration},
      scanner::Scanner,
   },
   error::{BluetoothError, Result},
};

static MANAGER: OnceLock<ManagerHandle> = OnceLock::new();

/// Installs the handle used by the wrappers. Only the first call wins.
pub fn install_manager(handle: ManagerHandle) -> bool {
   MANAGER.set(handle).is_ok()
}

pub fn installed_manager() -> Result<ManagerHandle> {
   MANAGER.get().cloned().ok_or(BluetoothError::ManagerNotInstalled)
}

/// Scanner facade over the manager's merged connectable view.
pub struct ScannerWrapper {
   handle: ManagerHandle,
   filter: BleakFilter,
   detection: Option<Registration>,
}

impl ScannerWrapper {
   pub fn new(filter: BleakFilter) -> Result<Self> {
      Ok(Self::with_manager(installed_manager()?, filter))
   }

   pub const fn with_manager(handle: ManagerHandle, filter: BleakFilter) -> Self {
      Self {
         handle,
         filter,
         detection: None,
      }
   }

   /// Devices currently reachable through any connectable scanner.
   pub async fn discover(&self) -> Vec<Arc<BleDevice>> {
      self.discovered_devices().await
   }

   pub async fn discovered_devices(&self) -> Vec<Arc<BleDevice>> {
      self
         .handle
         .discovered_service_info(true)
         .await
         .into_iter()
         .map(|info| info.device().clone())
         .collect()
   }

   pub async fn discovered_devices_and_advertisement_data(
      &self,
   ) -> HashMap<Address, (Arc<BleDevice>, Arc<AdvertisementData>)> {
      self
         .handle
         .discovered_service_info(true)
         .await
         .into_iter()
         .map(|info| {
            (
               info.address(),
               (info.device().clone(), info.advertisement().clone()),
            )
         })
         .collect()
   }

   /// Replaces the detection callback. Devices already known are replayed
   /// to the new callback right away.
   pub async fn register_detection_callback(&mut self, callback: Option<BleakCallback>) -> Result<()> {
      if let Some(previous) = self.detection.take() {
         previous.cancel().await;
      }
      if let Some(callback) = callback {
         self.detection = Some(
            self
               .handle
               .register_bleak_callback(callback, self.filter.clone())
               .await?,
         );
      }
      Ok(())
   }

   pub async fn stop(&mut self) {
      if let Some(registration) = self.detection.take() {
         registration.cancel().await;
      }
   }
}

impl Drop for ScannerWrapper {
   fn drop(&mut self) {
      if let Some(registration) = self.detection.take() {
         registration.cancel_detached();
      }
   }
}

/// Client facade that routes a connection through the best backend.
pub struct ClientWrapper {
   handle: ManagerHandle,
   address: Address,
   backend: Option<Arc<dyn Scanner>>,
}

impl ClientWrapper {
   pub fn new(address: Address) -> Result<Self> {
      Ok(Self::with_manager(installed_manager()?, address))
   }

   pub const fn with_manager(handle: ManagerHandle, address: Address) -> Self {
      Self {
         handle,
         address,
         backend: None,
      }
   }

   pub const fn is_connected(&self) -> bool {
      self.backend.is_some()
   }

   pub fn backend_source(&self) -> Option<SmolStr> {
      self.backend.as_ref().map(|backend| backend.source().clone())
   }

   /// Connects through the strongest scanner with a free slot.
   ///
   /// Fails with [`BluetoothError::NoAvailableSlot`] when no scanner can
   /// take the connection.
   pub async fn connect(&mut self) -> Result<()> {
      if self.backend.is_some() {
         return Ok(());
      }
      let backend = self.handle.select_connection_backend(self.address).await?;
      debug!("{}: connecting through {}", self.address, backend.name());
      match backend.connect(self.address).await {
         Ok(()) => {
            self.backend = Some(backend);
            Ok(())
         },
         Err(e) => {
            warn!("{}: connection through {} failed: {e}", self.address, backend.name());
            self.release(backend.adapter().clone()).await;
            Err(e)
         },
      }
   }

   pub async fn disconnect(&mut self) -> Result<()> {
      let Some(backend) = self.backend.take() else {
         return Ok(());
      };
      let result = backend.disconnect(self.address).await;
      self.release(backend.adapter().clone()).await;
      result
   }

   async fn release(&self, adapter: SmolStr) {
      if let Err(e) = self.handle.release_connection_slot(adapter, self.address).await {
         debug!("{}: could not release connection slot: {e}", self.address);
      }
   }
}
