//! Scanner backed by a local BlueZ adapter.

use std::{collections::HashSet, sync::Arc, time::Duration};

use bluer::{Adapter, AdapterEvent, Address, Session};
use futures::{future::BoxFuture, stream::StreamExt};
use log::{debug, info, warn};
use rand::Rng;
use serde::Serialize;
use serde_json::json;
use smol_str::SmolStr;
use tokio::{task::JoinHandle, time};

use crate::{
   bluetooth::{
      models::{AdvertisementData, ServiceInfo, monotonic_time},
      runtime::ManagerHandle,
      scanner::{BaseScanner, DiscoveredDeviceHistory, RawAdvertisement, Scanner},
   },
   error::{BluetoothError, Result},
};

/// Maximum delay between discovery restarts
const MAX_RESTART_DELAY: Duration = Duration::from_secs(120);

/// Summary of one local adapter.
#[derive(Debug, Clone, Serialize)]
pub struct AdapterDetails {
   pub name: SmolStr,
   pub address: String,
   pub alias: String,
   pub powered: bool,
}

/// Lists local adapters. Errors are returned rather than retried.
pub async fn discover_adapters(session: &Session) -> Result<Vec<AdapterDetails>> {
   let mut adapters = Vec::new();
   for name in session.adapter_names().await? {
      let adapter = session.adapter(&name)?;
      adapters.push(AdapterDetails {
         address: adapter.address().await?.to_string(),
         alias: adapter.alias().await?,
         powered: adapter.is_powered().await?,
         name: name.into(),
      });
   }
   Ok(adapters)
}

/// Passive scanner on one local adapter. Local adapters can always connect.
pub struct LocalScanner {
   base: BaseScanner,
   adapter: Adapter,
}

impl LocalScanner {
   pub async fn new(adapter: Adapter) -> Result<Arc<Self>> {
      let source = adapter.address().await?.to_string();
      Ok(Arc::new(Self {
         base: BaseScanner::new(source, adapter.name(), true),
         adapter,
      }))
   }

   /// Runs discovery until the manager goes away, restarting it with
   /// backoff whenever the adapter stream ends or fails.
   pub fn start(self: &Arc<Self>, handle: ManagerHandle) -> JoinHandle<()> {
      let scanner = self.clone();
      tokio::spawn(async move {
         let mut retry_count = 0;
         loop {
            match scanner.scan(&handle).await {
               Err(BluetoothError::ManagerShutdown) => break,
               Ok(()) => {
                  info!("Discovery on {} ended", scanner.base.adapter());
                  retry_count = 0;
               },
               Err(e) => {
                  warn!("Discovery on {} failed: {e}", scanner.base.adapter());
                  retry_count += 1;
               },
            }
            scanner.base.set_scanning(false);
            let delay = calc_retry_delay(retry_count);
            debug!("Restarting discovery on {} in {delay:?}", scanner.base.adapter());
            time::sleep(delay).await;
         }
         scanner.base.set_scanning(false);
      })
   }

   async fn scan(&self, handle: &ManagerHandle) -> Result<()> {
      if !self.adapter.is_powered().await? {
         self.adapter.set_powered(true).await?;
         info!("Powered on adapter: {}", self.adapter.name());
      }

      let events = self.adapter.discover_devices_with_changes().await?;
      futures::pin_mut!(events);
      self.base.set_scanning(true);
      info!("Discovery started on {}", self.adapter.name());

      while let Some(event) = events.next().await {
         match event {
            AdapterEvent::DeviceAdded(address) => {
               let Some(raw) = self.read_advertisement(address).await else {
                  continue;
               };
               let info = self.base.on_advertisement(raw, monotonic_time());
               handle.advertisement(info).await?;
            },
            AdapterEvent::DeviceRemoved(address) => {
               debug!("Device removed on {}: {address}", self.adapter.name());
               self.base.remove_device(address);
            },
            _ => {},
         }
      }
      Ok(())
   }

   async fn read_advertisement(&self, address: Address) -> Option<RawAdvertisement> {
      let device = self.adapter.device(address).ok()?;
      // Devices reported without RSSI are cached entries, not live advertisements.
      let rssi = device.rssi().await.ok().flatten()?;
      let local_name = device.name().await.ok().flatten().map(SmolStr::from);
      let advertisement = AdvertisementData {
         local_name: local_name.clone(),
         rssi,
         tx_power: device.tx_power().await.ok().flatten(),
         manufacturer_data: device
            .manufacturer_data()
            .await
            .ok()
            .flatten()
            .unwrap_or_default(),
         service_data: device.service_data().await.ok().flatten().unwrap_or_default(),
         service_uuids: device
            .uuids()
            .await
            .ok()
            .flatten()
            .map_or(Vec::new(), |uuids| uuids.into_iter().collect()),
      };
      Some(RawAdvertisement {
         address,
         device_name: local_name,
         advertisement,
      })
   }
}

impl Scanner for LocalScanner {
   fn source(&self) -> &SmolStr {
      self.base.source()
   }

   fn adapter(&self) -> &SmolStr {
      self.base.adapter()
   }

   fn connectable(&self) -> bool {
      true
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

   fn serialize_history(&self, _now_mono: f64, _now_wall: f64) -> Option<DiscoveredDeviceHistory> {
      // BlueZ keeps its own device cache across restarts.
      None
   }

   fn diagnostics(&self) -> serde_json::Value {
      let mut diagnostics = self.base.diagnostics();
      diagnostics["type"] = json!("local");
      diagnostics
   }

   fn connect(&self, address: Address) -> BoxFuture<'static, Result<()>> {
      let device = self.adapter.device(address);
      Box::pin(async move {
         device?.connect().await?;
         Ok::<_, BluetoothError>(())
      })
   }

   fn disconnect(&self, address: Address) -> BoxFuture<'static, Result<()>> {
      let device = self.adapter.device(address);
      Box::pin(async move {
         device?.disconnect().await?;
         Ok::<_, BluetoothError>(())
      })
   }
}

fn calc_retry_delay(retry_count: u32) -> Duration {
   let base_delay = Duration::from_secs(2);
   let exponential = base_delay * (1 << retry_count.min(6));
   let delay = exponential.min(MAX_RESTART_DELAY);
   let jitter = rand::thread_rng().gen_range(0..1000);
   delay + Duration::from_millis(jitter)
}
