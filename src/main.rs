//! blemux D-Bus service
//!
//! Runs the Bluetooth advertisement manager on top of every local BlueZ
//! adapter, accepts advertisements from remote scanners over D-Bus and
//! announces integration discoveries as D-Bus signals.

use std::{collections::HashMap, sync::Arc, time::Duration};

use blemux::{
   bluetooth::{
      local::LocalScanner,
      manager::BluetoothManager,
      models::ServiceInfo,
      runtime::{ManagerHandle, Registration},
      wrappers::install_manager,
   },
   config::Config,
   dbus::{BluetoothService, BluetoothServiceSignals, MANAGER_PATH},
   error::Result,
   event::{DiscoveryBus, DiscoveryEvent},
   storage::HistoryStore,
};
use bluer::{Address, Session};
use crossbeam::queue::SegQueue;
use log::{error, info, warn};
use smol_str::SmolStr;
use tokio::{
   signal,
   sync::Notify,
   task::JoinHandle,
   time::{self, MissedTickBehavior},
};
use zbus::{Connection, connection, object_server::InterfaceRef};

#[tokio::main]
async fn main() -> Result<()> {
   env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

   info!("Starting blemux D-Bus service...");

   // Load configuration
   let config = Config::load()?;
   info!(
      "Loaded configuration with {} integration matchers",
      config.integrations.len()
   );

   let event_bus = EventProcessor::new();

   let mut manager = BluetoothManager::new(event_bus.clone(), config.integration_entries()?);
   for (address, seconds) in config.parsed_fallback_intervals() {
      manager.set_fallback_availability_interval(address, seconds);
   }

   let store = if config.persist_history {
      match HistoryStore::open_default() {
         Ok(store) => Some(store),
         Err(e) => {
            warn!("Scanner history will not be persisted: {e}");
            None
         },
      }
   } else {
      None
   };

   let (handle, manager_task) = ManagerHandle::spawn(manager, store, config.runtime_settings());
   install_manager(handle.clone());

   let session = Session::new().await?;
   let adapters = tokio::spawn(watch_adapters(
      session.clone(),
      handle.clone(),
      config.local_connection_slots,
      config.adapter_check_interval(),
   ));

   let service = BluetoothService::new(handle.clone(), session);

   // Build D-Bus connection
   let connection = connection::Builder::session()?
      .name("org.blemux")?
      .serve_at(MANAGER_PATH, service)?
      .build()
      .await?;

   info!("blemux D-Bus service started at org.blemux");

   event_bus.spawn_dispatcher(connection).await?;

   // Wait for shutdown signal
   signal::ctrl_c().await?;
   info!("Shutting down blemux service...");

   adapters.abort();
   if let Err(e) = handle.shutdown().await {
      warn!("Manager did not shut down cleanly: {e}");
   }
   if let Err(e) = manager_task.await {
      error!("Manager task failed: {e}");
   }

   Ok(())
}

struct LocalAdapter {
   task: JoinHandle<()>,
   registration: Registration,
}

/// Keeps one local scanner per present adapter.
async fn watch_adapters(
   session: Session,
   handle: ManagerHandle,
   connection_slots: usize,
   check_interval: Duration,
) {
   let mut running: HashMap<SmolStr, LocalAdapter> = HashMap::new();
   let mut interval = time::interval(check_interval.max(Duration::from_secs(1)));
   interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

   loop {
      interval.tick().await;
      let names = match session.adapter_names().await {
         Ok(names) => names,
         Err(e) => {
            warn!("Failed to list adapters: {e}");
            continue;
         },
      };

      let gone: Vec<SmolStr> = running
         .keys()
         .filter(|name| !names.iter().any(|n| n == name.as_str()))
         .cloned()
         .collect();
      for name in gone {
         if let Some(adapter) = running.remove(&name) {
            info!("Adapter {name} went away");
            adapter.task.abort();
            adapter.registration.cancel().await;
         }
      }

      for name in names {
         if running.contains_key(name.as_str()) {
            continue;
         }
         match start_adapter(&session, &handle, &name, connection_slots).await {
            Ok(adapter) => {
               running.insert(name.into(), adapter);
            },
            Err(e) => warn!("Failed to start scanner on {name}: {e}"),
         }
      }
   }
}

async fn start_adapter(
   session: &Session,
   handle: &ManagerHandle,
   name: &str,
   connection_slots: usize,
) -> Result<LocalAdapter> {
   let scanner = LocalScanner::new(session.adapter(name)?).await?;
   let registration = handle
      .register_scanner(scanner.clone(), Some(connection_slots))
      .await?;
   let task = scanner.start(handle.clone());
   info!("Started local scanner on {name}");
   Ok(LocalAdapter { task, registration })
}

struct EventProcessor {
   queue: SegQueue<DiscoveryEvent>,
   notifier: Notify,
}

impl EventProcessor {
   fn new() -> Arc<Self> {
      Arc::new(Self {
         queue: SegQueue::new(),
         notifier: Notify::new(),
      })
   }

   fn push(&self, event: DiscoveryEvent) {
      self.queue.push(event);
      self.notifier.notify_waiters();
   }

   async fn recv(self: &Arc<Self>) -> Option<DiscoveryEvent> {
      loop {
         if let Some(event) = self.queue.pop() {
            return Some(event);
         }
         let notify = self.notifier.notified();
         if let Some(event) = self.queue.pop() {
            return Some(event);
         }
         if Arc::strong_count(self) == 1 {
            return None;
         }
         let _ = time::timeout(Duration::from_secs(1), notify).await;
      }
   }

   async fn dispatch(&self, iface: &InterfaceRef<BluetoothService>, event: DiscoveryEvent) -> Result<()> {
      match event {
         DiscoveryEvent::FlowRequested { domain, info } => {
            iface
               .discovery_requested(
                  &domain,
                  &info.address().to_string(),
                  &info.to_json().to_string(),
               )
               .await?;
         },
         DiscoveryEvent::FlowsDismissed(address) => {
            iface.discovery_dismissed(&address.to_string()).await?;
         },
      }
      Ok(())
   }

   async fn spawn_dispatcher(self: Arc<Self>, connection: Connection) -> Result<()> {
      let iface = connection
         .object_server()
         .interface::<_, BluetoothService>(MANAGER_PATH)
         .await?;
      tokio::spawn(async move {
         while let Some(event) = self.recv().await {
            if let Err(e) = self.dispatch(&iface, event).await {
               warn!("Error dispatching event: {e}");
            }
         }
      });

      Ok(())
   }
}

impl DiscoveryBus for EventProcessor {
   fn create_flow(&self, domain: &SmolStr, info: &ServiceInfo) {
      self.push(DiscoveryEvent::FlowRequested {
         domain: domain.clone(),
         info: info.clone(),
      });
   }

   fn dismiss_flows(&self, address: Address) {
      self.push(DiscoveryEvent::FlowsDismissed(address));
   }
}
