//! Discovery notifications emitted by the manager.
//!
//! The manager never talks to consumers directly; it reports discovery
//! decisions through a [`DiscoveryBus`] so the daemon can forward them over
//! D-Bus and tests can simply record them.

use std::sync::Arc;

use bluer::Address;
use smol_str::SmolStr;

use crate::bluetooth::models::ServiceInfo;

/// Events that can be emitted by the manager.
#[derive(Debug, Clone)]
pub enum DiscoveryEvent {
   /// An integration domain matched an advertisement.
   FlowRequested { domain: SmolStr, info: ServiceInfo },
   /// The address went away; pending discoveries for it should be withdrawn.
   FlowsDismissed(Address),
}

/// Trait for implementing discovery flow handling.
pub trait DiscoveryBus: Send + Sync {
   /// Starts a discovery flow for `domain`.
   fn create_flow(&self, domain: &SmolStr, info: &ServiceInfo);

   /// Withdraws every pending discovery for `address`.
   fn dismiss_flows(&self, address: Address);
}

/// Type alias for a thread-safe discovery sender.
pub type DiscoverySender = Arc<dyn DiscoveryBus>;
