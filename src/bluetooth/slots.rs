//! Connection slot accounting per adapter.

use std::collections::{HashMap, HashSet};

use bluer::Address;
use log::debug;
use serde_json::json;
use smol_str::SmolStr;

#[derive(Debug)]
struct AdapterSlots {
   total: usize,
   allocations: HashSet<Address>,
}

/// Tracks how many concurrent connections each adapter may still open.
#[derive(Debug, Default)]
pub struct SlotManager {
   adapters: HashMap<SmolStr, AdapterSlots>,
}

impl SlotManager {
   pub fn new() -> Self {
      Self::default()
   }

   /// Sets the slot count of `adapter`. Scanners sharing an adapter share
   /// its allocations, so re-registering keeps the live ones.
   pub fn register_adapter(&mut self, adapter: SmolStr, slots: usize) {
      debug!("Adapter {adapter} has {slots} connection slots");
      self
         .adapters
         .entry(adapter)
         .and_modify(|existing| existing.total = slots)
         .or_insert_with(|| AdapterSlots {
            total: slots,
            allocations: HashSet::new(),
         });
   }

   pub fn remove_adapter(&mut self, adapter: &str) {
      self.adapters.remove(adapter);
   }

   /// Reserves a slot for `address` on `adapter`.
   ///
   /// Adapters without slot limits always succeed, as does an address that
   /// already holds a slot.
   pub fn allocate_slot(&mut self, adapter: &str, address: Address) -> bool {
      let Some(slots) = self.adapters.get_mut(adapter) else {
         return true;
      };
      if slots.allocations.contains(&address) {
         return true;
      }
      if slots.allocations.len() >= slots.total {
         return false;
      }
      slots.allocations.insert(address);
      true
   }

   pub fn release_slot(&mut self, adapter: &str, address: Address) {
      if let Some(slots) = self.adapters.get_mut(adapter) {
         slots.allocations.remove(&address);
      }
   }

   /// Free slots on `adapter`, or `None` when it is not tracked.
   pub fn free_slots(&self, adapter: &str) -> Option<usize> {
      self
         .adapters
         .get(adapter)
         .map(|slots| slots.total.saturating_sub(slots.allocations.len()))
   }

   pub fn diagnostics(&self) -> serde_json::Value {
      self
         .adapters
         .iter()
         .map(|(name, slots)| {
            (
               name.to_string(),
               json!({
                  "slots": slots.total,
                  "allocations": slots
                     .allocations
                     .iter()
                     .map(ToString::to_string)
                     .collect::<Vec<_>>(),
               }),
            )
         })
         .collect::<serde_json::Map<_, _>>()
         .into()
   }
}
