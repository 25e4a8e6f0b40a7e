//! Advertising interval estimation.
//!
//! The tracker learns how often each address advertises so the manager can
//! tell a sleepy device apart from one that has gone away. The learned value
//! is the largest gap between consecutive samples: it biases towards the
//! longest observed interval so normal jitter never trips the unavailability
//! timeout.

use std::collections::HashMap;

use bluer::Address;
use serde_json::json;
use smol_str::SmolStr;

use crate::bluetooth::models::{
   ADVERTISING_TIMES_NEEDED, FALLBACK_MAXIMUM_STALE_ADVERTISEMENT_SECONDS, ServiceInfo,
   TRACKER_BUFFERING_WOBBLE_SECONDS,
};

type Timings = heapless::Vec<f64, ADVERTISING_TIMES_NEEDED>;

/// Per-address advertising interval tracker.
#[derive(Debug, Default)]
pub struct AdvertisementTracker {
   intervals: HashMap<Address, f64>,
   fallback_intervals: HashMap<Address, f64>,
   sources: HashMap<Address, SmolStr>,
   timings: HashMap<Address, Timings>,
}

impl AdvertisementTracker {
   pub fn new() -> Self {
      Self::default()
   }

   /// Records the observation time of `info`.
   ///
   /// The caller only feeds addresses whose interval is not known yet and
   /// whose source has not changed since the last sample.
   pub fn collect(&mut self, info: &ServiceInfo) {
      let address = info.address();
      self.sources.insert(address, info.source().clone());

      let timings = self.timings.entry(address).or_default();
      // The buffer is drained as soon as it is full, so this never overflows.
      let _ = timings.push(info.time());
      if timings.len() != ADVERTISING_TIMES_NEEDED {
         return;
      }

      let max_gap = timings
         .windows(2)
         .map(|pair| pair[1] - pair[0])
         .fold(f64::MIN, f64::max);
      self.intervals.insert(address, max_gap);
      self.timings.remove(&address);
   }

   /// Forgets everything learned about `address` except a fallback interval.
   pub fn remove_address(&mut self, address: Address) {
      self.timings.remove(&address);
      self.sources.remove(&address);
      self.intervals.remove(&address);
   }

   /// Forgets every address last seen through `source`.
   pub fn remove_source(&mut self, source: &str) {
      let addresses: Vec<Address> = self
         .sources
         .iter()
         .filter(|(_, tracked)| tracked.as_str() == source)
         .map(|(address, _)| *address)
         .collect();
      for address in addresses {
         self.remove_address(address);
      }
   }

   pub fn interval(&self, address: Address) -> Option<f64> {
      self.intervals.get(&address).copied()
   }

   pub fn source(&self, address: Address) -> Option<&SmolStr> {
      self.sources.get(&address)
   }

   pub fn fallback_interval(&self, address: Address) -> Option<f64> {
      self.fallback_intervals.get(&address).copied()
   }

   pub fn set_fallback_interval(&mut self, address: Address, interval: f64) {
      self.fallback_intervals.insert(address, interval);
   }

   pub fn remove_fallback_interval(&mut self, address: Address) {
      self.fallback_intervals.remove(&address);
   }

   /// Seconds of silence tolerated before `address` is considered stale.
   pub fn stale_window(&self, address: Address) -> f64 {
      self
         .interval(address)
         .or_else(|| self.fallback_interval(address))
         .map_or(FALLBACK_MAXIMUM_STALE_ADVERTISEMENT_SECONDS, |interval| {
            interval + TRACKER_BUFFERING_WOBBLE_SECONDS
         })
   }

   pub fn diagnostics(&self) -> serde_json::Value {
      json!({
         "intervals": self
            .intervals
            .iter()
            .map(|(address, interval)| (address.to_string(), *interval))
            .collect::<HashMap<_, _>>(),
         "fallback_intervals": self
            .fallback_intervals
            .iter()
            .map(|(address, interval)| (address.to_string(), *interval))
            .collect::<HashMap<_, _>>(),
         "sources": self
            .sources
            .iter()
            .map(|(address, source)| (address.to_string(), source.as_str()))
            .collect::<HashMap<_, _>>(),
         "timings": self
            .timings
            .iter()
            .map(|(address, timings)| (address.to_string(), timings.to_vec()))
            .collect::<HashMap<_, _>>(),
      })
   }

   #[cfg(test)]
   fn pending_samples(&self, address: Address) -> usize {
      self.timings.get(&address).map_or(0, |t| t.len())
   }
}
