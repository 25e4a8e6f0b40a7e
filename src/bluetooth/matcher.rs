//! Advertisement matching for discovery and ad-hoc callbacks.
//!
//! Matchers are indexed by their most selective field so that an incoming
//! advertisement only has to be checked against the buckets for its own
//! address, name prefix, UUIDs and manufacturer ids.

use std::{
   collections::{HashMap, HashSet},
   num::NonZeroUsize,
   sync::Arc,
};

use bluer::Address;
use glob::Pattern;
use lru::LruCache;
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;
use smol_str::SmolStr;
use uuid::Uuid;

use crate::{
   bluetooth::models::{AdvertisementData, ChangeKind, ServiceInfo, serde_address},
   error::{BluetoothError, Result},
};

/// Upper bound on addresses remembered by the integration matcher.
pub const MAX_REMEMBER_ADDRESSES: usize = 2048;
/// Local name matchers are indexed by this many leading characters.
pub const LOCAL_NAME_MIN_MATCH_LENGTH: usize = 3;

/// Callback invoked for every matching advertisement.
pub type AdvertisementCallback = Arc<dyn Fn(&ServiceInfo, ChangeKind) + Send + Sync>;

/// Identifier returned by every callback registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CallbackId(pub u64);

/// Typed matcher; every present field must match.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BluetoothMatcher {
   #[serde(default, with = "serde_address", skip_serializing_if = "Option::is_none")]
   pub address: Option<Address>,
   /// Shell-style glob matched against the advertised or device name.
   #[serde(default, skip_serializing_if = "Option::is_none")]
   pub local_name: Option<SmolStr>,
   #[serde(default, skip_serializing_if = "Option::is_none")]
   pub service_uuid: Option<Uuid>,
   #[serde(default, skip_serializing_if = "Option::is_none")]
   pub service_data_uuid: Option<Uuid>,
   #[serde(default, skip_serializing_if = "Option::is_none")]
   pub manufacturer_id: Option<u16>,
   #[serde(default, skip_serializing_if = "Option::is_none")]
   pub manufacturer_data_start: Option<Vec<u8>>,
   /// Defaults to true: only connectable advertisements match.
   #[serde(default, skip_serializing_if = "Option::is_none")]
   pub connectable: Option<bool>,
}

impl BluetoothMatcher {
   pub fn new() -> Self {
      Self::default()
   }

   #[must_use]
   pub const fn with_address(mut self, address: Address) -> Self {
      self.address = Some(address);
      self
   }

   #[must_use]
   pub fn with_local_name(mut self, local_name: impl Into<SmolStr>) -> Self {
      self.local_name = Some(local_name.into());
      self
   }

   #[must_use]
   pub const fn with_service_uuid(mut self, uuid: Uuid) -> Self {
      self.service_uuid = Some(uuid);
      self
   }

   #[must_use]
   pub const fn with_service_data_uuid(mut self, uuid: Uuid) -> Self {
      self.service_data_uuid = Some(uuid);
      self
   }

   #[must_use]
   pub const fn with_manufacturer_id(mut self, id: u16) -> Self {
      self.manufacturer_id = Some(id);
      self
   }

   #[must_use]
   pub fn with_manufacturer_data_start(mut self, start: impl Into<Vec<u8>>) -> Self {
      self.manufacturer_data_start = Some(start.into());
      self
   }

   #[must_use]
   pub const fn with_connectable(mut self, connectable: bool) -> Self {
      self.connectable = Some(connectable);
      self
   }

   pub fn requires_connectable(&self) -> bool {
      self.connectable.unwrap_or(true)
   }
}

/// Matcher with its name pattern compiled.
#[derive(Debug, Clone)]
pub struct CompiledMatcher {
   matcher: BluetoothMatcher,
   local_name: Option<(Pattern, SmolStr)>,
}

impl CompiledMatcher {
   /// Compiles `matcher`, rejecting name patterns that would match too much.
   pub fn new(matcher: BluetoothMatcher) -> Result<Self> {
      let local_name = match &matcher.local_name {
         Some(name) => Some((Pattern::new(name)?, local_name_index_key(name)?)),
         None => None,
      };
      Ok(Self {
         matcher,
         local_name,
      })
   }

   pub const fn matcher(&self) -> &BluetoothMatcher {
      &self.matcher
   }

   pub fn matches(&self, info: &ServiceInfo) -> bool {
      let matcher = &self.matcher;
      if matcher.address.is_some_and(|a| a != info.address()) {
         return false;
      }
      if matcher.requires_connectable() && !info.connectable() {
         return false;
      }
      if let Some(uuid) = &matcher.service_uuid
         && !info.service_uuids().contains(uuid)
      {
         return false;
      }
      if let Some(uuid) = &matcher.service_data_uuid
         && !info.service_data().contains_key(uuid)
      {
         return false;
      }
      if let Some(id) = matcher.manufacturer_id {
         if !info.manufacturer_data().contains_key(&id) {
            return false;
         }
         if let Some(start) = &matcher.manufacturer_data_start
            && !info
               .manufacturer_data()
               .get(&id)
               .is_some_and(|data| data.starts_with(start))
         {
            return false;
         }
      }
      if let Some((pattern, _)) = &self.local_name
         && !pattern.matches(&info.name())
      {
         return false;
      }
      true
   }

   fn index_key(&self) -> IndexKey {
      let matcher = &self.matcher;
      if let Some(address) = matcher.address {
         IndexKey::Address(address)
      } else if let Some((_, prefix)) = &self.local_name {
         IndexKey::LocalName(prefix.clone())
      } else if let Some(uuid) = matcher.service_uuid {
         IndexKey::ServiceUuid(uuid)
      } else if let Some(uuid) = matcher.service_data_uuid {
         IndexKey::ServiceDataUuid(uuid)
      } else if let Some(id) = matcher.manufacturer_id {
         IndexKey::ManufacturerId(id)
      } else {
         IndexKey::Any
      }
   }
}

fn local_name_index_key(local_name: &str) -> Result<SmolStr> {
   let prefix: SmolStr = local_name
      .chars()
      .take(LOCAL_NAME_MIN_MATCH_LENGTH)
      .collect();
   if prefix.chars().count() < LOCAL_NAME_MIN_MATCH_LENGTH
      || prefix.contains(['*', '?', '['])
   {
      return Err(BluetoothError::MatcherTooBroad(local_name.into()));
   }
   Ok(prefix)
}

fn name_index_key(name: &str) -> Option<SmolStr> {
   let prefix: SmolStr = name.chars().take(LOCAL_NAME_MIN_MATCH_LENGTH).collect();
   (prefix.chars().count() == LOCAL_NAME_MIN_MATCH_LENGTH).then_some(prefix)
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum IndexKey {
   Address(Address),
   LocalName(SmolStr),
   ServiceUuid(Uuid),
   ServiceDataUuid(Uuid),
   ManufacturerId(u16),
   Any,
}

/// Entries that can be stored in a [`MatcherIndex`].
pub trait IndexedMatcher {
   fn compiled(&self) -> &CompiledMatcher;
}

/// Buckets of matchers keyed by their most selective field.
#[derive(Debug)]
pub struct MatcherIndex<T> {
   buckets: HashMap<IndexKey, Vec<T>>,
   len: usize,
}

impl<T> Default for MatcherIndex<T> {
   fn default() -> Self {
      Self {
         buckets: HashMap::new(),
         len: 0,
      }
   }
}

impl<T: IndexedMatcher> MatcherIndex<T> {
   pub fn add(&mut self, entry: T) {
      let key = entry.compiled().index_key();
      self.buckets.entry(key).or_default().push(entry);
      self.len += 1;
   }

   /// Removes and returns the first entry satisfying `pred`.
   pub fn remove_where(&mut self, pred: impl Fn(&T) -> bool) -> Option<T> {
      let mut emptied = None;
      let mut removed = None;
      for (key, bucket) in &mut self.buckets {
         if let Some(pos) = bucket.iter().position(&pred) {
            removed = Some(bucket.remove(pos));
            if bucket.is_empty() {
               emptied = Some(key.clone());
            }
            break;
         }
      }
      if let Some(key) = emptied {
         self.buckets.remove(&key);
      }
      if removed.is_some() {
         self.len -= 1;
      }
      removed
   }

   pub const fn len(&self) -> usize {
      self.len
   }

   pub const fn is_empty(&self) -> bool {
      self.len == 0
   }

   /// Returns every entry whose matcher accepts `info`.
   pub fn matching(&self, info: &ServiceInfo) -> SmallVec<[&T; 4]> {
      let mut keys: SmallVec<[IndexKey; 8]> = SmallVec::new();
      keys.push(IndexKey::Address(info.address()));
      if let Some(prefix) = name_index_key(&info.name()) {
         keys.push(IndexKey::LocalName(prefix));
      }
      let uuids: HashSet<&Uuid> = info.service_uuids().iter().collect();
      keys.extend(uuids.into_iter().map(|u| IndexKey::ServiceUuid(*u)));
      keys.extend(
         info
            .service_data()
            .keys()
            .map(|u| IndexKey::ServiceDataUuid(*u)),
      );
      keys.extend(
         info
            .manufacturer_data()
            .keys()
            .map(|id| IndexKey::ManufacturerId(*id)),
      );
      keys.push(IndexKey::Any);

      keys
         .iter()
         .filter_map(|key| self.buckets.get(key))
         .flatten()
         .filter(|entry| entry.compiled().matches(info))
         .collect()
   }

   pub fn iter(&self) -> impl Iterator<Item = &T> {
      self.buckets.values().flatten()
   }
}

// === Integration matching ===

/// Discovery matcher for one integration domain.
#[derive(Debug, Clone)]
pub struct IntegrationEntry {
   pub domain: SmolStr,
   compiled: CompiledMatcher,
}

impl IntegrationEntry {
   pub fn new(domain: impl Into<SmolStr>, matcher: BluetoothMatcher) -> Result<Self> {
      Ok(Self {
         domain: domain.into(),
         compiled: CompiledMatcher::new(matcher)?,
      })
   }
}

impl IndexedMatcher for IntegrationEntry {
   fn compiled(&self) -> &CompiledMatcher {
      &self.compiled
   }
}

/// Which advertisement fields have been seen for one address.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IntegrationMatchHistory {
   pub manufacturer_data: bool,
   pub service_data: HashSet<Uuid>,
   pub service_uuids: HashSet<Uuid>,
}

impl IntegrationMatchHistory {
   fn from_advertisement(adv: &AdvertisementData) -> Self {
      Self {
         manufacturer_data: !adv.manufacturer_data.is_empty(),
         service_data: adv.service_data.keys().copied().collect(),
         service_uuids: adv.service_uuids.iter().copied().collect(),
      }
   }

   fn update(&mut self, adv: &AdvertisementData) {
      self.manufacturer_data |= !adv.manufacturer_data.is_empty();
      self.service_data.extend(adv.service_data.keys().copied());
      self.service_uuids.extend(adv.service_uuids.iter().copied());
   }
}

/// True when `adv` carries nothing the history has not already seen.
///
/// An address for which no manufacturer payload has been observed is always
/// re-evaluated, whatever the new record carries (an empty map included).
pub fn seen_all_fields(previous: &IntegrationMatchHistory, adv: &AdvertisementData) -> bool {
   if !previous.manufacturer_data {
      return false;
   }
   if !adv.service_data.is_empty()
      && !adv
         .service_data
         .keys()
         .all(|uuid| previous.service_data.contains(uuid))
   {
      return false;
   }
   if !adv.service_uuids.is_empty()
      && !adv
         .service_uuids
         .iter()
         .all(|uuid| previous.service_uuids.contains(uuid))
   {
      return false;
   }
   true
}

/// Decides which integration domains should be offered a discovery.
pub struct IntegrationMatcher {
   index: MatcherIndex<IntegrationEntry>,
   matched: LruCache<Address, IntegrationMatchHistory>,
   matched_connectable: LruCache<Address, IntegrationMatchHistory>,
}

impl IntegrationMatcher {
   pub fn new(entries: impl IntoIterator<Item = IntegrationEntry>) -> Self {
      let capacity = NonZeroUsize::new(MAX_REMEMBER_ADDRESSES).unwrap_or(NonZeroUsize::MIN);
      let mut index = MatcherIndex::default();
      for entry in entries {
         index.add(entry);
      }
      Self {
         index,
         matched: LruCache::new(capacity),
         matched_connectable: LruCache::new(capacity),
      }
   }

   pub fn add(&mut self, entry: IntegrationEntry) {
      self.index.add(entry);
   }

   /// Domains whose matcher accepts `info`; empty when nothing new was seen.
   pub fn match_domains(&mut self, info: &ServiceInfo) -> HashSet<SmolStr> {
      let history = if info.connectable() {
         &mut self.matched_connectable
      } else {
         &mut self.matched
      };
      let address = info.address();
      let adv = info.advertisement();

      if let Some(previous) = history.get(&address)
         && seen_all_fields(previous, adv)
      {
         return HashSet::new();
      }

      let domains = self
         .index
         .matching(info)
         .into_iter()
         .map(|entry| entry.domain.clone())
         .collect();

      if let Some(previous) = history.get_mut(&address) {
         previous.update(adv);
      } else {
         history.put(address, IntegrationMatchHistory::from_advertisement(adv));
      }
      domains
   }

   /// Forgets what was seen for `address` so it can be discovered again.
   pub fn clear_address(&mut self, address: Address) {
      self.matched.pop(&address);
      self.matched_connectable.pop(&address);
   }

   pub fn remembered_addresses(&self) -> usize {
      self.matched.len() + self.matched_connectable.len()
   }
}

// === Callback matching ===

/// Registered advertisement callback.
pub struct CallbackEntry {
   pub id: CallbackId,
   pub callback: AdvertisementCallback,
   compiled: CompiledMatcher,
}

impl CallbackEntry {
   pub fn new(
      id: CallbackId,
      callback: AdvertisementCallback,
      matcher: BluetoothMatcher,
   ) -> Result<Self> {
      Ok(Self {
         id,
         callback,
         compiled: CompiledMatcher::new(matcher)?,
      })
   }

   pub const fn matcher(&self) -> &BluetoothMatcher {
      self.compiled.matcher()
   }
}

impl IndexedMatcher for CallbackEntry {
   fn compiled(&self) -> &CompiledMatcher {
      &self.compiled
   }
}

pub type CallbackIndex = MatcherIndex<CallbackEntry>;
