//! Response cache abstraction.
//!
//! The pipeline talks to its cache through the [`Cache`] trait so tests and
//! embedders can substitute their own store; the crate ships the disk-backed
//! [`DiskCache`](disk::DiskCache) as the production implementation.

pub mod disk;

use std::collections::HashMap;
use std::time::{SystemTime, UNIX_EPOCH};

/// Wall-clock now in epoch milliseconds. All TTL math is done on this scale.
pub(crate) fn epoch_ms() -> i64 {
  SystemTime::now()
    .duration_since(UNIX_EPOCH)
    .unwrap_or_default()
    .as_millis() as i64
}

/// A cached response: the body plus the metadata needed for freshness checks
/// and conditional revalidation.
#[derive(Clone, Debug, Default)]
pub struct CacheEntry {
  /// Response body.
  pub data: Vec<u8>,
  /// ETag validator, when the server supplied one.
  pub etag: Option<String>,
  /// Server's `Date` header as epoch milliseconds, 0 when unknown.
  pub server_date: i64,
  /// Server's `Last-Modified` header as epoch milliseconds, 0 when unknown.
  pub last_modified: i64,
  /// Hard expiry: past this instant the entry must be revalidated before
  /// being served.
  pub ttl: i64,
  /// Soft expiry: past this instant the entry is still served, but a
  /// background refresh is triggered. Always `soft_ttl <= ttl`.
  pub soft_ttl: i64,
  /// Response headers as received. Never absent, possibly empty.
  pub response_headers: HashMap<String, String>,
}

impl CacheEntry {
  /// True when the entry may no longer be served without revalidation.
  pub fn is_expired(&self) -> bool {
    epoch_ms() > self.ttl
  }

  /// True when the entry should be refreshed in the background.
  pub fn refresh_needed(&self) -> bool {
    epoch_ms() > self.soft_ttl
  }
}

/// A `key -> CacheEntry` store.
///
/// Implementations serialize their own access: every method may be called
/// from any pipeline thread. [`Cache::initialize`] is invoked by the cache
/// worker before any other method and must complete before reads are
/// answered.
pub trait Cache: Send + Sync {
  /// Performs any blocking startup work (directory scan, index build).
  fn initialize(&self);

  /// Fetches an entry, refreshing its recency. `None` when absent or
  /// unreadable.
  fn get(&self, key: &str) -> Option<CacheEntry>;

  /// Stores an entry, evicting older entries as needed to respect the
  /// store's capacity.
  fn put(&self, key: &str, entry: CacheEntry);

  /// Forces a future refresh of the entry: drops its soft TTL, and with
  /// `full_expire` also its hard TTL.
  fn invalidate(&self, key: &str, full_expire: bool);

  /// Removes a single entry.
  fn remove(&self, key: &str);

  /// Empties the store.
  fn clear(&self);
}

/// A cache that stores nothing. Useful for queues whose requests all opt out
/// of caching, and in tests.
#[derive(Debug, Default)]
pub struct NoopCache;

impl Cache for NoopCache {
  fn initialize(&self) {}

  fn get(&self, _key: &str) -> Option<CacheEntry> {
    None
  }

  fn put(&self, _key: &str, _entry: CacheEntry) {}

  fn invalidate(&self, _key: &str, _full_expire: bool) {}

  fn remove(&self, _key: &str) {}

  fn clear(&self) {}
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn freshness_predicates_follow_ttls() {
    let now = epoch_ms();
    let fresh = CacheEntry {
      soft_ttl: now + 60_000,
      ttl: now + 120_000,
      ..Default::default()
    };
    assert!(!fresh.is_expired());
    assert!(!fresh.refresh_needed());

    let soft_expired = CacheEntry {
      soft_ttl: now - 1_000,
      ttl: now + 60_000,
      ..Default::default()
    };
    assert!(!soft_expired.is_expired());
    assert!(soft_expired.refresh_needed());

    let expired = CacheEntry {
      soft_ttl: now - 2_000,
      ttl: now - 1_000,
      ..Default::default()
    };
    assert!(expired.is_expired());
    assert!(expired.refresh_needed());
  }
}
