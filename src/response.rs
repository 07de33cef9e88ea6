//! Raw and parsed response types.

use crate::cache::CacheEntry;
use crate::error::Result;
use crate::headers;
use std::collections::HashMap;
use std::fmt;

/// One complete HTTP exchange as seen by the pipeline: status, headers, and
/// the fully assembled body.
#[derive(Clone)]
pub struct NetworkResponse {
  /// HTTP status code.
  pub status_code: u16,
  /// Response body. Empty when the server sent no entity.
  pub data: Vec<u8>,
  /// Response headers. Lookup should go through [`NetworkResponse::header`],
  /// which is case-insensitive.
  pub headers: HashMap<String, String>,
  /// True when this response was synthesized from a 304 and a stored cache
  /// entry.
  pub not_modified: bool,
  /// Wall-clock milliseconds the exchange took, including retries.
  pub network_time_ms: u64,
}

impl NetworkResponse {
  pub fn new(
    status_code: u16,
    data: Vec<u8>,
    headers: HashMap<String, String>,
    not_modified: bool,
    network_time_ms: u64,
  ) -> Self {
    Self {
      status_code,
      data,
      headers,
      not_modified,
      network_time_ms,
    }
  }

  /// Case-insensitive header lookup.
  pub fn header(&self, name: &str) -> Option<&str> {
    headers::header_value(&self.headers, name)
  }
}

impl fmt::Debug for NetworkResponse {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("NetworkResponse")
      .field("status_code", &self.status_code)
      .field("data_len", &self.data.len())
      .field("not_modified", &self.not_modified)
      .field("network_time_ms", &self.network_time_ms)
      .finish()
  }
}

/// A successfully parsed response: the typed value plus the cache entry the
/// network stage should install for it, if any.
pub struct Parsed<T> {
  pub value: T,
  pub cache_entry: Option<CacheEntry>,
}

impl<T> Parsed<T> {
  /// A parsed value that should not be cached.
  pub fn new(value: T) -> Self {
    Self {
      value,
      cache_entry: None,
    }
  }

  /// A parsed value whose cache entry is derived from the response's
  /// standard cache headers.
  pub fn with_cache_headers(value: T, response: &NetworkResponse) -> Self {
    Self {
      value,
      cache_entry: headers::cache_entry_for(response),
    }
  }
}

/// Type-erased parse result handed from a worker thread to the delivery
/// stage. `deliver` invokes the request's typed listener with the parsed
/// value; the value itself never crosses the erased boundary.
pub(crate) struct ParsedResponse {
  pub(crate) deliver: Box<dyn FnOnce() + Send>,
  pub(crate) cache_entry: Option<CacheEntry>,
  /// True when a further response will follow (soft-TTL cache hit that also
  /// triggered a background refresh).
  pub(crate) intermediate: bool,
}

impl std::fmt::Debug for ParsedResponse {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("ParsedResponse")
      .field("cache_entry", &self.cache_entry)
      .field("intermediate", &self.intermediate)
      .finish()
  }
}

/// Outcome of parsing, as routed to the delivery stage.
pub(crate) type ParseOutcome = Result<ParsedResponse>;
