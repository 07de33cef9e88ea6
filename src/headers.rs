//! HTTP cache-header interpretation.
//!
//! Translates standard response headers (`Cache-Control`, `Expires`, `Date`,
//! `ETag`, `Last-Modified`) into the TTL pair carried by [`CacheEntry`]:
//! `soft_ttl` is when a background refresh becomes due, `ttl` is when the
//! entry must no longer be served without revalidation.

use crate::cache::{epoch_ms, CacheEntry};
use crate::response::NetworkResponse;
use std::collections::HashMap;
use std::time::{Duration, UNIX_EPOCH};

/// Case-insensitive lookup in a header map.
pub(crate) fn header_value<'a>(headers: &'a HashMap<String, String>, name: &str) -> Option<&'a str> {
  headers
    .iter()
    .find(|(key, _)| key.eq_ignore_ascii_case(name))
    .map(|(_, value)| value.as_str())
}

/// Merges freshly received headers over a stored header map. New values win;
/// stored headers with no replacement survive. Used when revalidating a
/// cached entry against a 304.
pub(crate) fn merge_headers(
  stored: &HashMap<String, String>,
  fresh: &HashMap<String, String>,
) -> HashMap<String, String> {
  let mut merged = stored.clone();
  for (name, value) in fresh {
    merged.retain(|key, _| !key.eq_ignore_ascii_case(name));
    merged.insert(name.clone(), value.clone());
  }
  merged
}

/// Parses an RFC 1123 date into epoch milliseconds, or 0 when absent or
/// unparsable. Zero sorts as "unknown" everywhere TTL math happens.
pub fn parse_date_epoch_ms(value: &str) -> i64 {
  httpdate::parse_http_date(value)
    .ok()
    .and_then(|time| time.duration_since(UNIX_EPOCH).ok())
    .map(|elapsed| elapsed.as_millis() as i64)
    .unwrap_or(0)
}

/// Formats epoch milliseconds as an RFC 1123 date, the format conditional
/// request headers require.
pub fn format_date_epoch_ms(epoch: i64) -> String {
  let time = UNIX_EPOCH + Duration::from_millis(epoch.max(0) as u64);
  httpdate::fmt_http_date(time)
}

/// Derives a cache entry from a response's headers, or `None` when the
/// server forbids caching (`no-cache` / `no-store`).
///
/// `max-age` sets the soft TTL; `stale-while-revalidate` extends the hard
/// TTL past it unless the server demands revalidation. Without
/// `Cache-Control`, `Expires` relative to the server's `Date` is used for
/// both. A response with no caching headers at all still produces an entry
/// (with zeroed TTLs) so its validators remain available for conditional
/// requests.
pub fn cache_entry_for(response: &NetworkResponse) -> Option<CacheEntry> {
  let now = epoch_ms();

  let server_date = header_value(&response.headers, "Date")
    .map(parse_date_epoch_ms)
    .unwrap_or(0);
  let last_modified = header_value(&response.headers, "Last-Modified")
    .map(parse_date_epoch_ms)
    .unwrap_or(0);
  let server_expires = header_value(&response.headers, "Expires")
    .map(parse_date_epoch_ms)
    .unwrap_or(0);
  let etag = header_value(&response.headers, "ETag").map(str::to_string);

  let mut max_age_secs: i64 = 0;
  let mut stale_while_revalidate_secs: i64 = 0;
  let mut has_cache_control = false;
  let mut must_revalidate = false;

  if let Some(cache_control) = header_value(&response.headers, "Cache-Control") {
    has_cache_control = true;
    for directive in cache_control.split(',') {
      let directive = directive.trim();
      if directive == "no-cache" || directive == "no-store" {
        return None;
      } else if let Some(seconds) = directive.strip_prefix("max-age=") {
        max_age_secs = seconds.parse().unwrap_or(0);
      } else if let Some(seconds) = directive.strip_prefix("stale-while-revalidate=") {
        stale_while_revalidate_secs = seconds.parse().unwrap_or(0);
      } else if directive == "must-revalidate" || directive == "proxy-revalidate" {
        must_revalidate = true;
      }
    }
  }

  let (soft_ttl, ttl) = if has_cache_control {
    let soft = now + max_age_secs * 1000;
    let hard = if must_revalidate {
      soft
    } else {
      soft + stale_while_revalidate_secs * 1000
    };
    (soft, hard)
  } else if server_date > 0 && server_expires >= server_date {
    let expiry = now + (server_expires - server_date);
    (expiry, expiry)
  } else {
    (0, 0)
  };

  Some(CacheEntry {
    data: response.data.clone(),
    etag,
    server_date,
    last_modified,
    ttl,
    soft_ttl,
    response_headers: response.headers.clone(),
  })
}
