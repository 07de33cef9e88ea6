//! The network stage: a small pool of workers that drive requests through
//! the transport, applying conditional revalidation, redirect handling, and
//! the request's retry policy, then write cacheable results back to the
//! cache and hand outcomes to delivery.

use super::Shared;
use crate::error::{ErrorKind, Result};
use crate::headers;
use crate::pool;
use crate::request::{finish_request, RequestHandle};
use crate::response::NetworkResponse;
use crate::transport::TransportRequest;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::debug;
use url::Url;

/// Requests slower than this get a debug line with their timings.
const SLOW_REQUEST_THRESHOLD: Duration = Duration::from_millis(3000);

pub(crate) fn spawn(shared: Arc<Shared>, quit: Arc<AtomicBool>, index: usize) -> JoinHandle<()> {
  thread::Builder::new()
    .name(format!("fetchpipe-net-{index}"))
    .spawn(move || run(&shared, &quit))
    .expect("spawn network worker")
}

fn run(shared: &Arc<Shared>, quit: &AtomicBool) {
  debug!("network worker started");
  loop {
    if quit.load(Ordering::SeqCst) {
      break;
    }
    let Some(request) = shared.network_queue.take() else {
      break;
    };
    if request.core().is_canceled() {
      finish_request(&request, "network-discard-cancelled");
      continue;
    }
    process(shared, request);
  }
  debug!("network worker stopped");
}

fn process(shared: &Arc<Shared>, request: RequestHandle) {
  let core = request.core();
  let started = Instant::now();

  match perform(shared, &request, started) {
    Ok(response) => {
      log_slow_request(&request, &response, started.elapsed());

      // A 304 for a request that already saw its intermediate delivery has
      // nothing new to say; close it out quietly.
      if response.not_modified && core.has_delivered() {
        finish_request(&request, "not-modified");
        return;
      }

      match request.parse_network_response(&response) {
        Ok(mut parsed) => {
          if core.should_cache() {
            if let Some(entry) = parsed.cache_entry.take() {
              shared.cache.put(core.cache_key(), entry);
              debug!(key = core.cache_key(), "network-cache-written");
            }
          }
          core.mark_delivered();
          shared.delivery.post_response(request, parsed, None);
        }
        Err(err) => {
          let err = err.with_network_time(started.elapsed().as_millis() as u64);
          let err = request.parse_network_error(err);
          shared.delivery.post_error(request, err);
        }
      }
    }
    Err(err) => {
      let err = err.with_network_time(started.elapsed().as_millis() as u64);
      let err = request.parse_network_error(err);
      shared.delivery.post_error(request, err);
    }
  }
}

/// Drives one request to a final `NetworkResponse`, looping through the
/// retry policy on retriable failures.
fn perform(
  shared: &Arc<Shared>,
  request: &RequestHandle,
  started: Instant,
) -> Result<NetworkResponse> {
  let core = request.core();

  loop {
    let extra_headers = conditional_headers(core.cache_entry().as_ref());
    let url = core.current_url();
    let transport_request = TransportRequest {
      method: core.effective_method(),
      url: &url,
      headers: core.extra_headers(),
      body: core.effective_body(),
      body_content_type: core.body_content_type(),
      timeout: core.timeout(),
    };

    match shared.transport.perform(&transport_request, &extra_headers) {
      Ok(raw) => {
        let elapsed = started.elapsed().as_millis() as u64;
        let status = raw.status;
        let response_headers = collect_headers(raw.headers);

        if status == 304 {
          return Ok(not_modified_response(core.cache_entry(), response_headers, elapsed));
        }

        if status == 301 || status == 302 {
          if let Some(location) = headers::header_value(&response_headers, "Location") {
            let target = resolve_redirect(&url, location);
            debug!(from = %url, to = %target, "following redirect");
            core.set_redirect_url(target);
          }
        }

        let had_entity = raw.body.is_some();
        let data = match raw.body {
          Some(mut reader) => {
            match pool::read_all(&mut reader, &shared.pool, body_size_hint(&response_headers)) {
              Ok(data) => data,
              Err(_) => return Err(ErrorKind::Network(None).into()),
            }
          }
          None => Vec::new(),
        };

        if (200..=299).contains(&status) {
          return Ok(NetworkResponse::new(status, data, response_headers, false, elapsed));
        }

        if !had_entity {
          return Err(ErrorKind::Network(None).into());
        }

        let response = NetworkResponse::new(status, data, response_headers, false, elapsed);
        match status {
          401 | 403 => core.retry("auth", ErrorKind::AuthFailure(response).into())?,
          // The URL was already repointed above; the retry loop re-issues
          // against the new target.
          301 | 302 => core.retry("redirect", ErrorKind::Redirect(response).into())?,
          _ => return Err(ErrorKind::Server(response).into()),
        }
      }
      Err(err) => {
        if matches!(err.kind(), ErrorKind::Timeout) {
          core.retry("socket", err)?;
        } else {
          return Err(err);
        }
      }
    }
  }
}

/// Conditional request headers derived from the attached cache entry.
fn conditional_headers(entry: Option<&crate::cache::CacheEntry>) -> Vec<(String, String)> {
  let mut extra = Vec::new();
  let Some(entry) = entry else {
    return extra;
  };
  if let Some(etag) = &entry.etag {
    extra.push(("If-None-Match".to_string(), etag.clone()));
  }
  if entry.last_modified > 0 {
    extra.push((
      "If-Modified-Since".to_string(),
      headers::format_date_epoch_ms(entry.last_modified),
    ));
  }
  extra
}

/// A 304 either confirms the stored entry (whose body and merged headers
/// are returned) or, with nothing stored, stands alone with an empty body.
fn not_modified_response(
  entry: Option<crate::cache::CacheEntry>,
  fresh_headers: HashMap<String, String>,
  elapsed: u64,
) -> NetworkResponse {
  match entry {
    None => NetworkResponse::new(304, Vec::new(), fresh_headers, true, elapsed),
    Some(entry) => {
      let merged = headers::merge_headers(&entry.response_headers, &fresh_headers);
      NetworkResponse::new(304, entry.data, merged, true, elapsed)
    }
  }
}

fn collect_headers(raw: Vec<(String, String)>) -> HashMap<String, String> {
  let mut map = HashMap::with_capacity(raw.len());
  for (name, value) in raw {
    map.insert(name, value);
  }
  map
}

fn body_size_hint(response_headers: &HashMap<String, String>) -> usize {
  headers::header_value(response_headers, "Content-Length")
    .and_then(|value| value.parse().ok())
    .unwrap_or(1024)
}

/// Resolves a Location header against the URL that produced it; an
/// unparsable base falls back to the literal header value.
fn resolve_redirect(current: &str, location: &str) -> String {
  Url::parse(current)
    .ok()
    .and_then(|base| base.join(location).ok())
    .map(|resolved| resolved.to_string())
    .unwrap_or_else(|| location.to_string())
}

fn log_slow_request(request: &RequestHandle, response: &NetworkResponse, elapsed: Duration) {
  if elapsed > SLOW_REQUEST_THRESHOLD {
    let core = request.core();
    debug!(
      url = %core.origin_url(),
      elapsed_ms = elapsed.as_millis() as u64,
      status = response.status_code,
      retries = core.retry_count(),
      "slow request"
    );
  }
}
