//! The cache stage: one worker thread that answers requests from the disk
//! cache, short-circuiting fresh hits to delivery and routing misses and
//! stale hits onto the network queue.

use super::Shared;
use crate::request::{finish_request, RequestHandle};
use crate::response::NetworkResponse;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tracing::{debug, error};

/// Work items for the cache worker. Administrative tasks share the queue so
/// they serialize with request handling.
pub(crate) enum CacheTask {
  Request(RequestHandle),
  /// Empty the cache, then post the callback to the delivery executor.
  Clear(Box<dyn FnOnce() + Send>),
}

pub(crate) fn spawn(shared: Arc<Shared>, quit: Arc<AtomicBool>) -> JoinHandle<()> {
  thread::Builder::new()
    .name("fetchpipe-cache".to_string())
    .spawn(move || run(&shared, &quit))
    .expect("spawn cache worker")
}

fn run(shared: &Arc<Shared>, quit: &AtomicBool) {
  shared.cache.initialize();
  debug!("cache worker started");

  loop {
    if quit.load(Ordering::SeqCst) {
      break;
    }
    let Some(task) = shared.cache_queue.take() else {
      break;
    };
    // A panic in one request's parser must not take the worker down.
    let outcome = catch_unwind(AssertUnwindSafe(|| process(shared, task)));
    if outcome.is_err() {
      error!("cache worker survived a panic while processing a request");
    }
  }
  debug!("cache worker stopped");
}

fn process(shared: &Arc<Shared>, task: CacheTask) {
  match task {
    CacheTask::Clear(on_cleared) => {
      shared.cache.clear();
      debug!("cache cleared");
      shared.delivery.post(on_cleared);
    }
    CacheTask::Request(request) => handle_request(shared, request),
  }
}

fn handle_request(shared: &Arc<Shared>, request: RequestHandle) {
  let core = request.core();
  if core.is_canceled() {
    finish_request(&request, "cache-discard-canceled");
    return;
  }

  let key = core.cache_key().to_string();
  let Some(entry) = shared.cache.get(&key) else {
    debug!(key = %key, "cache-miss");
    shared.enqueue_network(request);
    return;
  };

  if entry.is_expired() {
    debug!(key = %key, "cache-hit-expired");
    // Keep the stale entry around so the network stage can revalidate.
    core.attach_cache_entry(entry);
    shared.enqueue_network(request);
    return;
  }

  debug!(key = %key, "cache-hit");
  let synthetic = NetworkResponse::new(200, entry.data.clone(), entry.response_headers.clone(), false, 0);
  let mut parsed = match request.parse_network_response(&synthetic) {
    Ok(parsed) => parsed,
    Err(err) => {
      shared.delivery.post_error(request, err);
      return;
    }
  };

  if !entry.refresh_needed() {
    shared.delivery.post_response(request, parsed, None);
    return;
  }

  // Soft TTL has passed: serve the cached value as an intermediate
  // response, then refresh over the network once the delivery completes.
  debug!(key = %key, "cache-hit-refresh-needed");
  core.attach_cache_entry(entry);
  parsed.intermediate = true;
  let refresh_shared = Arc::clone(shared);
  let refresh_request = Arc::clone(&request);
  shared.delivery.post_response(
    request,
    parsed,
    Some(Box::new(move || {
      refresh_shared.enqueue_network(refresh_request);
    })),
  );
}
