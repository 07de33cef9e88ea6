//! End-to-end pipeline scenarios against a scripted transport.

use fetchpipe::{
  DiskCache, Error, ErrorKind, ImmediateExecutor, Method, QueueBuilder, RawResponse, Request,
  RequestQueue, Transport, TransportRequest,
};
use fetchpipe::{Cache, CacheEntry, DefaultRetryPolicy};
use std::collections::VecDeque;
use std::io::{self, Cursor};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

// ----------------------------------------------------------------------------
// Scripted transport
// ----------------------------------------------------------------------------

enum Scripted {
  Respond {
    status: u16,
    headers: Vec<(String, String)>,
    body: Option<Vec<u8>>,
  },
  Timeout,
  NoConnection,
}

impl Scripted {
  fn ok(status: u16, headers: &[(&str, &str)], body: &[u8]) -> Self {
    Scripted::Respond {
      status,
      headers: headers
        .iter()
        .map(|(name, value)| (name.to_string(), value.to_string()))
        .collect(),
      body: Some(body.to_vec()),
    }
  }
}

#[derive(Clone, Debug)]
struct RecordedCall {
  method: String,
  url: String,
  extra_headers: Vec<(String, String)>,
  timeout: Duration,
}

struct MockTransport {
  script: Mutex<VecDeque<Scripted>>,
  calls: Mutex<Vec<RecordedCall>>,
}

impl MockTransport {
  fn new(script: Vec<Scripted>) -> Arc<Self> {
    Arc::new(Self {
      script: Mutex::new(VecDeque::from(script)),
      calls: Mutex::new(Vec::new()),
    })
  }

  fn calls(&self) -> Vec<RecordedCall> {
    self.calls.lock().unwrap().clone()
  }
}

impl Transport for MockTransport {
  fn perform(
    &self,
    request: &TransportRequest<'_>,
    extra_headers: &[(String, String)],
  ) -> fetchpipe::Result<RawResponse> {
    self.calls.lock().unwrap().push(RecordedCall {
      method: request.method.to_string(),
      url: request.url.to_string(),
      extra_headers: extra_headers.to_vec(),
      timeout: request.timeout,
    });

    let Some(next) = self.script.lock().unwrap().pop_front() else {
      return Err(
        ErrorKind::NoConnection(io::Error::new(io::ErrorKind::Other, "script exhausted")).into(),
      );
    };

    match next {
      Scripted::Respond {
        status,
        headers,
        body,
      } => Ok(RawResponse {
        status,
        headers,
        body: body.map(|bytes| Box::new(Cursor::new(bytes)) as Box<dyn io::Read + Send>),
      }),
      Scripted::Timeout => Err(ErrorKind::Timeout.into()),
      Scripted::NoConnection => Err(
        ErrorKind::NoConnection(io::Error::new(io::ErrorKind::ConnectionRefused, "scripted"))
          .into(),
      ),
    }
  }
}

// ----------------------------------------------------------------------------
// Helpers
// ----------------------------------------------------------------------------

type Sink<T> = Arc<Mutex<Vec<T>>>;

fn sink<T>() -> Sink<T> {
  Arc::new(Mutex::new(Vec::new()))
}

fn wait_until(timeout_ms: u64, mut condition: impl FnMut() -> bool) -> bool {
  let deadline = Instant::now() + Duration::from_millis(timeout_ms);
  while Instant::now() < deadline {
    if condition() {
      return true;
    }
    thread::sleep(Duration::from_millis(10));
  }
  condition()
}

fn classify(error: &Error) -> &'static str {
  match error.kind() {
    ErrorKind::Timeout => "timeout",
    ErrorKind::NoConnection(_) => "no-connection",
    ErrorKind::Network(_) => "network",
    ErrorKind::AuthFailure(_) => "auth",
    ErrorKind::Redirect(_) => "redirect",
    ErrorKind::Server(_) => "server",
    ErrorKind::Parse(_) => "parse",
    ErrorKind::BadUrl(_) => "bad-url",
    ErrorKind::Io(_) => "io",
  }
}

fn queue_with(transport: Arc<MockTransport>, cache: Arc<dyn Cache>) -> QueueBuilder {
  QueueBuilder::new()
    .with_transport(transport)
    .with_cache(cache)
    .with_executor(Arc::new(ImmediateExecutor))
    .with_network_threads(1)
}

fn finish_counter(queue: &RequestQueue) -> Arc<AtomicUsize> {
  let finishes = Arc::new(AtomicUsize::new(0));
  let observed = Arc::clone(&finishes);
  queue.add_finished_listener(move |_| {
    observed.fetch_add(1, Ordering::SeqCst);
  });
  finishes
}

fn now_ms() -> i64 {
  SystemTime::now()
    .duration_since(UNIX_EPOCH)
    .unwrap()
    .as_millis() as i64
}

/// A soft-expired but not hard-expired cache entry with validators.
fn soft_expired_entry(body: &[u8], etag: &str) -> CacheEntry {
  let now = now_ms();
  CacheEntry {
    data: body.to_vec(),
    etag: Some(etag.to_string()),
    server_date: now - 120_000,
    last_modified: now - 600_000,
    ttl: now + 60_000,
    soft_ttl: now - 1_000,
    response_headers: [("ETag", etag), ("X-Origin", "cache")]
      .iter()
      .map(|(k, v)| (k.to_string(), v.to_string()))
      .collect(),
  }
}

// ----------------------------------------------------------------------------
// Scenarios
// ----------------------------------------------------------------------------

#[test]
fn cold_cacheable_get_fetches_once_and_caches() {
  let tmp = tempfile::tempdir().unwrap();
  let cache = Arc::new(DiskCache::new(tmp.path()));
  let transport = MockTransport::new(vec![Scripted::ok(
    200,
    &[("Cache-Control", "max-age=60"), ("Content-Type", "text/plain")],
    b"hello",
  )]);

  let queue = queue_with(transport.clone(), cache.clone()).start();
  let finishes = finish_counter(&queue);
  let responses = sink::<String>();

  let collected = Arc::clone(&responses);
  queue.add(
    Request::string(Method::Get, "http://test.example/a")
      .on_response(move |body| collected.lock().unwrap().push(body))
      .build(),
  );

  assert!(wait_until(5_000, || finishes.load(Ordering::SeqCst) == 1));
  assert_eq!(*responses.lock().unwrap(), vec!["hello".to_string()]);
  assert_eq!(transport.calls().len(), 1);
  assert_eq!(cache.entry_count(), 1, "response was written to the cache");
  assert!(
    std::fs::read_dir(tmp.path()).unwrap().count() >= 1,
    "a cache file exists on disk"
  );
}

#[test]
fn soft_ttl_hit_serves_cached_then_revalidates_with_304() {
  let tmp = tempfile::tempdir().unwrap();
  let cache = Arc::new(DiskCache::new(tmp.path()));
  cache.initialize();

  let probe = Request::string(Method::Get, "http://test.example/soft").build();
  let key = probe.cache_key().to_string();
  cache.put(&key, soft_expired_entry(b"cached", "\"v1\""));

  let transport = MockTransport::new(vec![Scripted::ok(304, &[("ETag", "\"v2\"")], b"")]);
  let queue = queue_with(transport.clone(), cache.clone()).start();
  let finishes = finish_counter(&queue);
  let responses = sink::<String>();

  let collected = Arc::clone(&responses);
  let request = Request::string(Method::Get, "http://test.example/soft")
    .on_response(move |body| collected.lock().unwrap().push(body))
    .build();
  queue.add(request);

  assert!(wait_until(5_000, || finishes.load(Ordering::SeqCst) == 1));
  // The cached body is delivered as the intermediate response; the 304
  // confirms it, so the request finishes without a second delivery.
  assert_eq!(*responses.lock().unwrap(), vec!["cached".to_string()]);

  let calls = transport.calls();
  assert_eq!(calls.len(), 1);
  assert!(
    calls[0]
      .extra_headers
      .contains(&("If-None-Match".to_string(), "\"v1\"".to_string())),
    "conditional headers were sent: {:?}",
    calls[0].extra_headers
  );
  assert!(calls[0]
    .extra_headers
    .iter()
    .any(|(name, _)| name == "If-Modified-Since"));
}

#[test]
fn soft_ttl_hit_with_changed_body_delivers_both() {
  let tmp = tempfile::tempdir().unwrap();
  let cache = Arc::new(DiskCache::new(tmp.path()));
  cache.initialize();

  let probe = Request::string(Method::Get, "http://test.example/fresh").build();
  let key = probe.cache_key().to_string();
  cache.put(&key, soft_expired_entry(b"old", "\"v1\""));

  let transport = MockTransport::new(vec![Scripted::ok(
    200,
    &[("Cache-Control", "max-age=60"), ("ETag", "\"v2\"")],
    b"new",
  )]);
  let queue = queue_with(transport.clone(), cache.clone()).start();
  let finishes = finish_counter(&queue);
  let responses = sink::<String>();

  let collected = Arc::clone(&responses);
  queue.add(
    Request::string(Method::Get, "http://test.example/fresh")
      .on_response(move |body| collected.lock().unwrap().push(body))
      .build(),
  );

  assert!(wait_until(5_000, || finishes.load(Ordering::SeqCst) == 1));
  assert_eq!(
    *responses.lock().unwrap(),
    vec!["old".to_string(), "new".to_string()],
    "intermediate cached body first, refreshed body second"
  );
  assert_eq!(transport.calls().len(), 1);

  let updated = cache.get(&key).expect("cache entry refreshed");
  assert_eq!(updated.data, b"new");
  assert_eq!(updated.etag.as_deref(), Some("\"v2\""));
}

#[test]
fn coalesced_requests_share_one_network_fetch() {
  let tmp = tempfile::tempdir().unwrap();
  let cache = Arc::new(DiskCache::new(tmp.path()));
  let transport = MockTransport::new(vec![Scripted::ok(
    200,
    &[("Cache-Control", "max-age=60")],
    b"shared",
  )]);

  // Build unstarted so all three admissions coalesce deterministically.
  let queue = queue_with(transport.clone(), cache).build();
  let finishes = finish_counter(&queue);
  let responses = sink::<String>();

  for _ in 0..3 {
    let collected = Arc::clone(&responses);
    queue.add(
      Request::string(Method::Get, "http://test.example/dup")
        .on_response(move |body| collected.lock().unwrap().push(body))
        .build(),
    );
  }
  queue.start();

  assert!(wait_until(5_000, || finishes.load(Ordering::SeqCst) == 3));
  assert_eq!(
    transport.calls().len(),
    1,
    "followers are served from the entry the first request installed"
  );
  assert_eq!(
    *responses.lock().unwrap(),
    vec!["shared".to_string(); 3],
    "all three observe byte-equal bodies"
  );
}

#[test]
fn timeout_retries_with_grown_timeout_then_succeeds() {
  let transport = MockTransport::new(vec![
    Scripted::Timeout,
    Scripted::ok(200, &[], b"recovered"),
  ]);
  let queue = queue_with(transport.clone(), Arc::new(fetchpipe::NoopCache)).start();
  let finishes = finish_counter(&queue);
  let responses = sink::<String>();

  let collected = Arc::clone(&responses);
  queue.add(
    Request::string(Method::Get, "http://test.example/slow")
      .with_should_cache(false)
      .with_retry_policy(DefaultRetryPolicy::new(1_000, 1, 1.0))
      .on_response(move |body| collected.lock().unwrap().push(body))
      .build(),
  );

  assert!(wait_until(5_000, || finishes.load(Ordering::SeqCst) == 1));
  assert_eq!(*responses.lock().unwrap(), vec!["recovered".to_string()]);

  let calls = transport.calls();
  assert_eq!(calls.len(), 2);
  assert_eq!(calls[0].timeout, Duration::from_millis(1_000));
  assert_eq!(calls[1].timeout, Duration::from_millis(2_000), "backoff doubled");
}

#[test]
fn redirect_is_followed_and_origin_url_is_kept() {
  let transport = MockTransport::new(vec![
    Scripted::ok(302, &[("Location", "/b")], b"moved"),
    Scripted::ok(200, &[], b"target"),
  ]);
  let queue = queue_with(transport.clone(), Arc::new(fetchpipe::NoopCache)).start();
  let finishes = finish_counter(&queue);
  let responses = sink::<String>();

  let collected = Arc::clone(&responses);
  let request = queue.add(
    Request::string(Method::Get, "http://test.example/a")
      .with_should_cache(false)
      .with_retry_policy(DefaultRetryPolicy::new(2_500, 1, 1.0))
      .on_response(move |body| collected.lock().unwrap().push(body))
      .build(),
  );

  assert!(wait_until(5_000, || finishes.load(Ordering::SeqCst) == 1));
  assert_eq!(*responses.lock().unwrap(), vec!["target".to_string()]);

  let calls = transport.calls();
  assert_eq!(calls.len(), 2);
  assert_eq!(calls[0].url, "http://test.example/a");
  assert_eq!(calls[1].url, "http://test.example/b", "Location was resolved");
  assert_eq!(request.url(), "http://test.example/b");
  assert_eq!(request.origin_url(), "http://test.example/a");
}

#[test]
fn auth_failure_retries_before_surfacing() {
  let transport = MockTransport::new(vec![
    Scripted::ok(401, &[], b"denied"),
    Scripted::ok(200, &[], b"let in"),
  ]);
  let queue = queue_with(transport.clone(), Arc::new(fetchpipe::NoopCache)).start();
  let finishes = finish_counter(&queue);
  let responses = sink::<String>();

  let collected = Arc::clone(&responses);
  queue.add(
    Request::string(Method::Get, "http://test.example/auth")
      .with_should_cache(false)
      .with_retry_policy(DefaultRetryPolicy::new(2_500, 1, 1.0))
      .on_response(move |body| collected.lock().unwrap().push(body))
      .build(),
  );

  assert!(wait_until(5_000, || finishes.load(Ordering::SeqCst) == 1));
  assert_eq!(*responses.lock().unwrap(), vec!["let in".to_string()]);
  assert_eq!(transport.calls().len(), 2);
}

#[test]
fn server_error_is_terminal_with_network_time() {
  let transport = MockTransport::new(vec![Scripted::ok(500, &[], b"oops")]);
  let queue = queue_with(transport.clone(), Arc::new(fetchpipe::NoopCache)).start();
  let finishes = finish_counter(&queue);
  let errors = sink::<(&'static str, Option<u16>, bool)>();

  let collected = Arc::clone(&errors);
  queue.add(
    Request::string(Method::Get, "http://test.example/broken")
      .with_should_cache(false)
      .on_error(move |error| {
        collected.lock().unwrap().push((
          classify(error),
          error.network_response().map(|r| r.status_code),
          error.network_time_ms().is_some(),
        ));
      })
      .build(),
  );

  assert!(wait_until(5_000, || finishes.load(Ordering::SeqCst) == 1));
  assert_eq!(transport.calls().len(), 1, "terminal errors do not retry");
  assert_eq!(*errors.lock().unwrap(), vec![("server", Some(500), true)]);
}

#[test]
fn no_connection_is_terminal() {
  let transport = MockTransport::new(vec![Scripted::NoConnection]);
  let queue = queue_with(transport.clone(), Arc::new(fetchpipe::NoopCache)).start();
  let finishes = finish_counter(&queue);
  let errors = sink::<&'static str>();

  let collected = Arc::clone(&errors);
  queue.add(
    Request::string(Method::Get, "http://test.example/offline")
      .with_should_cache(false)
      .on_error(move |error| collected.lock().unwrap().push(classify(error)))
      .build(),
  );

  assert!(wait_until(5_000, || finishes.load(Ordering::SeqCst) == 1));
  assert_eq!(transport.calls().len(), 1);
  assert_eq!(*errors.lock().unwrap(), vec!["no-connection"]);
}

#[test]
fn priority_then_fifo_governs_dispatch_order() {
  let transport = MockTransport::new(
    (0..5)
      .map(|_| Scripted::ok(200, &[], b"done"))
      .collect::<Vec<_>>(),
  );
  let queue = queue_with(transport.clone(), Arc::new(fetchpipe::NoopCache)).build();
  let finishes = finish_counter(&queue);

  use fetchpipe::Priority;
  for (url, priority) in [
    ("http://test.example/low", Priority::Low),
    ("http://test.example/n1", Priority::Normal),
    ("http://test.example/n2", Priority::Normal),
    ("http://test.example/high", Priority::High),
    ("http://test.example/imm", Priority::Immediate),
  ] {
    queue.add(
      Request::string(Method::Get, url)
        .with_should_cache(false)
        .with_priority(priority)
        .build(),
    );
  }
  queue.start();

  assert!(wait_until(5_000, || finishes.load(Ordering::SeqCst) == 5));
  let order: Vec<String> = transport.calls().into_iter().map(|call| call.url).collect();
  assert_eq!(
    order,
    vec![
      "http://test.example/imm",
      "http://test.example/high",
      "http://test.example/n1",
      "http://test.example/n2",
      "http://test.example/low",
    ]
  );
}

#[test]
fn cancellation_before_dispatch_suppresses_all_listeners() {
  let transport = MockTransport::new(vec![Scripted::ok(200, &[], b"never seen")]);
  let queue = queue_with(transport.clone(), Arc::new(fetchpipe::NoopCache)).build();
  let finishes = finish_counter(&queue);
  let responses = sink::<String>();
  let errors = sink::<&'static str>();

  let collected = Arc::clone(&responses);
  let failed = Arc::clone(&errors);
  let request = queue.add(
    Request::string(Method::Get, "http://test.example/cancel")
      .on_response(move |body| collected.lock().unwrap().push(body))
      .on_error(move |error| failed.lock().unwrap().push(classify(error)))
      .build(),
  );
  request.cancel();
  queue.start();

  assert!(wait_until(5_000, || finishes.load(Ordering::SeqCst) == 1));
  assert!(responses.lock().unwrap().is_empty(), "no response listener fired");
  assert!(errors.lock().unwrap().is_empty(), "no error listener fired");
  assert!(transport.calls().is_empty(), "request never reached the network");
}

#[test]
fn clear_cache_empties_the_store_and_runs_callback() {
  let tmp = tempfile::tempdir().unwrap();
  let cache = Arc::new(DiskCache::new(tmp.path()));
  cache.initialize();
  cache.put("0:http://test.example/x", soft_expired_entry(b"stale", "\"v\""));
  assert_eq!(cache.entry_count(), 1);

  let transport = MockTransport::new(Vec::new());
  let queue = queue_with(transport, cache.clone()).start();

  let cleared = Arc::new(AtomicUsize::new(0));
  let observed = Arc::clone(&cleared);
  queue.clear_cache(move || {
    observed.fetch_add(1, Ordering::SeqCst);
  });

  assert!(wait_until(5_000, || cleared.load(Ordering::SeqCst) == 1));
  assert_eq!(cache.entry_count(), 0);
}

#[test]
fn legacy_get_or_post_picks_verb_by_body() {
  let transport = MockTransport::new(vec![
    Scripted::ok(200, &[], b"got"),
    Scripted::ok(200, &[], b"posted"),
  ]);
  let queue = queue_with(transport.clone(), Arc::new(fetchpipe::NoopCache)).start();
  let finishes = finish_counter(&queue);

  queue.add(
    Request::string(Method::GetOrPost, "http://test.example/legacy")
      .with_should_cache(false)
      .build(),
  );
  assert!(wait_until(5_000, || finishes.load(Ordering::SeqCst) == 1));

  queue.add(
    Request::string(Method::GetOrPost, "http://test.example/legacy")
      .with_should_cache(false)
      .with_legacy_post_body(b"payload".to_vec())
      .build(),
  );
  assert!(wait_until(5_000, || finishes.load(Ordering::SeqCst) == 2));

  let calls = transport.calls();
  assert_eq!(calls[0].method, "GET");
  assert_eq!(calls[1].method, "POST");
}
