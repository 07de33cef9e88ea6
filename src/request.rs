//! The request model.
//!
//! A [`Request`] pairs an immutable descriptor (method, URL, headers, body,
//! policy knobs) with the mutable lifecycle state the pipeline threads
//! poke at: sequence number, cancellation and delivery flags, the retry
//! policy, and the cache entry attached during revalidation.
//!
//! Worker threads never see the typed result. They operate on
//! [`QueueableRequest`], a type-erased handle whose parse method returns a
//! boxed closure that invokes the typed listener on the delivery executor.

use crate::cache::{epoch_ms, CacheEntry};
use crate::error::{Error, Result};
use crate::queue::Shared;
use crate::response::{NetworkResponse, Parsed, ParsedResponse};
use crate::retry::{DefaultRetryPolicy, RetryPolicy};
use sha1::{Digest, Sha1};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, OnceLock, Weak};
use std::time::Duration;
use tracing::debug;

/// HTTP methods the pipeline dispatches.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Method {
  /// Legacy method that resolves to POST when a legacy post body is set and
  /// GET otherwise.
  GetOrPost,
  Get,
  Post,
  Put,
  Delete,
  Head,
  Options,
  Trace,
  Patch,
}

impl Method {
  /// Wire-format code used in cache keys and request identifiers.
  pub fn code(&self) -> i32 {
    match self {
      Method::GetOrPost => -1,
      Method::Get => 0,
      Method::Post => 1,
      Method::Put => 2,
      Method::Delete => 3,
      Method::Head => 4,
      Method::Options => 5,
      Method::Trace => 6,
      Method::Patch => 7,
    }
  }

  /// The HTTP verb. [`Method::GetOrPost`] resolves at dispatch time and
  /// reads as GET here.
  pub fn as_str(&self) -> &'static str {
    match self {
      Method::GetOrPost | Method::Get => "GET",
      Method::Post => "POST",
      Method::Put => "PUT",
      Method::Delete => "DELETE",
      Method::Head => "HEAD",
      Method::Options => "OPTIONS",
      Method::Trace => "TRACE",
      Method::Patch => "PATCH",
    }
  }
}

/// Dispatch priority. Requests are taken highest priority first, FIFO
/// within one priority.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum Priority {
  Low,
  Normal,
  High,
  Immediate,
}

/// Descriptor and lifecycle state shared by the typed request and the
/// pipeline threads.
pub(crate) struct RequestCore {
  method: Method,
  url: String,
  identifier: String,
  priority: Priority,
  should_cache: bool,
  cache_key: String,
  tag: Option<String>,
  headers: HashMap<String, String>,
  body: Option<Vec<u8>>,
  body_content_type: Option<String>,
  legacy_body: Option<Vec<u8>>,
  retry_policy: Mutex<Box<dyn RetryPolicy>>,
  sequence: OnceLock<u64>,
  redirect_url: Mutex<Option<String>>,
  cache_entry: Mutex<Option<CacheEntry>>,
  canceled: AtomicBool,
  delivered: AtomicBool,
  finished: AtomicBool,
  queue: Mutex<Option<Weak<Shared>>>,
}

impl RequestCore {
  pub(crate) fn method(&self) -> Method {
    self.method
  }

  /// Current URL: the redirect target once a 3xx has been followed,
  /// otherwise the original.
  pub(crate) fn current_url(&self) -> String {
    self
      .redirect_url
      .lock()
      .unwrap()
      .clone()
      .unwrap_or_else(|| self.url.clone())
  }

  pub(crate) fn origin_url(&self) -> &str {
    &self.url
  }

  pub(crate) fn identifier(&self) -> &str {
    &self.identifier
  }

  pub(crate) fn cache_key(&self) -> &str {
    &self.cache_key
  }

  pub(crate) fn priority(&self) -> Priority {
    self.priority
  }

  pub(crate) fn should_cache(&self) -> bool {
    self.should_cache
  }

  pub(crate) fn tag(&self) -> Option<&str> {
    self.tag.as_deref()
  }

  pub(crate) fn extra_headers(&self) -> &HashMap<String, String> {
    &self.headers
  }

  /// The verb actually sent: the legacy method picks POST exactly when a
  /// legacy post body was supplied.
  pub(crate) fn effective_method(&self) -> &'static str {
    match self.method {
      Method::GetOrPost => {
        if self.legacy_body.is_some() {
          "POST"
        } else {
          "GET"
        }
      }
      other => other.as_str(),
    }
  }

  pub(crate) fn effective_body(&self) -> Option<&[u8]> {
    match self.method {
      Method::GetOrPost => self.legacy_body.as_deref(),
      _ => self.body.as_deref(),
    }
  }

  pub(crate) fn body_content_type(&self) -> Option<&str> {
    self.body_content_type.as_deref()
  }

  /// Sequence assigned by the owning queue. Reading before assignment is a
  /// programmer error.
  pub(crate) fn sequence(&self) -> u64 {
    *self
      .sequence
      .get()
      .expect("sequence read before the request was added to a queue")
  }

  pub(crate) fn assign_sequence(&self, sequence: u64) {
    let _ = self.sequence.set(sequence);
  }

  pub(crate) fn timeout(&self) -> Duration {
    self.retry_policy.lock().unwrap().current_timeout()
  }

  pub(crate) fn retry_count(&self) -> u32 {
    self.retry_policy.lock().unwrap().current_retry_count()
  }

  /// Routes a retriable error through the policy. `Ok` means try again.
  pub(crate) fn retry(&self, reason: &str, error: Error) -> Result<()> {
    let mut policy = self.retry_policy.lock().unwrap();
    let outcome = policy.retry(error);
    debug!(
      url = %self.current_url(),
      reason,
      retrying = outcome.is_ok(),
      timeout_ms = policy.current_timeout().as_millis() as u64,
      "retry consulted"
    );
    outcome
  }

  pub(crate) fn set_redirect_url(&self, url: String) {
    *self.redirect_url.lock().unwrap() = Some(url);
  }

  pub(crate) fn cancel(&self) {
    self.canceled.store(true, Ordering::SeqCst);
  }

  pub(crate) fn is_canceled(&self) -> bool {
    self.canceled.load(Ordering::SeqCst)
  }

  pub(crate) fn mark_delivered(&self) {
    self.delivered.store(true, Ordering::SeqCst);
  }

  pub(crate) fn has_delivered(&self) -> bool {
    self.delivered.load(Ordering::SeqCst)
  }

  /// Flips the finished flag, returning whether it was already set.
  pub(crate) fn mark_finished(&self) -> bool {
    self.finished.swap(true, Ordering::SeqCst)
  }

  pub(crate) fn attach_cache_entry(&self, entry: CacheEntry) {
    *self.cache_entry.lock().unwrap() = Some(entry);
  }

  pub(crate) fn cache_entry(&self) -> Option<CacheEntry> {
    self.cache_entry.lock().unwrap().clone()
  }

  pub(crate) fn bind_queue(&self, queue: Weak<Shared>) {
    *self.queue.lock().unwrap() = Some(queue);
  }

  pub(crate) fn queue(&self) -> Option<Arc<Shared>> {
    self.queue.lock().unwrap().as_ref().and_then(Weak::upgrade)
  }
}

/// The type-erased request the dispatch queues and workers operate on.
pub(crate) trait QueueableRequest: Send + Sync {
  fn core(&self) -> &RequestCore;

  /// Parses a raw exchange into a deliverable closure plus the cache entry
  /// the network stage should install. Runs on worker threads.
  fn parse_network_response(&self, response: &NetworkResponse) -> Result<ParsedResponse>;

  /// Hook for refining a network error before delivery.
  fn parse_network_error(&self, error: Error) -> Error;

  /// Invokes the error listener, if still registered.
  fn deliver_error(&self, error: &Error);

  /// Drops both listeners, breaking retention after finish.
  fn drop_listeners(&self);
}

pub(crate) type RequestHandle = Arc<dyn QueueableRequest>;

/// Terminal lifecycle event. Exactly one call per request does the
/// bookkeeping; later calls are no-ops.
pub(crate) fn finish_request(request: &RequestHandle, tag: &str) {
  let core = request.core();
  if core.mark_finished() {
    return;
  }
  debug!(url = %core.origin_url(), tag, "request finished");
  if let Some(queue) = core.queue() {
    queue.finish(request);
  }
  request.drop_listeners();
}

/// A typed request. Build one through [`Request::with_parser`] or the typed
/// constructors in [`crate::requests`], then hand it to
/// [`RequestQueue::add`](crate::queue::RequestQueue::add).
pub struct Request<T> {
  core: RequestCore,
  parser: Box<dyn Fn(&NetworkResponse) -> Result<Parsed<T>> + Send + Sync>,
  error_hook: Option<Box<dyn Fn(Error) -> Error + Send + Sync>>,
  listener: Mutex<Option<Arc<dyn Fn(T) + Send + Sync>>>,
  error_listener: Mutex<Option<Arc<dyn Fn(&Error) + Send + Sync>>>,
}

impl<T> Request<T> {
  /// Starts a request with a custom response parser.
  pub fn with_parser(
    method: Method,
    url: impl Into<String>,
    parser: impl Fn(&NetworkResponse) -> Result<Parsed<T>> + Send + Sync + 'static,
  ) -> RequestBuilder<T> {
    RequestBuilder {
      method,
      url: url.into(),
      priority: Priority::Normal,
      should_cache: true,
      cache_key: None,
      tag: None,
      headers: HashMap::new(),
      body: None,
      body_content_type: None,
      legacy_body: None,
      retry_policy: None,
      parser: Box::new(parser),
      error_hook: None,
      listener: None,
      error_listener: None,
    }
  }

  pub(crate) fn core(&self) -> &RequestCore {
    &self.core
  }

  /// Current URL; reflects the redirect target after a 3xx.
  pub fn url(&self) -> String {
    self.core.current_url()
  }

  /// The URL the request was created with, regardless of redirects.
  pub fn origin_url(&self) -> &str {
    self.core.origin_url()
  }

  /// Unique identifier assigned at construction.
  pub fn identifier(&self) -> &str {
    self.core.identifier()
  }

  /// Key under which responses to this request are cached.
  pub fn cache_key(&self) -> &str {
    self.core.cache_key()
  }

  pub fn method(&self) -> Method {
    self.core.method()
  }

  pub fn priority(&self) -> Priority {
    self.core.priority()
  }

  pub fn tag(&self) -> Option<&str> {
    self.core.tag()
  }

  /// Per-attempt timeout, as currently dictated by the retry policy.
  pub fn timeout(&self) -> Duration {
    self.core.timeout()
  }

  /// Marks the request canceled. No listener fires after cancellation is
  /// observed; the terminal finish bookkeeping still runs.
  pub fn cancel(&self) {
    self.core.cancel();
  }

  pub fn is_canceled(&self) -> bool {
    self.core.is_canceled()
  }
}

impl<T: Send + 'static> QueueableRequest for Request<T> {
  fn core(&self) -> &RequestCore {
    &self.core
  }

  fn parse_network_response(&self, response: &NetworkResponse) -> Result<ParsedResponse> {
    let parsed = (self.parser)(response)?;
    let listener = self.listener.lock().unwrap().clone();
    let value = parsed.value;
    Ok(ParsedResponse {
      deliver: Box::new(move || {
        if let Some(listener) = listener {
          (*listener)(value);
        }
      }),
      cache_entry: parsed.cache_entry,
      intermediate: false,
    })
  }

  fn parse_network_error(&self, error: Error) -> Error {
    match &self.error_hook {
      Some(hook) => hook(error),
      None => error,
    }
  }

  fn deliver_error(&self, error: &Error) {
    let listener = self.error_listener.lock().unwrap().clone();
    if let Some(listener) = listener {
      (*listener)(error);
    }
  }

  fn drop_listeners(&self) {
    *self.listener.lock().unwrap() = None;
    *self.error_listener.lock().unwrap() = None;
  }
}

/// Assembles a [`Request`].
pub struct RequestBuilder<T> {
  method: Method,
  url: String,
  priority: Priority,
  should_cache: bool,
  cache_key: Option<String>,
  tag: Option<String>,
  headers: HashMap<String, String>,
  body: Option<Vec<u8>>,
  body_content_type: Option<String>,
  legacy_body: Option<Vec<u8>>,
  retry_policy: Option<Box<dyn RetryPolicy>>,
  parser: Box<dyn Fn(&NetworkResponse) -> Result<Parsed<T>> + Send + Sync>,
  error_hook: Option<Box<dyn Fn(Error) -> Error + Send + Sync>>,
  listener: Option<Arc<dyn Fn(T) + Send + Sync>>,
  error_listener: Option<Arc<dyn Fn(&Error) + Send + Sync>>,
}

impl<T> RequestBuilder<T> {
  pub fn with_priority(mut self, priority: Priority) -> Self {
    self.priority = priority;
    self
  }

  /// Whether the response may be served from and written to the cache.
  /// Defaults to true.
  pub fn with_should_cache(mut self, should_cache: bool) -> Self {
    self.should_cache = should_cache;
    self
  }

  /// Overrides the default `"{method_code}:{url}"` cache key.
  pub fn with_cache_key(mut self, cache_key: impl Into<String>) -> Self {
    self.cache_key = Some(cache_key.into());
    self
  }

  /// Opaque tag for batch cancellation.
  pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
    self.tag = Some(tag.into());
    self
  }

  /// Adds an extra request header.
  pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
    self.headers.insert(name.into(), value.into());
    self
  }

  /// Sets a raw request body and its content type.
  pub fn with_body(mut self, body: Vec<u8>, content_type: impl Into<String>) -> Self {
    self.body = Some(body);
    self.body_content_type = Some(content_type.into());
    self
  }

  /// Sets a `application/x-www-form-urlencoded` body from key/value pairs.
  pub fn with_form_params<K, V>(mut self, params: impl IntoIterator<Item = (K, V)>) -> Self
  where
    K: AsRef<str>,
    V: AsRef<str>,
  {
    let mut serializer = url::form_urlencoded::Serializer::new(String::new());
    for (key, value) in params {
      serializer.append_pair(key.as_ref(), value.as_ref());
    }
    self.body = Some(serializer.finish().into_bytes());
    self.body_content_type =
      Some("application/x-www-form-urlencoded; charset=UTF-8".to_string());
    self
  }

  /// Body for the legacy [`Method::GetOrPost`] method; its presence is what
  /// turns that method into a POST.
  pub fn with_legacy_post_body(mut self, body: Vec<u8>) -> Self {
    self.legacy_body = Some(body);
    self
  }

  pub fn with_retry_policy(mut self, policy: impl RetryPolicy + 'static) -> Self {
    self.retry_policy = Some(Box::new(policy));
    self
  }

  /// Listener invoked with each parsed response. A soft-TTL cache hit
  /// delivers twice: the cached value first, the refreshed one after.
  pub fn on_response(mut self, listener: impl Fn(T) + Send + Sync + 'static) -> Self {
    self.listener = Some(Arc::new(listener));
    self
  }

  /// Listener invoked with the terminal error, at most once.
  pub fn on_error(mut self, listener: impl Fn(&Error) + Send + Sync + 'static) -> Self {
    self.error_listener = Some(Arc::new(listener));
    self
  }

  /// Hook to refine network errors into domain-specific ones before
  /// delivery.
  pub fn map_error(mut self, hook: impl Fn(Error) -> Error + Send + Sync + 'static) -> Self {
    self.error_hook = Some(Box::new(hook));
    self
  }

  pub fn build(self) -> Request<T> {
    let identifier = create_identifier(self.method, &self.url);
    let cache_key = self
      .cache_key
      .unwrap_or_else(|| format!("{}:{}", self.method.code(), self.url));
    Request {
      core: RequestCore {
        method: self.method,
        url: self.url,
        identifier,
        priority: self.priority,
        should_cache: self.should_cache,
        cache_key,
        tag: self.tag,
        headers: self.headers,
        body: self.body,
        body_content_type: self.body_content_type,
        legacy_body: self.legacy_body,
        retry_policy: Mutex::new(
          self
            .retry_policy
            .unwrap_or_else(|| Box::new(DefaultRetryPolicy::default())),
        ),
        sequence: OnceLock::new(),
        redirect_url: Mutex::new(None),
        cache_entry: Mutex::new(None),
        canceled: AtomicBool::new(false),
        delivered: AtomicBool::new(false),
        finished: AtomicBool::new(false),
        queue: Mutex::new(None),
      },
      parser: self.parser,
      error_hook: self.error_hook,
      listener: Mutex::new(self.listener),
      error_listener: Mutex::new(self.error_listener),
    }
  }
}

/// SHA-1 over `"Request:{method}:{url}:{timestamp}:{counter}"`, hex-encoded.
fn create_identifier(method: Method, url: &str) -> String {
  static COUNTER: AtomicU64 = AtomicU64::new(0);
  let counter = COUNTER.fetch_add(1, Ordering::Relaxed);
  let mut hasher = Sha1::new();
  hasher.update(
    format!(
      "Request:{}:{}:{}:{}",
      method.code(),
      url,
      epoch_ms(),
      counter
    )
    .as_bytes(),
  );
  let digest = hasher.finalize();
  digest.iter().map(|byte| format!("{:02x}", byte)).collect()
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::response::Parsed;

  fn plain_request(url: &str) -> RequestBuilder<Vec<u8>> {
    Request::with_parser(Method::Get, url, |response| {
      Ok(Parsed::new(response.data.clone()))
    })
  }

  #[test]
  fn identifiers_are_unique_hex() {
    let a = plain_request("https://example.com/a").build();
    let b = plain_request("https://example.com/a").build();
    assert_eq!(a.identifier().len(), 40);
    assert!(a.identifier().chars().all(|c| c.is_ascii_hexdigit()));
    assert_ne!(a.identifier(), b.identifier());
  }

  #[test]
  fn default_cache_key_is_method_code_and_url() {
    let request = plain_request("https://example.com/a").build();
    assert_eq!(request.cache_key(), "0:https://example.com/a");

    let custom = plain_request("https://example.com/a")
      .with_cache_key("mine")
      .build();
    assert_eq!(custom.cache_key(), "mine");
  }

  #[test]
  fn redirect_supersedes_url_but_not_origin() {
    let request = plain_request("https://example.com/a").build();
    assert_eq!(request.url(), "https://example.com/a");
    request.core().set_redirect_url("https://example.com/b".to_string());
    assert_eq!(request.url(), "https://example.com/b");
    assert_eq!(request.origin_url(), "https://example.com/a");
  }

  #[test]
  fn legacy_method_resolves_by_body_presence() {
    let get = Request::with_parser(Method::GetOrPost, "https://example.com", |r| {
      Ok(Parsed::new(r.data.clone()))
    })
    .build();
    assert_eq!(get.core().effective_method(), "GET");

    let post = Request::with_parser(Method::GetOrPost, "https://example.com", |r| {
      Ok(Parsed::new(r.data.clone()))
    })
    .with_legacy_post_body(b"a=1".to_vec())
    .build();
    assert_eq!(post.core().effective_method(), "POST");
    assert_eq!(post.core().effective_body(), Some(&b"a=1"[..]));
  }

  #[test]
  fn form_params_encode_urlencoded_body() {
    let request = plain_request("https://example.com")
      .with_form_params([("q", "a b"), ("lang", "en")])
      .build();
    assert_eq!(request.core().effective_body(), Some(&b"q=a+b&lang=en"[..]));
    assert!(request
      .core()
      .body_content_type()
      .expect("content type set")
      .starts_with("application/x-www-form-urlencoded"));
  }

  #[test]
  #[should_panic(expected = "sequence read before")]
  fn sequence_read_before_assignment_panics() {
    let request = plain_request("https://example.com").build();
    let _ = request.core().sequence();
  }

  #[test]
  fn priorities_order_low_to_immediate() {
    assert!(Priority::Low < Priority::Normal);
    assert!(Priority::Normal < Priority::High);
    assert!(Priority::High < Priority::Immediate);
  }
}
