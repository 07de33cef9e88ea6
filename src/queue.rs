//! The request queue: sequencing, priority scheduling, in-flight
//! de-duplication, cancellation, and worker lifecycle.
//!
//! A queue owns two priority dispatch queues. Cacheable requests go through
//! the cache stage first; everything else goes straight to the network
//! stage. Concurrent requests that share a cache key are coalesced: the
//! first one runs, the rest wait and are replayed through the cache stage
//! once the first finishes, so they observe its freshly written entry.

pub(crate) mod cache_worker;
pub(crate) mod dispatch;
pub(crate) mod network_worker;

use crate::cache::disk::DiskCache;
use crate::cache::{Cache, NoopCache};
use crate::delivery::{Executor, ResponseDelivery, ThreadExecutor};
use crate::pool::{BufferPool, DEFAULT_POOL_BYTES};
use crate::request::{Request, RequestHandle};
use crate::transport::{Transport, UreqTransport};
use self::cache_worker::CacheTask;
use self::dispatch::DispatchQueue;
use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use tracing::debug;

/// Default size of the network worker pool.
pub const DEFAULT_NETWORK_THREADS: usize = 4;

/// Read-only view of a request, handed to cancellation predicates and
/// finished listeners.
#[derive(Debug)]
pub struct RequestView<'a> {
  pub url: &'a str,
  pub cache_key: &'a str,
  pub tag: Option<&'a str>,
  pub sequence: u64,
}

/// State shared between the queue facade and its worker threads.
pub(crate) struct Shared {
  sequence: AtomicU64,
  current: Mutex<HashMap<u64, RequestHandle>>,
  /// Coalescing map. A key present with `None` means a request for it is in
  /// flight with no followers yet; `Some(queue)` holds the waiters.
  waiting: Mutex<HashMap<String, Option<VecDeque<RequestHandle>>>>,
  finished_listeners: Mutex<Vec<(u64, Box<dyn Fn(&RequestView<'_>) + Send + Sync>)>>,
  next_listener_id: AtomicU64,
  pub(crate) cache_queue: DispatchQueue<CacheTask>,
  pub(crate) network_queue: DispatchQueue<RequestHandle>,
  pub(crate) cache: Arc<dyn Cache>,
  pub(crate) transport: Arc<dyn Transport>,
  pub(crate) delivery: ResponseDelivery,
  pub(crate) pool: BufferPool,
}

impl Shared {
  pub(crate) fn enqueue_cache(&self, request: RequestHandle) {
    let (priority, sequence) = (request.core().priority(), request.core().sequence());
    self
      .cache_queue
      .push(priority, sequence, CacheTask::Request(request));
  }

  pub(crate) fn enqueue_network(&self, request: RequestHandle) {
    let (priority, sequence) = (request.core().priority(), request.core().sequence());
    self.network_queue.push(priority, sequence, request);
  }

  /// Finish bookkeeping: drop from tracking, notify listeners, and replay
  /// any coalesced waiters through the cache stage.
  pub(crate) fn finish(&self, request: &RequestHandle) {
    let core = request.core();
    self.current.lock().unwrap().remove(&core.sequence());

    {
      let listeners = self.finished_listeners.lock().unwrap();
      if !listeners.is_empty() {
        let view = RequestView {
          url: core.origin_url(),
          cache_key: core.cache_key(),
          tag: core.tag(),
          sequence: core.sequence(),
        };
        for (_, listener) in listeners.iter() {
          listener(&view);
        }
      }
    }

    if core.should_cache() {
      let waiters = self.waiting.lock().unwrap().remove(core.cache_key());
      if let Some(Some(waiters)) = waiters {
        debug!(
          key = core.cache_key(),
          count = waiters.len(),
          "releasing coalesced requests"
        );
        for waiter in waiters {
          self.enqueue_cache(waiter);
        }
      }
    }
  }
}

/// The pipeline facade: enqueue requests, control the worker lifecycle.
pub struct RequestQueue {
  shared: Arc<Shared>,
  network_threads: usize,
  workers: Mutex<WorkerSet>,
}

struct WorkerSet {
  quit: Option<Arc<AtomicBool>>,
  handles: Vec<JoinHandle<()>>,
}

impl RequestQueue {
  /// Starts (or restarts) the worker threads: one cache worker plus the
  /// configured network pool. Any previous generation is stopped first.
  pub fn start(&self) {
    self.stop();

    let mut workers = self.workers.lock().unwrap();
    let quit = Arc::new(AtomicBool::new(false));
    self.shared.cache_queue.open();
    self.shared.network_queue.open();

    let mut handles = Vec::with_capacity(self.network_threads + 1);
    handles.push(cache_worker::spawn(
      Arc::clone(&self.shared),
      Arc::clone(&quit),
    ));
    for index in 0..self.network_threads {
      handles.push(network_worker::spawn(
        Arc::clone(&self.shared),
        Arc::clone(&quit),
        index,
      ));
    }

    workers.quit = Some(quit);
    workers.handles = handles;
    debug!(network_threads = self.network_threads, "queue started");
  }

  /// Stops the workers. Idempotent; queued requests are retained and will
  /// dispatch after the next `start`.
  pub fn stop(&self) {
    let mut workers = self.workers.lock().unwrap();
    let Some(quit) = workers.quit.take() else {
      return;
    };
    quit.store(true, Ordering::SeqCst);
    self.shared.cache_queue.close();
    self.shared.network_queue.close();
    for handle in workers.handles.drain(..) {
      let _ = handle.join();
    }
    debug!("queue stopped");
  }

  /// Admits a request: binds it to this queue, assigns its sequence, and
  /// routes it to the right stage. Returns a handle the caller can keep for
  /// cancellation.
  pub fn add<T: Send + 'static>(&self, request: Request<T>) -> Arc<Request<T>> {
    let request = Arc::new(request);
    let handle: RequestHandle = Arc::clone(&request) as RequestHandle;
    let core = handle.core();

    core.bind_queue(Arc::downgrade(&self.shared));
    let sequence = self.shared.sequence.fetch_add(1, Ordering::SeqCst);
    core.assign_sequence(sequence);
    self
      .shared
      .current
      .lock()
      .unwrap()
      .insert(sequence, Arc::clone(&handle));
    debug!(url = %core.origin_url(), sequence, "add-to-queue");

    if !core.should_cache() {
      self.shared.enqueue_network(handle);
      return request;
    }

    let mut waiting = self.shared.waiting.lock().unwrap();
    match waiting.entry(core.cache_key().to_string()) {
      std::collections::hash_map::Entry::Occupied(mut in_flight) => {
        // Same key already in flight; hold this one until it finishes.
        debug!(key = core.cache_key(), "request held for in-flight twin");
        in_flight
          .get_mut()
          .get_or_insert_with(VecDeque::new)
          .push_back(handle);
      }
      std::collections::hash_map::Entry::Vacant(slot) => {
        slot.insert(None);
        drop(waiting);
        self.shared.enqueue_cache(handle);
      }
    }
    request
  }

  /// Cancels every tracked request matching the predicate.
  pub fn cancel_all_matching(&self, predicate: impl Fn(&RequestView<'_>) -> bool) {
    let current = self.shared.current.lock().unwrap();
    for request in current.values() {
      let core = request.core();
      let view = RequestView {
        url: core.origin_url(),
        cache_key: core.cache_key(),
        tag: core.tag(),
        sequence: core.sequence(),
      };
      if predicate(&view) {
        core.cancel();
      }
    }
  }

  /// Cancels every tracked request carrying `tag`.
  pub fn cancel_all(&self, tag: &str) {
    self.cancel_all_matching(|view| view.tag == Some(tag));
  }

  /// Registers a listener fired exactly once per finishing request.
  /// Returns an id for removal.
  pub fn add_finished_listener(
    &self,
    listener: impl Fn(&RequestView<'_>) + Send + Sync + 'static,
  ) -> u64 {
    let id = self.shared.next_listener_id.fetch_add(1, Ordering::SeqCst);
    self
      .shared
      .finished_listeners
      .lock()
      .unwrap()
      .push((id, Box::new(listener)));
    id
  }

  pub fn remove_finished_listener(&self, id: u64) {
    self
      .shared
      .finished_listeners
      .lock()
      .unwrap()
      .retain(|(listener_id, _)| *listener_id != id);
  }

  /// Empties the cache from the cache worker (so it serializes with request
  /// handling), then posts `on_cleared` to the delivery executor.
  pub fn clear_cache(&self, on_cleared: impl FnOnce() + Send + 'static) {
    let sequence = self.shared.sequence.fetch_add(1, Ordering::SeqCst);
    self.shared.cache_queue.push(
      crate::request::Priority::Immediate,
      sequence,
      CacheTask::Clear(Box::new(on_cleared)),
    );
  }

  /// The cache this queue reads and writes.
  pub fn cache(&self) -> &Arc<dyn Cache> {
    &self.shared.cache
  }
}

impl Drop for RequestQueue {
  fn drop(&mut self) {
    self.stop();
  }
}

/// Configures and builds a [`RequestQueue`].
pub struct QueueBuilder {
  transport: Option<Arc<dyn Transport>>,
  cache: Option<Arc<dyn Cache>>,
  cache_dir: Option<PathBuf>,
  max_disk_bytes: i64,
  network_threads: usize,
  executor: Option<Arc<dyn Executor>>,
  pool_bytes: usize,
}

impl QueueBuilder {
  pub fn new() -> Self {
    Self {
      transport: None,
      cache: None,
      cache_dir: None,
      max_disk_bytes: -1,
      network_threads: DEFAULT_NETWORK_THREADS,
      executor: None,
      pool_bytes: DEFAULT_POOL_BYTES,
    }
  }

  pub fn with_transport(mut self, transport: Arc<dyn Transport>) -> Self {
    self.transport = Some(transport);
    self
  }

  /// Substitutes a cache implementation; overrides `with_cache_dir`.
  pub fn with_cache(mut self, cache: Arc<dyn Cache>) -> Self {
    self.cache = Some(cache);
    self
  }

  /// Directory for the disk cache.
  pub fn with_cache_dir(mut self, cache_dir: impl Into<PathBuf>) -> Self {
    self.cache_dir = Some(cache_dir.into());
    self
  }

  /// Disk cache cap in bytes; negative means the default cap.
  pub fn with_max_disk_bytes(mut self, max_disk_bytes: i64) -> Self {
    self.max_disk_bytes = max_disk_bytes;
    self
  }

  pub fn with_network_threads(mut self, network_threads: usize) -> Self {
    self.network_threads = network_threads.max(1);
    self
  }

  /// Executor delivery callbacks run on. Defaults to a dedicated thread.
  pub fn with_executor(mut self, executor: Arc<dyn Executor>) -> Self {
    self.executor = Some(executor);
    self
  }

  pub fn with_pool_bytes(mut self, pool_bytes: usize) -> Self {
    self.pool_bytes = pool_bytes;
    self
  }

  /// Builds the queue without starting its workers.
  pub fn build(self) -> RequestQueue {
    let cache: Arc<dyn Cache> = match (self.cache, self.cache_dir) {
      (Some(cache), _) => cache,
      (None, Some(dir)) => {
        if self.max_disk_bytes < 0 {
          Arc::new(DiskCache::new(dir))
        } else {
          Arc::new(DiskCache::with_max_bytes(dir, self.max_disk_bytes as u64))
        }
      }
      (None, None) => Arc::new(NoopCache),
    };
    let transport = self
      .transport
      .unwrap_or_else(|| Arc::new(UreqTransport::new()));
    let executor = self
      .executor
      .unwrap_or_else(|| Arc::new(ThreadExecutor::new()));

    RequestQueue {
      shared: Arc::new(Shared {
        sequence: AtomicU64::new(0),
        current: Mutex::new(HashMap::new()),
        waiting: Mutex::new(HashMap::new()),
        finished_listeners: Mutex::new(Vec::new()),
        next_listener_id: AtomicU64::new(0),
        cache_queue: DispatchQueue::new(),
        network_queue: DispatchQueue::new(),
        cache,
        transport,
        delivery: ResponseDelivery::new(executor),
        pool: BufferPool::new(self.pool_bytes),
      }),
      network_threads: self.network_threads,
      workers: Mutex::new(WorkerSet {
        quit: None,
        handles: Vec::new(),
      }),
    }
  }

  /// Builds the queue and starts its workers.
  pub fn start(self) -> RequestQueue {
    let queue = self.build();
    queue.start();
    queue
  }
}

impl Default for QueueBuilder {
  fn default() -> Self {
    Self::new()
  }
}
