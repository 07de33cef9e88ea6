//! fetchpipe: a client-side HTTP request pipeline.
//!
//! Typed requests are admitted to a [`RequestQueue`], scheduled by priority,
//! de-duplicated against identical in-flight requests, answered from a
//! two-tier (in-memory index + on-disk body) cache when fresh, revalidated
//! or fetched through a worker pool with retry/backoff and redirect
//! handling, and delivered back through listener callbacks on a
//! caller-chosen executor.
//!
//! ```rust,ignore
//! let queue = fetchpipe::new_queue("/tmp/http-cache");
//! queue.add(
//!   fetchpipe::Request::string(fetchpipe::Method::Get, "https://example.com/")
//!     .on_response(|body| println!("{} bytes", body.len()))
//!     .on_error(|err| eprintln!("failed: {err}"))
//!     .build(),
//! );
//! ```

pub mod cache;
pub mod delivery;
pub mod error;
pub mod headers;
pub mod pool;
pub mod queue;
pub mod request;
pub mod requests;
pub mod response;
pub mod retry;
pub mod transport;

pub use cache::disk::DiskCache;
pub use cache::{Cache, CacheEntry, NoopCache};
pub use delivery::{Executor, ImmediateExecutor, ThreadExecutor};
pub use error::{Error, ErrorKind, Result};
pub use pool::BufferPool;
pub use queue::{QueueBuilder, RequestQueue, RequestView, DEFAULT_NETWORK_THREADS};
pub use request::{Method, Priority, Request, RequestBuilder};
pub use response::{NetworkResponse, Parsed};
pub use retry::{DefaultRetryPolicy, RetryPolicy};
pub use transport::{RawResponse, Transport, TransportRequest, UreqTransport};

use std::path::Path;

/// Creates and starts a queue with the stock transport, a disk cache rooted
/// at `cache_dir`, the default worker pool, and a dedicated delivery
/// thread. Use [`QueueBuilder`] for anything fancier.
pub fn new_queue(cache_dir: impl AsRef<Path>) -> RequestQueue {
  QueueBuilder::new()
    .with_cache_dir(cache_dir.as_ref())
    .start()
}
