//! Reusable byte buffers for response body assembly.
//!
//! The network stage reads bodies through scratch buffers; recycling them
//! through this pool amortizes allocation across requests. Buffers are held
//! in two orders at once (by size for lookup, by last use for eviction),
//! and the pool discards from the oldest-use end whenever its total exceeds
//! the configured limit.

use std::collections::VecDeque;
use std::io::{self, Read};
use std::sync::Mutex;

/// Default pool capacity in bytes.
pub const DEFAULT_POOL_BYTES: usize = 4096;

/// Size-bounded pool of byte buffers. All operations are mutually exclusive
/// on the pool.
pub struct BufferPool {
  state: Mutex<PoolState>,
  size_limit: usize,
}

struct PoolState {
  /// Buffers sorted by length, smallest first.
  by_size: Vec<Pooled>,
  /// Release stamps, oldest first. Same set as `by_size`.
  by_use: VecDeque<u64>,
  total: usize,
  next_stamp: u64,
}

struct Pooled {
  stamp: u64,
  buf: Vec<u8>,
}

impl BufferPool {
  pub fn new(size_limit: usize) -> Self {
    Self {
      state: Mutex::new(PoolState {
        by_size: Vec::new(),
        by_use: VecDeque::new(),
        total: 0,
        next_stamp: 0,
      }),
      size_limit,
    }
  }

  /// Returns the smallest pooled buffer of at least `min_len` bytes, or a
  /// freshly allocated buffer of exactly `min_len`. Contents are arbitrary.
  pub fn acquire(&self, min_len: usize) -> Vec<u8> {
    let mut state = self.lock();
    let index = state.by_size.partition_point(|pooled| pooled.buf.len() < min_len);
    if index < state.by_size.len() {
      let pooled = state.by_size.remove(index);
      state.total -= pooled.buf.len();
      if let Some(position) = state.by_use.iter().position(|stamp| *stamp == pooled.stamp) {
        state.by_use.remove(position);
      }
      return pooled.buf;
    }
    vec![0; min_len]
  }

  /// Returns a buffer to the pool. Foreign buffers are accepted; empty or
  /// over-limit buffers are discarded. Oldest buffers are dropped until the
  /// pooled total fits the limit again.
  pub fn release(&self, buf: Vec<u8>) {
    if buf.is_empty() || buf.len() > self.size_limit {
      return;
    }

    let mut state = self.lock();
    let stamp = state.next_stamp;
    state.next_stamp += 1;
    state.by_use.push_back(stamp);

    let len = buf.len();
    let index = state.by_size.partition_point(|pooled| pooled.buf.len() < len);
    state.by_size.insert(index, Pooled { stamp, buf });
    state.total += len;

    while state.total > self.size_limit {
      let Some(oldest) = state.by_use.pop_front() else {
        break;
      };
      if let Some(position) = state.by_size.iter().position(|pooled| pooled.stamp == oldest) {
        let evicted = state.by_size.remove(position);
        state.total -= evicted.buf.len();
      }
    }
  }

  /// Bytes currently held by the pool.
  pub fn pooled_bytes(&self) -> usize {
    self.lock().total
  }

  fn lock(&self) -> std::sync::MutexGuard<'_, PoolState> {
    self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
  }
}

/// Drains a reader into a fresh `Vec`, reading through a pooled scratch
/// buffer. The scratch buffer goes back to the pool on every path.
pub(crate) fn read_all<R: Read + ?Sized>(
  reader: &mut R,
  pool: &BufferPool,
  size_hint: usize,
) -> io::Result<Vec<u8>> {
  let mut scratch = pool.acquire(1024);
  let mut out = Vec::with_capacity(size_hint);
  let result = loop {
    match reader.read(&mut scratch) {
      Ok(0) => break Ok(out),
      Ok(read) => out.extend_from_slice(&scratch[..read]),
      Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
      Err(err) => break Err(err),
    }
  };
  pool.release(scratch);
  result
}
