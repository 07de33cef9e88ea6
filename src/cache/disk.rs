//! Disk-backed response cache: one file per entry in a flat directory, with
//! an in-memory access-ordered header index and a size-capped LRU eviction
//! policy.
//!
//! Each file carries a hand-rolled little-endian header (magic, key, cache
//! metadata, response headers) followed by the raw body bytes. Any read
//! fault (bad magic, truncation, key mismatch from a filename collision) is
//! treated as a corrupt entry: the file is deleted and the lookup answers
//! "absent".

use super::{Cache, CacheEntry};
use lru::LruCache;
use std::collections::HashMap;
use std::fs::{self, File};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::{debug, error, warn};

/// Default cap on total bytes kept on disk.
pub const DEFAULT_MAX_BYTES: u64 = 5 * 1024 * 1024;

/// Sentinel prefix of every cache file.
const CACHE_MAGIC: u32 = 0x4650_4331;

/// Fraction of the cap pruning shrinks to, so each insert does not re-prune.
const HYSTERESIS_FACTOR: f32 = 0.9;

/// Persistent `key -> CacheEntry` store.
///
/// All public methods serialize on one internal lock; the index is not a
/// concurrent structure. [`Cache::initialize`] scans the cache directory
/// once and must complete before lookups are answered (the cache worker
/// guarantees this ordering).
pub struct DiskCache {
  root: PathBuf,
  max_bytes: u64,
  state: Mutex<IndexState>,
}

struct IndexState {
  /// Header index in access order. `get` refreshes recency; eviction pops
  /// from the least-recently-used end.
  entries: LruCache<String, EntryHeader>,
  total_size: u64,
  initialized: bool,
}

/// On-disk entry metadata, mirrored in the in-memory index.
#[derive(Clone, Debug)]
struct EntryHeader {
  key: String,
  etag: Option<String>,
  server_date: i64,
  last_modified: i64,
  ttl: i64,
  soft_ttl: i64,
  response_headers: HashMap<String, String>,
  /// Total file length, header bytes included.
  size: u64,
}

impl DiskCache {
  /// Creates a cache rooted at `root` with the default size cap.
  pub fn new(root: impl Into<PathBuf>) -> Self {
    Self::with_max_bytes(root, DEFAULT_MAX_BYTES)
  }

  /// Creates a cache rooted at `root` capped at `max_bytes` total.
  pub fn with_max_bytes(root: impl Into<PathBuf>, max_bytes: u64) -> Self {
    Self {
      root: root.into(),
      max_bytes,
      state: Mutex::new(IndexState {
        entries: LruCache::unbounded(),
        total_size: 0,
        initialized: false,
      }),
    }
  }

  /// Total bytes currently accounted to the cache.
  pub fn total_size(&self) -> u64 {
    self.lock().total_size
  }

  /// Number of indexed entries.
  pub fn entry_count(&self) -> usize {
    self.lock().entries.len()
  }

  fn lock(&self) -> std::sync::MutexGuard<'_, IndexState> {
    self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
  }

  /// Deterministic, collision-tolerant file name for a cache key: the
  /// decimal string hashes of each key half, concatenated. Distinct keys
  /// that collide read back as corrupt entries and are dropped.
  fn filename_for(key: &str) -> String {
    fn segment_hash(bytes: &[u8]) -> i32 {
      bytes
        .iter()
        .fold(0i32, |hash, byte| hash.wrapping_mul(31).wrapping_add(*byte as i32))
    }

    let (front, back) = key.as_bytes().split_at(key.len() / 2);
    format!("{}{}", segment_hash(front), segment_hash(back))
  }

  fn path_for(&self, key: &str) -> PathBuf {
    self.root.join(Self::filename_for(key))
  }

  fn get_locked(&self, state: &mut IndexState, key: &str) -> Option<CacheEntry> {
    // The lookup itself refreshes recency.
    let expected_size = state.entries.get(key)?.size;
    let path = self.path_for(key);
    match read_entry(&path, key, expected_size) {
      Ok(entry) => Some(entry),
      Err(err) => {
        warn!(key, error = %err, "dropping unreadable cache entry");
        self.remove_locked(state, key);
        None
      }
    }
  }

  fn put_locked(&self, state: &mut IndexState, key: &str, entry: CacheEntry) {
    self.prune_locked(state, entry.data.len() as u64);

    let path = self.path_for(key);
    match write_entry(&path, key, &entry) {
      Ok(size) => {
        let header = EntryHeader {
          key: key.to_string(),
          etag: entry.etag,
          server_date: entry.server_date,
          last_modified: entry.last_modified,
          ttl: entry.ttl,
          soft_ttl: entry.soft_ttl,
          response_headers: entry.response_headers,
          size,
        };
        if let Some(previous) = state.entries.put(key.to_string(), header) {
          state.total_size = state.total_size.saturating_sub(previous.size);
        }
        state.total_size = state.total_size.saturating_add(size);
      }
      Err(err) => {
        warn!(key, error = %err, "failed to write cache entry");
        let _ = fs::remove_file(&path);
      }
    }
  }

  fn remove_locked(&self, state: &mut IndexState, key: &str) {
    let _ = fs::remove_file(self.path_for(key));
    if let Some(header) = state.entries.pop(key) {
      state.total_size = state.total_size.saturating_sub(header.size);
    }
  }

  /// Evicts least-recently-used entries until `needed` more bytes fit
  /// comfortably under the cap.
  fn prune_locked(&self, state: &mut IndexState, needed: u64) {
    if state.total_size + needed < self.max_bytes {
      return;
    }

    let before = state.total_size;
    let mut pruned = 0usize;
    while (state.total_size + needed) as f32 >= self.max_bytes as f32 * HYSTERESIS_FACTOR {
      let Some((key, header)) = state.entries.pop_lru() else {
        break;
      };
      let _ = fs::remove_file(self.path_for(&key));
      state.total_size = state.total_size.saturating_sub(header.size);
      pruned += 1;
    }
    debug!(
      pruned,
      freed = before - state.total_size,
      total = state.total_size,
      "pruned cache"
    );
  }
}

impl Cache for DiskCache {
  fn initialize(&self) {
    let mut state = self.lock();
    if state.initialized {
      return;
    }
    state.initialized = true;

    if !self.root.exists() {
      if let Err(err) = fs::create_dir_all(&self.root) {
        error!(root = %self.root.display(), error = %err, "unable to create cache directory");
      }
      return;
    }

    let entries = match fs::read_dir(&self.root) {
      Ok(entries) => entries,
      Err(err) => {
        error!(root = %self.root.display(), error = %err, "unable to scan cache directory");
        return;
      }
    };

    for dir_entry in entries.flatten() {
      let path = dir_entry.path();
      match read_header(&path) {
        Ok(header) => {
          state.total_size = state.total_size.saturating_add(header.size);
          state.entries.put(header.key.clone(), header);
        }
        Err(err) => {
          warn!(path = %path.display(), error = %err, "removing unreadable cache file");
          let _ = fs::remove_file(&path);
        }
      }
    }
    debug!(
      entries = state.entries.len(),
      total = state.total_size,
      "cache index built"
    );
  }

  fn get(&self, key: &str) -> Option<CacheEntry> {
    let mut state = self.lock();
    self.get_locked(&mut state, key)
  }

  fn put(&self, key: &str, entry: CacheEntry) {
    let mut state = self.lock();
    self.put_locked(&mut state, key, entry);
  }

  fn invalidate(&self, key: &str, full_expire: bool) {
    // Read-modify-write: the subsequent `get` must observe the dropped
    // TTLs, and the file must stay in sync with the index.
    let mut state = self.lock();
    if let Some(mut entry) = self.get_locked(&mut state, key) {
      entry.soft_ttl = 0;
      if full_expire {
        entry.ttl = 0;
      }
      self.put_locked(&mut state, key, entry);
    }
  }

  fn remove(&self, key: &str) {
    let mut state = self.lock();
    self.remove_locked(&mut state, key);
  }

  fn clear(&self) {
    let mut state = self.lock();
    if let Ok(entries) = fs::read_dir(&self.root) {
      for dir_entry in entries.flatten() {
        let _ = fs::remove_file(dir_entry.path());
      }
    }
    state.entries.clear();
    state.total_size = 0;
    debug!("cache cleared");
  }
}

/// Reads only the header of a cache file; the index never needs bodies.
fn read_header(path: &Path) -> io::Result<EntryHeader> {
  let file = File::open(path)?;
  let size = file.metadata()?.len();
  let mut reader = BufReader::new(file);
  EntryHeader::read(&mut reader, size)
}

fn read_entry(path: &Path, key: &str, expected_size: u64) -> io::Result<CacheEntry> {
  let file = File::open(path)?;
  let file_size = file.metadata()?.len();
  if file_size != expected_size {
    return Err(invalid_data("cache file length changed underneath the index"));
  }

  let mut reader = BufReader::new(file);
  let header = EntryHeader::read(&mut reader, file_size)?;
  if header.key != key {
    return Err(invalid_data("cache file holds a different key"));
  }

  let mut data = Vec::new();
  reader.read_to_end(&mut data)?;
  Ok(CacheEntry {
    data,
    etag: header.etag,
    server_date: header.server_date,
    last_modified: header.last_modified,
    ttl: header.ttl,
    soft_ttl: header.soft_ttl,
    response_headers: header.response_headers,
  })
}

/// Writes header plus body, returning the resulting file length. A failure
/// leaves no partial entry behind: the caller deletes the file.
fn write_entry(path: &Path, key: &str, entry: &CacheEntry) -> io::Result<u64> {
  let file = File::create(path)?;
  let mut writer = BufWriter::new(file);

  write_u32(&mut writer, CACHE_MAGIC)?;
  write_string(&mut writer, key)?;
  write_string(&mut writer, entry.etag.as_deref().unwrap_or(""))?;
  write_u64(&mut writer, entry.server_date as u64)?;
  write_u64(&mut writer, entry.last_modified as u64)?;
  write_u64(&mut writer, entry.ttl as u64)?;
  write_u64(&mut writer, entry.soft_ttl as u64)?;
  write_u32(&mut writer, entry.response_headers.len() as u32)?;
  for (name, value) in &entry.response_headers {
    write_string(&mut writer, name)?;
    write_string(&mut writer, value)?;
  }
  writer.write_all(&entry.data)?;
  writer.flush()?;

  let written = writer.get_ref().metadata()?.len();
  Ok(written)
}

impl EntryHeader {
  /// Reads the header portion of a cache file. `file_size` bounds string
  /// lengths so a corrupt length prefix cannot trigger a huge allocation.
  fn read<R: Read>(reader: &mut R, file_size: u64) -> io::Result<Self> {
    let magic = read_u32(reader)?;
    if magic != CACHE_MAGIC {
      return Err(invalid_data("bad magic"));
    }

    let key = read_string(reader, file_size)?;
    let etag = read_string(reader, file_size)?;
    let server_date = read_u64(reader)? as i64;
    let last_modified = read_u64(reader)? as i64;
    let ttl = read_u64(reader)? as i64;
    let soft_ttl = read_u64(reader)? as i64;

    let header_count = read_u32(reader)?;
    let mut response_headers = HashMap::with_capacity(header_count as usize);
    for _ in 0..header_count {
      let name = read_string(reader, file_size)?;
      let value = read_string(reader, file_size)?;
      response_headers.insert(name, value);
    }

    Ok(Self {
      key,
      etag: if etag.is_empty() { None } else { Some(etag) },
      server_date,
      last_modified,
      ttl,
      soft_ttl,
      response_headers,
      size: file_size,
    })
  }
}

fn invalid_data(message: &str) -> io::Error {
  io::Error::new(io::ErrorKind::InvalidData, message.to_string())
}

// Integer reads hitting EOF must fault, never return a sentinel; read_exact
// gives exactly that.

fn read_u32<R: Read>(reader: &mut R) -> io::Result<u32> {
  let mut buf = [0u8; 4];
  reader.read_exact(&mut buf)?;
  Ok(u32::from_le_bytes(buf))
}

fn read_u64<R: Read>(reader: &mut R) -> io::Result<u64> {
  let mut buf = [0u8; 8];
  reader.read_exact(&mut buf)?;
  Ok(u64::from_le_bytes(buf))
}

fn read_string<R: Read>(reader: &mut R, max_len: u64) -> io::Result<String> {
  let len = read_u64(reader)?;
  if len > max_len {
    return Err(invalid_data("string length exceeds file size"));
  }
  let mut buf = vec![0u8; len as usize];
  reader.read_exact(&mut buf)?;
  String::from_utf8(buf).map_err(|_| invalid_data("string is not UTF-8"))
}

fn write_u32<W: Write>(writer: &mut W, value: u32) -> io::Result<()> {
  writer.write_all(&value.to_le_bytes())
}

fn write_u64<W: Write>(writer: &mut W, value: u64) -> io::Result<()> {
  writer.write_all(&value.to_le_bytes())
}

fn write_string<W: Write>(writer: &mut W, value: &str) -> io::Result<()> {
  write_u64(writer, value.len() as u64)?;
  writer.write_all(value.as_bytes())
}
