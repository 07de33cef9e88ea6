//! Blocking priority queue shared between the scheduler and its workers.
//!
//! Ordering is priority-descending, then sequence-ascending (FIFO within a
//! priority). `take` blocks until a task arrives or the queue is closed;
//! closing stands in for thread interruption and wakes every blocked
//! worker. Tasks pushed while closed are retained and dispatched after the
//! queue reopens, so requests enqueued on a stopped pipeline survive a
//! restart.

use crate::request::Priority;
use std::cmp::Ordering as CmpOrdering;
use std::collections::BinaryHeap;
use std::sync::{Condvar, Mutex};

pub(crate) struct DispatchQueue<T> {
  state: Mutex<Inner<T>>,
  ready: Condvar,
}

struct Inner<T> {
  heap: BinaryHeap<Item<T>>,
  closed: bool,
}

struct Item<T> {
  priority: Priority,
  sequence: u64,
  task: T,
}

impl<T> PartialEq for Item<T> {
  fn eq(&self, other: &Self) -> bool {
    self.priority == other.priority && self.sequence == other.sequence
  }
}

impl<T> Eq for Item<T> {}

impl<T> PartialOrd for Item<T> {
  fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
    Some(self.cmp(other))
  }
}

impl<T> Ord for Item<T> {
  fn cmp(&self, other: &Self) -> CmpOrdering {
    // Max-heap: higher priority first, lower sequence first within a tie.
    self
      .priority
      .cmp(&other.priority)
      .then_with(|| other.sequence.cmp(&self.sequence))
  }
}

impl<T> DispatchQueue<T> {
  pub(crate) fn new() -> Self {
    Self {
      state: Mutex::new(Inner {
        heap: BinaryHeap::new(),
        closed: true,
      }),
      ready: Condvar::new(),
    }
  }

  pub(crate) fn push(&self, priority: Priority, sequence: u64, task: T) {
    let mut inner = self.state.lock().unwrap();
    inner.heap.push(Item {
      priority,
      sequence,
      task,
    });
    drop(inner);
    self.ready.notify_one();
  }

  /// Blocks for the next task. Returns `None` once the queue is closed.
  pub(crate) fn take(&self) -> Option<T> {
    let mut inner = self.state.lock().unwrap();
    loop {
      if inner.closed {
        return None;
      }
      if let Some(item) = inner.heap.pop() {
        return Some(item.task);
      }
      inner = self.ready.wait(inner).unwrap();
    }
  }

  /// Wakes every blocked `take` and makes subsequent takes return `None`.
  /// Queued tasks are retained.
  pub(crate) fn close(&self) {
    self.state.lock().unwrap().closed = true;
    self.ready.notify_all();
  }

  /// Re-arms the queue after a `close`.
  pub(crate) fn open(&self) {
    self.state.lock().unwrap().closed = false;
    self.ready.notify_all();
  }

  #[cfg(test)]
  pub(crate) fn len(&self) -> usize {
    self.state.lock().unwrap().heap.len()
  }
}
