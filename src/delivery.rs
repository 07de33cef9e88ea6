//! Response delivery onto the caller's executor.
//!
//! Workers hand parsed responses and errors to [`ResponseDelivery`], which
//! submits one task per event to a caller-chosen [`Executor`]. Tasks run in
//! submission order, so an intermediate (soft-TTL) response is always
//! observed before the refreshed one, and per request the order is
//! deliver-then-finish.

use crate::request::{finish_request, RequestHandle};
use crate::response::ParseOutcome;
use std::sync::mpsc;
use std::sync::Mutex;
use std::thread::{self, JoinHandle};
use tracing::{debug, warn};

type Task = Box<dyn FnOnce() + Send>;

/// Where delivery tasks run. Implementations must execute tasks in
/// submission order for the ordering contract to hold.
pub trait Executor: Send + Sync {
  fn execute(&self, task: Task);
}

/// Runs tasks inline on the submitting thread. Handy for tests and for
/// callers that already marshal results themselves.
#[derive(Debug, Default)]
pub struct ImmediateExecutor;

impl Executor for ImmediateExecutor {
  fn execute(&self, task: Task) {
    task();
  }
}

/// A dedicated single-threaded executor, the default stand-in for a "main
/// thread". FIFO by construction.
pub struct ThreadExecutor {
  sender: Mutex<Option<mpsc::Sender<Task>>>,
  worker: Mutex<Option<JoinHandle<()>>>,
}

impl ThreadExecutor {
  pub fn new() -> Self {
    let (sender, receiver) = mpsc::channel::<Task>();
    let worker = thread::Builder::new()
      .name("fetchpipe-delivery".to_string())
      .spawn(move || {
        while let Ok(task) = receiver.recv() {
          task();
        }
      })
      .expect("spawn delivery thread");
    Self {
      sender: Mutex::new(Some(sender)),
      worker: Mutex::new(Some(worker)),
    }
  }
}

impl Default for ThreadExecutor {
  fn default() -> Self {
    Self::new()
  }
}

impl Executor for ThreadExecutor {
  fn execute(&self, task: Task) {
    let sender = self.sender.lock().unwrap();
    match sender.as_ref() {
      Some(sender) => {
        if sender.send(task).is_err() {
          warn!("delivery executor is gone; dropping task");
        }
      }
      None => warn!("delivery executor already shut down; dropping task"),
    }
  }
}

impl Drop for ThreadExecutor {
  fn drop(&mut self) {
    // Disconnect the channel so the worker drains and exits, then join.
    self.sender.lock().unwrap().take();
    if let Some(worker) = self.worker.lock().unwrap().take() {
      let _ = worker.join();
    }
  }
}

/// Posts responses and errors for a request onto the delivery executor.
pub(crate) struct ResponseDelivery {
  executor: std::sync::Arc<dyn Executor>,
}

impl ResponseDelivery {
  pub(crate) fn new(executor: std::sync::Arc<dyn Executor>) -> Self {
    Self { executor }
  }

  /// Submits a parsed response. `after` runs on the executor once the
  /// delivery task completes (used to re-enqueue a request after its
  /// intermediate response).
  pub(crate) fn post_response(
    &self,
    request: RequestHandle,
    response: crate::response::ParsedResponse,
    after: Option<Task>,
  ) {
    request.core().mark_delivered();
    debug!(url = %request.core().origin_url(), "post-response");
    self
      .executor
      .execute(Box::new(move || run_delivery(request, Ok(response), after)));
  }

  /// Submits a terminal error.
  pub(crate) fn post_error(&self, request: RequestHandle, error: crate::error::Error) {
    debug!(url = %request.core().origin_url(), error = %error, "post-error");
    self
      .executor
      .execute(Box::new(move || run_delivery(request, Err(error), None)));
  }

  /// Submits a bare task (administrative callbacks).
  pub(crate) fn post(&self, task: Task) {
    self.executor.execute(task);
  }
}

fn run_delivery(request: RequestHandle, outcome: ParseOutcome, after: Option<Task>) {
  // Cancellation observed here wins over any pending payload: no listener
  // fires, only the terminal bookkeeping.
  if request.core().is_canceled() {
    finish_request(&request, "canceled-at-delivery");
    return;
  }

  match outcome {
    Ok(response) => {
      let intermediate = response.intermediate;
      (response.deliver)();
      if intermediate {
        debug!(url = %request.core().origin_url(), "intermediate-response");
      } else {
        finish_request(&request, "done");
      }
    }
    Err(error) => {
      request.deliver_error(&error);
      finish_request(&request, "done");
    }
  }

  if let Some(after) = after {
    after();
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::sync::atomic::{AtomicUsize, Ordering};
  use std::sync::Arc;
  use std::time::Duration;

  #[test]
  fn thread_executor_runs_tasks_in_submission_order() {
    let executor = ThreadExecutor::new();
    let seen = Arc::new(Mutex::new(Vec::new()));
    let (done_tx, done_rx) = mpsc::channel();

    for index in 0..32 {
      let seen = Arc::clone(&seen);
      let done_tx = done_tx.clone();
      executor.execute(Box::new(move || {
        seen.lock().unwrap().push(index);
        if index == 31 {
          let _ = done_tx.send(());
        }
      }));
    }

    done_rx
      .recv_timeout(Duration::from_secs(5))
      .expect("tasks ran");
    assert_eq!(*seen.lock().unwrap(), (0..32).collect::<Vec<_>>());
  }

  #[test]
  fn drop_joins_after_draining() {
    let executor = ThreadExecutor::new();
    let count = Arc::new(AtomicUsize::new(0));
    for _ in 0..8 {
      let count = Arc::clone(&count);
      executor.execute(Box::new(move || {
        count.fetch_add(1, Ordering::SeqCst);
      }));
    }
    drop(executor);
    assert_eq!(count.load(Ordering::SeqCst), 8);
  }

  #[test]
  fn immediate_executor_runs_inline() {
    let executor = ImmediateExecutor;
    let (tx, rx) = mpsc::channel();
    executor.execute(Box::new(move || {
      let _ = tx.send(());
    }));
    assert!(rx.try_recv().is_ok(), "task ran before execute returned");
  }
}
