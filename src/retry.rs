//! Per-request retry and backoff policy.

use crate::error::{Error, Result};
use std::time::Duration;

/// Default per-attempt timeout.
pub const DEFAULT_TIMEOUT_MS: u64 = 2500;
/// Default number of retries (0 = a single attempt).
pub const DEFAULT_MAX_RETRIES: u32 = 0;
/// Default backoff multiplier (1.0 doubles the timeout per retry).
pub const DEFAULT_BACKOFF_MULTIPLIER: f32 = 1.0;

/// Stateful timeout/backoff policy owned by a single request.
///
/// The network stage consults [`RetryPolicy::current_timeout`] before every
/// attempt and hands retriable errors to [`RetryPolicy::retry`], which
/// either mutates state for another attempt or gives the error back as the
/// final outcome.
pub trait RetryPolicy: Send {
  /// Timeout the transport must apply to the next attempt.
  fn current_timeout(&self) -> Duration;

  /// Number of retries performed so far.
  fn current_retry_count(&self) -> u32;

  /// Records a failed attempt. Returns `Ok(())` when another attempt should
  /// be made, or `Err(error)` when the budget is exhausted.
  fn retry(&mut self, error: Error) -> Result<()>;
}

/// The stock policy: fixed retry budget with multiplicative backoff.
pub struct DefaultRetryPolicy {
  current_timeout_ms: u64,
  current_retry_count: u32,
  max_retries: u32,
  backoff_multiplier: f32,
}

impl DefaultRetryPolicy {
  pub fn new(initial_timeout_ms: u64, max_retries: u32, backoff_multiplier: f32) -> Self {
    Self {
      current_timeout_ms: initial_timeout_ms,
      current_retry_count: 0,
      max_retries,
      backoff_multiplier,
    }
  }

  fn has_attempt_remaining(&self) -> bool {
    self.current_retry_count <= self.max_retries
  }
}

impl Default for DefaultRetryPolicy {
  fn default() -> Self {
    Self::new(
      DEFAULT_TIMEOUT_MS,
      DEFAULT_MAX_RETRIES,
      DEFAULT_BACKOFF_MULTIPLIER,
    )
  }
}

impl RetryPolicy for DefaultRetryPolicy {
  fn current_timeout(&self) -> Duration {
    Duration::from_millis(self.current_timeout_ms)
  }

  fn current_retry_count(&self) -> u32 {
    self.current_retry_count
  }

  fn retry(&mut self, error: Error) -> Result<()> {
    self.current_retry_count += 1;
    // The timeout grows before the attempt check: a rejected final retry
    // still leaves the mutated timeout observable.
    self.current_timeout_ms +=
      (self.current_timeout_ms as f32 * self.backoff_multiplier) as u64;
    if !self.has_attempt_remaining() {
      return Err(error);
    }
    Ok(())
  }
}
