//! Error types for the request pipeline.
//!
//! The taxonomy mirrors what the dispatch loop needs to decide: retriable
//! errors ([`ErrorKind::Timeout`], [`ErrorKind::AuthFailure`],
//! [`ErrorKind::Redirect`]) are routed through the request's retry policy,
//! everything else is terminal and delivered to the caller as-is.

use crate::response::NetworkResponse;
use std::fmt;
use std::io;
use thiserror::Error;

/// Result type alias for pipeline operations.
pub type Result<T> = std::result::Result<T, Error>;

/// An error surfaced by the pipeline, annotated with how long the request
/// spent in the network stage before failing.
#[derive(Debug)]
pub struct Error {
  kind: ErrorKind,
  network_time_ms: Option<u64>,
}

/// What went wrong.
#[derive(Debug, Error)]
pub enum ErrorKind {
  /// Socket or connect timeout. Retriable.
  #[error("socket or connect timeout")]
  Timeout,

  /// I/O failure before any HTTP response was obtained. Terminal.
  #[error("connection failed: {0}")]
  NoConnection(#[source] io::Error),

  /// An HTTP response arrived but its body could not be captured. Terminal.
  #[error("network failure while reading the response body")]
  Network(Option<NetworkResponse>),

  /// 401 or 403. Retriable, so an auth layer gets a chance to refresh
  /// credentials between attempts.
  #[error("authentication failure (status {})", .0.status_code)]
  AuthFailure(NetworkResponse),

  /// 301 or 302, observed after the request's URL has already been pointed
  /// at the Location target. Retriable.
  #[error("redirected (status {})", .0.status_code)]
  Redirect(NetworkResponse),

  /// Any other non-2xx status. Terminal.
  #[error("server error (status {})", .0.status_code)]
  Server(NetworkResponse),

  /// The response body could not be parsed into the request's result type.
  #[error("failed to parse response: {0}")]
  Parse(String),

  /// Malformed URL. A programmer error, surfaced without retry.
  #[error("malformed url: {0}")]
  BadUrl(String),

  /// Unexpected I/O failure inside the pipeline itself.
  #[error("i/o error: {0}")]
  Io(#[from] io::Error),
}

impl Error {
  pub fn new(kind: ErrorKind) -> Self {
    Self {
      kind,
      network_time_ms: None,
    }
  }

  pub fn kind(&self) -> &ErrorKind {
    &self.kind
  }

  /// Elapsed wall-clock time the request spent in the network stage, when
  /// the error was surfaced from there.
  pub fn network_time_ms(&self) -> Option<u64> {
    self.network_time_ms
  }

  pub(crate) fn with_network_time(mut self, elapsed_ms: u64) -> Self {
    self.network_time_ms = Some(elapsed_ms);
    self
  }

  /// The HTTP response attached to this error, if one was received.
  pub fn network_response(&self) -> Option<&NetworkResponse> {
    match &self.kind {
      ErrorKind::Network(response) => response.as_ref(),
      ErrorKind::AuthFailure(response)
      | ErrorKind::Redirect(response)
      | ErrorKind::Server(response) => Some(response),
      _ => None,
    }
  }
}

impl fmt::Display for Error {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    self.kind.fmt(f)
  }
}

impl std::error::Error for Error {
  fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
    std::error::Error::source(&self.kind)
  }
}

impl From<ErrorKind> for Error {
  fn from(kind: ErrorKind) -> Self {
    Self::new(kind)
  }
}

impl From<io::Error> for Error {
  fn from(err: io::Error) -> Self {
    Self::new(ErrorKind::Io(err))
  }
}
