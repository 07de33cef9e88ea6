//! The HTTP transport seam.
//!
//! A [`Transport`] executes exactly one HTTP exchange. Redirects, retries,
//! and status classification all belong to the network stage. The crate
//! ships [`UreqTransport`] as the stock implementation; tests substitute
//! scripted ones.

use crate::error::{Error, ErrorKind, Result};
use std::collections::HashMap;
use std::io::{self, Cursor, Read};
use std::time::Duration;
use url::Url;

/// Everything a transport needs to know about one attempt. The timeout is
/// re-read from the retry policy before every attempt, so backoff is
/// visible here.
pub struct TransportRequest<'a> {
  /// Resolved HTTP verb.
  pub method: &'static str,
  /// Current URL (the redirect target once one has been followed).
  pub url: &'a str,
  /// Caller-supplied headers.
  pub headers: &'a HashMap<String, String>,
  /// Request body, if any.
  pub body: Option<&'a [u8]>,
  /// Content type for `body`.
  pub body_content_type: Option<&'a str>,
  /// Timeout this attempt must respect.
  pub timeout: Duration,
}

/// A raw exchange result. `body` is `None` when the server sent no entity
/// (304, HEAD); the network stage assembles present bodies through its
/// buffer pool.
pub struct RawResponse {
  pub status: u16,
  pub headers: Vec<(String, String)>,
  pub body: Option<Box<dyn Read + Send>>,
}

impl std::fmt::Debug for RawResponse {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("RawResponse")
      .field("status", &self.status)
      .field("headers", &self.headers)
      .field("body", &self.body.as_ref().map(|_| "<body>"))
      .finish()
  }
}

/// Executes one HTTP exchange.
pub trait Transport: Send + Sync {
  /// Performs the request with `extra_headers` (conditional-request headers
  /// built by the network stage) appended.
  ///
  /// Fails with [`ErrorKind::Timeout`] on socket/connect timeouts,
  /// [`ErrorKind::BadUrl`] on malformed URLs, and
  /// [`ErrorKind::NoConnection`] when no response could be obtained.
  fn perform(
    &self,
    request: &TransportRequest<'_>,
    extra_headers: &[(String, String)],
  ) -> Result<RawResponse>;
}

/// Default transport backed by `ureq`.
#[derive(Debug, Clone)]
pub struct UreqTransport {
  user_agent: String,
  max_body_bytes: u64,
}

impl UreqTransport {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn with_user_agent(mut self, user_agent: impl Into<String>) -> Self {
    self.user_agent = user_agent.into();
    self
  }

  /// Caps how many response bytes are read before the exchange fails.
  pub fn with_max_body_bytes(mut self, max_body_bytes: u64) -> Self {
    self.max_body_bytes = max_body_bytes;
    self
  }
}

impl Default for UreqTransport {
  fn default() -> Self {
    Self {
      user_agent: concat!("fetchpipe/", env!("CARGO_PKG_VERSION")).to_string(),
      max_body_bytes: 50 * 1024 * 1024,
    }
  }
}

impl Transport for UreqTransport {
  fn perform(
    &self,
    request: &TransportRequest<'_>,
    extra_headers: &[(String, String)],
  ) -> Result<RawResponse> {
    Url::parse(request.url)
      .map_err(|err| ErrorKind::BadUrl(format!("{}: {err}", request.url)))?;

    // A fresh agent per attempt keeps the per-attempt timeout exact; the
    // retry policy mutates it between attempts.
    let config = ureq::Agent::config_builder()
      .timeout_global(Some(request.timeout))
      .max_redirects(0)
      .http_status_as_error(false)
      .build();
    let agent: ureq::Agent = config.into();

    let mut builder = ureq::http::Request::builder()
      .method(request.method)
      .uri(request.url)
      .header("User-Agent", self.user_agent.as_str());
    for (name, value) in request.headers {
      builder = builder.header(name.as_str(), value.as_str());
    }
    for (name, value) in extra_headers {
      builder = builder.header(name.as_str(), value.as_str());
    }
    if let Some(content_type) = request.body_content_type {
      builder = builder.header("Content-Type", content_type);
    }

    let http_request = builder
      .body(request.body.unwrap_or_default().to_vec())
      .map_err(|err| ErrorKind::BadUrl(err.to_string()))?;

    let mut response = agent.run(http_request).map_err(map_ureq_error)?;

    let status = response.status().as_u16();
    let mut headers = Vec::new();
    for (name, value) in response.headers() {
      if let Ok(value) = value.to_str() {
        headers.push((name.as_str().to_string(), value.to_string()));
      }
    }

    let bytes = response
      .body_mut()
      .with_config()
      .limit(self.max_body_bytes)
      .read_to_vec()
      .map_err(|_| Error::new(ErrorKind::Network(None)))?;

    let body: Option<Box<dyn Read + Send>> = if bytes.is_empty() {
      None
    } else {
      Some(Box::new(Cursor::new(bytes)))
    };

    Ok(RawResponse {
      status,
      headers,
      body,
    })
  }
}

fn map_ureq_error(err: ureq::Error) -> Error {
  match err {
    ureq::Error::Timeout(_) => ErrorKind::Timeout.into(),
    ureq::Error::Io(io_err)
      if matches!(
        io_err.kind(),
        io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock
      ) =>
    {
      ErrorKind::Timeout.into()
    }
    ureq::Error::Io(io_err) => ErrorKind::NoConnection(io_err).into(),
    ureq::Error::BadUri(uri) => ErrorKind::BadUrl(uri.to_string()).into(),
    other => {
      ErrorKind::NoConnection(io::Error::new(io::ErrorKind::Other, other.to_string())).into()
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::io::Write;
  use std::net::TcpListener;
  use std::sync::{Arc, Mutex};
  use std::thread;

  fn serve_once(response: &'static [u8]) -> (String, thread::JoinHandle<String>) {
    let listener = TcpListener::bind("127.0.0.1:0").expect("bind test server");
    let addr = listener.local_addr().unwrap();
    let handle = thread::spawn(move || {
      let mut captured = String::new();
      if let Some(stream) = listener.incoming().next() {
        let mut stream = stream.unwrap();
        let mut buf = [0u8; 2048];
        if let Ok(read) = Read::read(&mut stream, &mut buf) {
          captured = String::from_utf8_lossy(&buf[..read]).to_string();
        }
        let _ = stream.write_all(response);
      }
      captured
    });
    (format!("http://{addr}/"), handle)
  }

  fn transport_request<'a>(url: &'a str, headers: &'a HashMap<String, String>) -> TransportRequest<'a> {
    TransportRequest {
      method: "GET",
      url,
      headers,
      body: None,
      body_content_type: None,
      timeout: Duration::from_secs(5),
    }
  }

  #[test]
  fn performs_basic_get() {
    let (url, server) = serve_once(
      b"HTTP/1.1 200 OK\r\nContent-Type: text/plain\r\nContent-Length: 2\r\nConnection: close\r\n\r\nok",
    );
    let headers = HashMap::new();
    let transport = UreqTransport::new();
    let response = transport
      .perform(&transport_request(&url, &headers), &[])
      .expect("exchange");
    server.join().unwrap();

    assert_eq!(response.status, 200);
    assert!(response
      .headers
      .iter()
      .any(|(name, value)| name.eq_ignore_ascii_case("content-type") && value == "text/plain"));
    let mut body = Vec::new();
    response.body.expect("body").read_to_end(&mut body).unwrap();
    assert_eq!(body, b"ok");
  }

  #[test]
  fn sends_extra_headers_without_following_redirects() {
    let (url, server) = serve_once(
      b"HTTP/1.1 302 Found\r\nLocation: /elsewhere\r\nContent-Length: 0\r\nConnection: close\r\n\r\n",
    );
    let headers = HashMap::new();
    let transport = UreqTransport::new();
    let response = transport
      .perform(
        &transport_request(&url, &headers),
        &[("If-None-Match".to_string(), "\"v1\"".to_string())],
      )
      .expect("exchange");
    let request_text = server.join().unwrap().to_lowercase();

    assert_eq!(response.status, 302, "redirect is surfaced, not followed");
    assert!(
      request_text.contains("if-none-match: \"v1\""),
      "conditional header missing: {request_text}"
    );
  }

  #[test]
  fn malformed_url_is_a_bad_url_error() {
    let headers = HashMap::new();
    let transport = UreqTransport::new();
    let err = transport
      .perform(&transport_request("not a url", &headers), &[])
      .expect_err("must fail");
    assert!(matches!(err.kind(), ErrorKind::BadUrl(_)));
  }

  #[test]
  fn connection_refused_is_no_connection() {
    // Bind then drop to find a port with nothing listening.
    let port = {
      let listener = TcpListener::bind("127.0.0.1:0").unwrap();
      listener.local_addr().unwrap().port()
    };
    let url = format!("http://127.0.0.1:{port}/");
    let headers = HashMap::new();
    let transport = UreqTransport::new();
    let err = transport
      .perform(&transport_request(&url, &headers), &[])
      .expect_err("must fail");
    assert!(
      matches!(err.kind(), ErrorKind::NoConnection(_)),
      "unexpected kind: {:?}",
      err.kind()
    );
  }

  #[test]
  fn timeout_maps_to_timeout_error() {
    let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
    let addr = listener.local_addr().unwrap();
    let accepted: Arc<Mutex<Vec<std::net::TcpStream>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&accepted);
    let server = thread::spawn(move || {
      // Accept but never respond, holding the connection open.
      if let Ok((stream, _)) = listener.accept() {
        sink.lock().unwrap().push(stream);
      }
    });

    let url = format!("http://{addr}/");
    let headers = HashMap::new();
    let transport = UreqTransport::new();
    let mut request = transport_request(&url, &headers);
    request.timeout = Duration::from_millis(200);
    let err = transport.perform(&request, &[]).expect_err("must time out");
    server.join().unwrap();
    assert!(
      matches!(err.kind(), ErrorKind::Timeout),
      "unexpected kind: {:?}",
      err.kind()
    );
  }
}
