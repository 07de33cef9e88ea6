//! Ready-made typed requests.
//!
//! Each constructor wires a parser for a common payload shape and leaves
//! the rest to [`RequestBuilder`]. Cache entries are derived from the
//! response's standard cache headers.

use crate::error::ErrorKind;
use crate::request::{Method, Request, RequestBuilder};
use crate::response::{NetworkResponse, Parsed};
use encoding_rs::{Encoding, UTF_8};

impl Request<String> {
  /// A request whose body is decoded to text using the response's declared
  /// charset (UTF-8 when unspecified), with invalid sequences replaced.
  pub fn string(method: Method, url: impl Into<String>) -> RequestBuilder<String> {
    Request::with_parser(method, url, |response| {
      Ok(Parsed::with_cache_headers(decode_body(response), response))
    })
  }
}

impl Request<serde_json::Value> {
  /// A request whose body is parsed as JSON.
  pub fn json(method: Method, url: impl Into<String>) -> RequestBuilder<serde_json::Value> {
    Request::with_parser(method, url, |response| {
      let value = serde_json::from_slice(&response.data)
        .map_err(|err| ErrorKind::Parse(err.to_string()))?;
      Ok(Parsed::with_cache_headers(value, response))
    })
  }
}

impl Request<Vec<u8>> {
  /// A request that delivers the raw body bytes.
  pub fn bytes(method: Method, url: impl Into<String>) -> RequestBuilder<Vec<u8>> {
    Request::with_parser(method, url, |response| {
      Ok(Parsed::with_cache_headers(response.data.clone(), response))
    })
  }
}

fn decode_body(response: &NetworkResponse) -> String {
  let encoding = response
    .header("Content-Type")
    .and_then(charset_from_content_type)
    .and_then(|label| Encoding::for_label(label.as_bytes()))
    .unwrap_or(UTF_8);
  let (text, _, _) = encoding.decode(&response.data);
  text.into_owned()
}

fn charset_from_content_type(content_type: &str) -> Option<&str> {
  content_type.split(';').skip(1).find_map(|param| {
    let (name, value) = param.split_once('=')?;
    if name.trim().eq_ignore_ascii_case("charset") {
      Some(value.trim().trim_matches('"'))
    } else {
      None
    }
  })
}
