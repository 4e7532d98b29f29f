//! Request and response snapshots passed through the cache worker.

use color_eyre::{eyre::eyre, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use url::Url;

/// An outbound request as seen by the interception boundary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
  pub method: String,
  pub url: Url,
}

impl Request {
  #[allow(dead_code)]
  pub fn get(url: Url) -> Self {
    Self::new("GET", url)
  }

  pub fn new(method: &str, url: Url) -> Self {
    Self {
      method: method.to_uppercase(),
      url,
    }
  }

  /// Parse a request target, resolving relative paths against `origin`.
  pub fn parse(method: &str, target: &str, origin: &Url) -> Result<Self> {
    let url = origin
      .join(target)
      .map_err(|e| eyre!("Invalid request target '{}': {}", target, e))?;
    Ok(Self::new(method, url))
  }

  /// Normalized request identity used as the store key.
  ///
  /// Method plus URL with the fragment removed.
  pub fn cache_key(&self) -> String {
    let mut url = self.url.clone();
    url.set_fragment(None);
    format!("{} {}", self.method, url)
  }

  pub fn host(&self) -> &str {
    self.url.host_str().unwrap_or_default()
  }
}

impl fmt::Display for Request {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{} {}", self.method, self.url)
  }
}

/// How the response relates to the app origin.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseKind {
  /// Same-origin response
  Basic,
  /// Cross-origin response with readable body
  Cors,
  /// Cross-origin response without readable body
  #[allow(dead_code)]
  Opaque,
  /// Built locally, never came from the network
  Synthetic,
}

impl ResponseKind {
  pub fn as_str(&self) -> &'static str {
    match self {
      Self::Basic => "basic",
      Self::Cors => "cors",
      Self::Opaque => "opaque",
      Self::Synthetic => "synthetic",
    }
  }

  pub fn parse(s: &str) -> Option<Self> {
    match s {
      "basic" => Some(Self::Basic),
      "cors" => Some(Self::Cors),
      "opaque" => Some(Self::Opaque),
      "synthetic" => Some(Self::Synthetic),
      _ => None,
    }
  }
}

/// Ordered header list with case-insensitive lookup.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Headers(Vec<(String, String)>);

impl Headers {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn get(&self, name: &str) -> Option<&str> {
    self
      .0
      .iter()
      .find(|(k, _)| k.eq_ignore_ascii_case(name))
      .map(|(_, v)| v.as_str())
  }

  /// Replace every value of `name` with a single value.
  pub fn set(&mut self, name: &str, value: &str) {
    self.0.retain(|(k, _)| !k.eq_ignore_ascii_case(name));
    self.0.push((name.to_string(), value.to_string()));
  }

  #[allow(dead_code)]
  pub fn append(&mut self, name: &str, value: &str) {
    self.0.push((name.to_string(), value.to_string()));
  }

  pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
    self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
  }
}

impl FromIterator<(String, String)> for Headers {
  fn from_iter<I: IntoIterator<Item = (String, String)>>(iter: I) -> Self {
    Self(iter.into_iter().collect())
  }
}

/// Immutable response snapshot.
///
/// The body is shared, so cloning a response never copies or consumes it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
  pub status: u16,
  pub status_text: String,
  pub headers: Headers,
  pub body: Arc<[u8]>,
  pub kind: ResponseKind,
}

pub const OFFLINE_BODY: &str = "Offline - Please check your connection";

impl Response {
  pub fn new(status: u16, body: impl Into<Arc<[u8]>>) -> Self {
    Self {
      status,
      status_text: reason_phrase(status).to_string(),
      headers: Headers::new(),
      body: body.into(),
      kind: ResponseKind::Basic,
    }
  }

  /// The response handed back when neither network nor store can answer.
  pub fn offline() -> Self {
    Self {
      status: 503,
      status_text: "Service Unavailable".to_string(),
      headers: Headers::from_iter([("Content-Type".to_string(), "text/plain".to_string())]),
      body: Arc::from(OFFLINE_BODY.as_bytes()),
      kind: ResponseKind::Synthetic,
    }
  }

  pub fn with_kind(mut self, kind: ResponseKind) -> Self {
    self.kind = kind;
    self
  }

  pub fn with_header(mut self, name: &str, value: &str) -> Self {
    self.headers.set(name, value);
    self
  }

  pub fn is_ok(&self) -> bool {
    (200..300).contains(&self.status)
  }

  /// Whether this response may be written to the store.
  ///
  /// Only complete (200) same-origin responses qualify; error statuses,
  /// partial content and cross-origin responses do not.
  pub fn is_cacheable(&self) -> bool {
    self.status == 200 && self.kind == ResponseKind::Basic
  }

  #[allow(dead_code)]
  pub fn cache_control(&self) -> Option<&str> {
    self.headers.get("Cache-Control")
  }

  #[allow(dead_code)]
  pub fn text(&self) -> String {
    String::from_utf8_lossy(&self.body).into_owned()
  }
}

fn reason_phrase(status: u16) -> &'static str {
  match status {
    200 => "OK",
    204 => "No Content",
    206 => "Partial Content",
    304 => "Not Modified",
    400 => "Bad Request",
    403 => "Forbidden",
    404 => "Not Found",
    500 => "Internal Server Error",
    502 => "Bad Gateway",
    503 => "Service Unavailable",
    _ => "",
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn origin() -> Url {
    Url::parse("https://directory.example/").unwrap()
  }

  #[test]
  fn test_cache_key_drops_fragment() {
    let a = Request::parse("get", "/index.html#top", &origin()).unwrap();
    let b = Request::parse("GET", "/index.html", &origin()).unwrap();
    assert_eq!(a.cache_key(), b.cache_key());
    assert_eq!(a.cache_key(), "GET https://directory.example/index.html");
  }

  #[test]
  fn test_cache_key_includes_method_and_query() {
    let get = Request::parse("GET", "/app.js?v=2", &origin()).unwrap();
    let head = Request::parse("HEAD", "/app.js?v=2", &origin()).unwrap();
    assert_ne!(get.cache_key(), head.cache_key());
  }

  #[test]
  fn test_absolute_target_ignores_origin() {
    let req = Request::parse("GET", "https://fonts.googleapis.com/css2?family=Amiri", &origin())
      .unwrap();
    assert_eq!(req.host(), "fonts.googleapis.com");
  }

  #[test]
  fn test_headers_case_insensitive_set() {
    let mut headers = Headers::new();
    headers.append("cache-control", "no-store");
    headers.append("Content-Type", "text/css");
    headers.set("Cache-Control", "public, max-age=180");
    assert_eq!(headers.get("CACHE-CONTROL"), Some("public, max-age=180"));
    assert_eq!(headers.iter().count(), 2);
  }

  #[test]
  fn test_cacheable_requires_complete_same_origin() {
    assert!(Response::new(200, b"ok".to_vec()).is_cacheable());
    assert!(!Response::new(206, b"part".to_vec()).is_cacheable());
    assert!(!Response::new(404, b"".to_vec()).is_cacheable());
    assert!(!Response::new(200, b"x".to_vec())
      .with_kind(ResponseKind::Cors)
      .is_cacheable());
    assert!(!Response::new(200, b"x".to_vec())
      .with_kind(ResponseKind::Opaque)
      .is_cacheable());
  }

  #[test]
  fn test_offline_response() {
    let resp = Response::offline();
    assert_eq!(resp.status, 503);
    assert_eq!(resp.status_text, "Service Unavailable");
    assert_eq!(resp.text(), OFFLINE_BODY);
  }

  #[test]
  fn test_clone_shares_body() {
    let resp = Response::new(200, b"shell".to_vec());
    let copy = resp.clone();
    assert!(Arc::ptr_eq(&resp.body, &copy.body));
  }
}
