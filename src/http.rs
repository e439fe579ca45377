//! Request/response model shared by the worker, the cache store and the network.

use color_eyre::{eyre::eyre, Result};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use url::Url;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum Method {
  #[default]
  Get,
  Head,
  Post,
  Put,
  Patch,
  Delete,
  Options,
}

impl Method {
  pub fn as_str(&self) -> &'static str {
    match self {
      Self::Get => "GET",
      Self::Head => "HEAD",
      Self::Post => "POST",
      Self::Put => "PUT",
      Self::Patch => "PATCH",
      Self::Delete => "DELETE",
      Self::Options => "OPTIONS",
    }
  }

  /// Only responses to safe reads may be replayed from a cache.
  pub fn is_cacheable(&self) -> bool {
    matches!(self, Self::Get | Self::Head)
  }
}

impl FromStr for Method {
  type Err = color_eyre::Report;

  fn from_str(s: &str) -> Result<Self> {
    match s.to_ascii_uppercase().as_str() {
      "GET" => Ok(Self::Get),
      "HEAD" => Ok(Self::Head),
      "POST" => Ok(Self::Post),
      "PUT" => Ok(Self::Put),
      "PATCH" => Ok(Self::Patch),
      "DELETE" => Ok(Self::Delete),
      "OPTIONS" => Ok(Self::Options),
      other => Err(eyre!("Unsupported HTTP method: {}", other)),
    }
  }
}

impl fmt::Display for Method {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

/// How the page issued the request.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum RequestMode {
  /// Full-page navigation
  Navigate,
  #[default]
  Cors,
}

/// What the requested resource will be used as.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Destination {
  #[default]
  Empty,
  Document,
  Image,
  Script,
  Style,
  Font,
  Manifest,
}

impl FromStr for Destination {
  type Err = color_eyre::Report;

  fn from_str(s: &str) -> Result<Self> {
    match s.to_ascii_lowercase().as_str() {
      "" | "empty" => Ok(Self::Empty),
      "document" => Ok(Self::Document),
      "image" => Ok(Self::Image),
      "script" => Ok(Self::Script),
      "style" => Ok(Self::Style),
      "font" => Ok(Self::Font),
      "manifest" => Ok(Self::Manifest),
      other => Err(eyre!("Unknown request destination: {}", other)),
    }
  }
}

/// An outgoing request as seen by the worker. URLs are always absolute.
#[derive(Debug, Clone)]
pub struct Request {
  pub url: Url,
  pub method: Method,
  pub headers: BTreeMap<String, String>,
  pub body: Option<Vec<u8>>,
  pub mode: RequestMode,
  pub destination: Destination,
}

impl Request {
  /// Build a GET request, resolving `raw` against `origin` when it is relative.
  pub fn get(raw: &str, origin: &Url) -> Result<Self> {
    let url = origin
      .join(raw)
      .map_err(|e| eyre!("Invalid request URL '{}': {}", raw, e))?;

    Ok(Self {
      url,
      method: Method::Get,
      headers: BTreeMap::new(),
      body: None,
      mode: RequestMode::Cors,
      destination: Destination::Empty,
    })
  }

  /// Build a POST request carrying a JSON body.
  #[cfg(test)]
  pub fn post_json(raw: &str, origin: &Url, body: Vec<u8>) -> Result<Self> {
    let mut request = Self::get(raw, origin)?;
    request.method = Method::Post;
    request
      .headers
      .insert("content-type".to_string(), "application/json".to_string());
    request.body = Some(body);
    Ok(request)
  }

  pub fn navigate(raw: &str, origin: &Url) -> Result<Self> {
    let mut request = Self::get(raw, origin)?;
    request.mode = RequestMode::Navigate;
    request.destination = Destination::Document;
    Ok(request)
  }

  pub fn with_destination(mut self, destination: Destination) -> Self {
    self.destination = destination;
    self
  }

  pub fn header(&self, name: &str) -> Option<&str> {
    self
      .headers
      .get(&name.to_ascii_lowercase())
      .map(String::as_str)
  }

  pub fn path(&self) -> &str {
    self.url.path()
  }

  pub fn identity(&self) -> RequestIdentity {
    RequestIdentity::new(self.method, &self.url)
  }
}

/// Cache key for a request: normalized URL plus method.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RequestIdentity {
  pub method: Method,
  pub url: String,
}

impl RequestIdentity {
  /// Fragments never reach the server, so they never distinguish entries.
  pub fn new(method: Method, url: &Url) -> Self {
    let mut url = url.clone();
    url.set_fragment(None);
    Self {
      method,
      url: url.to_string(),
    }
  }
}

impl fmt::Display for RequestIdentity {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{} {}", self.method, self.url)
  }
}

/// Where a response came from, relative to the app origin.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ResponseType {
  /// Same-origin network response
  Basic,
  /// Cross-origin network response
  Cors,
  /// Built by the worker itself
  #[default]
  Synthetic,
}

impl ResponseType {
  pub fn as_str(&self) -> &'static str {
    match self {
      Self::Basic => "basic",
      Self::Cors => "cors",
      Self::Synthetic => "default",
    }
  }

  pub fn parse(s: &str) -> Self {
    match s {
      "basic" => Self::Basic,
      "cors" => Self::Cors,
      _ => Self::Synthetic,
    }
  }
}

/// A complete response snapshot. Bodies are buffered, so `clone()` is the
/// clone-before-store operation.
#[derive(Debug, Clone, PartialEq)]
pub struct Response {
  pub status: u16,
  pub status_text: String,
  pub headers: BTreeMap<String, String>,
  pub body: Vec<u8>,
  pub response_type: ResponseType,
}

impl Response {
  pub fn new(status: u16) -> Self {
    Self {
      status,
      status_text: status_text_for(status).to_string(),
      headers: BTreeMap::new(),
      body: Vec::new(),
      response_type: ResponseType::Synthetic,
    }
  }

  pub fn json(status: u16, value: &serde_json::Value) -> Self {
    Self::new(status)
      .with_header("content-type", "application/json")
      .with_body(value.to_string().into_bytes())
  }

  pub fn text(status: u16, content_type: &str, body: &str) -> Self {
    Self::new(status)
      .with_header("content-type", content_type)
      .with_body(body.as_bytes().to_vec())
  }

  pub fn with_header(mut self, name: &str, value: &str) -> Self {
    self
      .headers
      .insert(name.to_ascii_lowercase(), value.to_string());
    self
  }

  pub fn with_body(mut self, body: Vec<u8>) -> Self {
    self.body = body;
    self
  }

  pub fn header(&self, name: &str) -> Option<&str> {
    self
      .headers
      .get(&name.to_ascii_lowercase())
      .map(String::as_str)
  }

  pub fn is_success(&self) -> bool {
    (200..300).contains(&self.status)
  }

  pub fn body_json(&self) -> Result<serde_json::Value> {
    serde_json::from_slice(&self.body).map_err(|e| eyre!("Response body is not JSON: {}", e))
  }

  pub fn body_text(&self) -> String {
    String::from_utf8_lossy(&self.body).into_owned()
  }
}

fn status_text_for(status: u16) -> &'static str {
  match status {
    200 => "OK",
    201 => "Created",
    204 => "No Content",
    304 => "Not Modified",
    400 => "Bad Request",
    404 => "Not Found",
    429 => "Too Many Requests",
    500 => "Internal Server Error",
    502 => "Bad Gateway",
    503 => "Service Unavailable",
    504 => "Gateway Timeout",
    _ => "",
  }
}
