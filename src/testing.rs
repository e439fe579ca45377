//! In-process doubles shared by the unit tests.

use color_eyre::{eyre::eyre, Result};
use futures::future::BoxFuture;
use futures::FutureExt;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use url::Url;

use crate::config::Config;
use crate::db::Database;
use crate::http::{Method, Request, Response, ResponseType};
use crate::net::Network;

pub const ORIGIN: &str = "http://localhost:3000";

pub fn origin() -> Url {
  Url::parse(ORIGIN).unwrap()
}

pub fn config() -> Config {
  Config {
    origin: ORIGIN.to_string(),
    ..Config::default()
  }
}

pub fn database() -> Database {
  Database::open_in_memory().unwrap()
}

/// Network double with canned replies per `(method, absolute url)`.
///
/// Replies queued with `reply_once` are consumed first, then the sticky reply
/// from `reply` is used. Unknown routes answer 404. When offline every fetch
/// fails. Every request that reaches it is recorded.
#[derive(Clone, Default)]
pub struct ScriptedNetwork {
  inner: Arc<ScriptedInner>,
}

#[derive(Default)]
struct ScriptedInner {
  offline: AtomicBool,
  sticky: Mutex<HashMap<(Method, String), Response>>,
  once: Mutex<HashMap<(Method, String), VecDeque<Result<Response, String>>>>,
  seen: Mutex<Vec<Request>>,
}

fn route(method: Method, path: &str) -> (Method, String) {
  (method, origin().join(path).unwrap().to_string())
}

impl ScriptedNetwork {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn set_offline(&self, offline: bool) {
    self.inner.offline.store(offline, Ordering::SeqCst);
  }

  /// Same-origin reply for every future request to `path`.
  pub fn reply(&self, method: Method, path: &str, mut response: Response) {
    if response.response_type == ResponseType::Synthetic {
      response.response_type = ResponseType::Basic;
    }
    self
      .inner
      .sticky
      .lock()
      .unwrap()
      .insert(route(method, path), response);
  }

  pub fn reply_once(&self, method: Method, path: &str, mut response: Response) {
    if response.response_type == ResponseType::Synthetic {
      response.response_type = ResponseType::Basic;
    }
    self
      .inner
      .once
      .lock()
      .unwrap()
      .entry(route(method, path))
      .or_default()
      .push_back(Ok(response));
  }

  /// The next request to `path` fails as if the connection dropped.
  pub fn fail_once(&self, method: Method, path: &str) {
    self
      .inner
      .once
      .lock()
      .unwrap()
      .entry(route(method, path))
      .or_default()
      .push_back(Err("connection reset".to_string()));
  }

  pub fn requests(&self) -> Vec<Request> {
    self.inner.seen.lock().unwrap().clone()
  }

  pub fn request_count(&self) -> usize {
    self.inner.seen.lock().unwrap().len()
  }

  fn answer(&self, request: &Request) -> Result<Response> {
    self.inner.seen.lock().unwrap().push(request.clone());

    if self.inner.offline.load(Ordering::SeqCst) {
      return Err(eyre!("Failed to fetch {}: network unreachable", request.url));
    }

    let key = (request.method, request.url.to_string());
    if let Some(next) = self
      .inner
      .once
      .lock()
      .unwrap()
      .get_mut(&key)
      .and_then(VecDeque::pop_front)
    {
      return next.map_err(|e| eyre!("Failed to fetch {}: {}", request.url, e));
    }

    Ok(
      self
        .inner
        .sticky
        .lock()
        .unwrap()
        .get(&key)
        .cloned()
        .unwrap_or_else(|| Response::new(404)),
    )
  }
}

impl Network for ScriptedNetwork {
  fn fetch<'a>(&'a self, request: &'a Request) -> BoxFuture<'a, Result<Response>> {
    let answer = self.answer(request);
    async move { answer }.boxed()
  }
}
