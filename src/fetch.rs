//! Fetch interception: one strategy per request class.
//!
//! | class      | strategy                                             |
//! |------------|------------------------------------------------------|
//! | navigation | network first, cached app shell on failure           |
//! | api        | network first, cache 2xx reads, cached or degraded   |
//! | static     | cache first, cache same-origin 2xx, placeholder      |

use color_eyre::{eyre::eyre, Result};
use serde_json::json;
use std::sync::Arc;
use tracing::{debug, error, info, warn};
use url::Url;

use crate::cache::CacheStorage;
use crate::config::{ApiConfig, Config};
use crate::http::{
  Destination, Method, Request, RequestIdentity, RequestMode, Response, ResponseType,
};
use crate::net::Network;
use crate::queue::{PendingSubmission, SubmissionQueue};
use crate::worker::WaitUntil;

const PLACEHOLDER_IMAGE: &str = r##"<svg xmlns="http://www.w3.org/2000/svg" width="200" height="200" viewBox="0 0 200 200"><rect width="200" height="200" fill="#374151"/><text x="100" y="100" text-anchor="middle" dy=".3em" fill="#9CA3AF">No Image</text></svg>"##;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestClass {
  Navigation,
  Api,
  Static,
}

/// Indicates where a response came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseSource {
  Network,
  Cache,
  /// Synthesized empty data for an unreachable API read
  Degraded,
  /// Synthesized "queued, call emergency services" answer for a submission
  Queued,
  /// Inline image or plain "Offline" text
  Placeholder,
}

impl ResponseSource {
  pub fn as_str(&self) -> &'static str {
    match self {
      Self::Network => "network",
      Self::Cache => "cache",
      Self::Degraded => "degraded",
      Self::Queued => "queued",
      Self::Placeholder => "placeholder",
    }
  }
}

#[derive(Debug, Clone)]
pub struct FetchResult {
  pub response: Response,
  pub source: ResponseSource,
  /// Set when a failed submission was put on the durable queue
  pub queued: Option<PendingSubmission>,
}

impl FetchResult {
  fn new(response: Response, source: ResponseSource) -> Self {
    Self {
      response,
      source,
      queued: None,
    }
  }
}

pub struct FetchInterceptor<S: CacheStorage, N: Network> {
  storage: Arc<S>,
  network: Arc<N>,
  queue: SubmissionQueue,
  api: ApiConfig,
  app_shell: Url,
}

impl<S: CacheStorage + 'static, N: Network> FetchInterceptor<S, N> {
  pub fn new(
    config: &Config,
    origin: &Url,
    storage: Arc<S>,
    network: Arc<N>,
    queue: SubmissionQueue,
  ) -> Result<Self> {
    let app_shell = Request::get(&config.cache.app_shell, origin)?.url;
    Ok(Self {
      storage,
      network,
      queue,
      api: config.api.clone(),
      app_shell,
    })
  }

  pub fn classify(&self, request: &Request) -> RequestClass {
    if request.mode == RequestMode::Navigate {
      RequestClass::Navigation
    } else if request.path().starts_with(&self.api.prefix) {
      RequestClass::Api
    } else {
      RequestClass::Static
    }
  }

  /// Answer `request` from `cache_name` and the network. Never fails: every
  /// failure path ends in a cached, degraded or placeholder response.
  pub async fn handle(&self, request: &Request, cache_name: &str, wait: &mut WaitUntil) -> FetchResult {
    let class = self.classify(request);
    debug!(url = %request.url, method = %request.method, ?class, "Intercepted fetch");

    match class {
      RequestClass::Navigation => self.navigate(request, cache_name).await,
      RequestClass::Api => self.api(request, cache_name, wait).await,
      RequestClass::Static => self.asset(request, cache_name, wait).await,
    }
  }

  async fn navigate(&self, request: &Request, cache_name: &str) -> FetchResult {
    match self.network.fetch(request).await {
      Ok(response) => FetchResult::new(response, ResponseSource::Network),
      Err(e) => {
        debug!("Navigation to {} failed, serving app shell: {}", request.url, e);
        let shell = RequestIdentity::new(request.method, &self.app_shell);
        match self.lookup(cache_name, &shell) {
          Some(response) => FetchResult::new(response, ResponseSource::Cache),
          None => FetchResult::new(offline_text(), ResponseSource::Placeholder),
        }
      }
    }
  }

  async fn api(&self, request: &Request, cache_name: &str, wait: &mut WaitUntil) -> FetchResult {
    let error = match self.network.fetch(request).await {
      Ok(response) => {
        if response.is_success() && request.method.is_cacheable() {
          self.store(wait, cache_name, request.identity(), &response);
        }
        return FetchResult::new(response, ResponseSource::Network);
      }
      Err(e) => e,
    };

    debug!("API request {} failed: {}", request.url, error);

    if request.method.is_cacheable() {
      if let Some(response) = self.lookup(cache_name, &request.identity()) {
        return FetchResult::new(response, ResponseSource::Cache);
      }
    }

    if self.is_queued_submission(request) {
      return self.queue_submission(request);
    }

    FetchResult::new(
      Response::json(
        200,
        &json!({
          "success": false,
          "message": "Offline - showing cached data",
          "data": [],
          "offline": true,
        }),
      ),
      ResponseSource::Degraded,
    )
  }

  async fn asset(&self, request: &Request, cache_name: &str, wait: &mut WaitUntil) -> FetchResult {
    let cacheable = request.method.is_cacheable();

    if cacheable {
      if let Some(response) = self.lookup(cache_name, &request.identity()) {
        return FetchResult::new(response, ResponseSource::Cache);
      }
    }

    match self.network.fetch(request).await {
      Ok(response) => {
        // Only well-formed same-origin answers are worth keeping
        if cacheable && response.is_success() && response.response_type == ResponseType::Basic {
          self.store(wait, cache_name, request.identity(), &response);
        }
        FetchResult::new(response, ResponseSource::Network)
      }
      Err(e) => {
        debug!("Asset request {} failed: {}", request.url, e);
        let response = if request.destination == Destination::Image {
          Response::text(200, "image/svg+xml", PLACEHOLDER_IMAGE)
        } else {
          offline_text()
        };
        FetchResult::new(response, ResponseSource::Placeholder)
      }
    }
  }

  fn is_queued_submission(&self, request: &Request) -> bool {
    let path = request.path().trim_end_matches('/');
    request.method == Method::Post
      && self
        .api
        .queued_endpoints
        .iter()
        .any(|endpoint| endpoint.trim_end_matches('/') == path)
  }

  /// Put an undeliverable submission on the durable queue and tell the user
  /// plainly that it has not reached anyone yet.
  fn queue_submission(&self, request: &Request) -> FetchResult {
    let payload = request.body.as_deref().unwrap_or_default();
    let queued = match self
      .queue
      .enqueue(request.path(), request.header("content-type"), payload)
    {
      Ok(queued) => {
        info!(id = queued.id, endpoint = %queued.endpoint, "Queued submission for background sync");
        Some(queued)
      }
      Err(e) => {
        error!("Failed to queue submission for {}: {}", request.url, e);
        None
      }
    };

    let message = if queued.is_some() {
      format!(
        "You are offline. Your request has been queued and will be sent automatically when connectivity returns. For immediate help, call emergency services directly at {}.",
        self.api.emergency_number
      )
    } else {
      format!(
        "You are offline and your request could not be saved. Please try calling emergency services directly at {}.",
        self.api.emergency_number
      )
    };

    let response = Response::json(
      503,
      &json!({
        "success": false,
        "message": message,
        "offline": true,
        "queued": queued.is_some(),
        "queueId": queued.as_ref().map(|q| q.id),
      }),
    );

    FetchResult {
      response,
      source: ResponseSource::Queued,
      queued,
    }
  }

  /// Cache read that treats storage errors as a miss.
  fn lookup(&self, cache_name: &str, identity: &RequestIdentity) -> Option<Response> {
    match self.storage.match_entry(cache_name, identity) {
      Ok(Some(cached)) => {
        debug!(%identity, cached_at = %cached.cached_at, "Cache hit");
        Some(cached.response)
      }
      Ok(None) => None,
      Err(e) => {
        warn!("Cache lookup for {} failed: {}", identity, e);
        None
      }
    }
  }

  /// Store a clone of `response` without making the caller wait for it.
  fn store(&self, wait: &mut WaitUntil, cache_name: &str, identity: RequestIdentity, response: &Response) {
    let storage = Arc::clone(&self.storage);
    let cache_name = cache_name.to_string();
    let snapshot = response.clone();
    wait.extend_blocking(move || {
      storage
        .put(&cache_name, &identity, &snapshot)
        .map_err(|e| eyre!("Failed to cache {}: {}", identity, e))
    });
  }
}

fn offline_text() -> Response {
  Response::text(503, "text/plain", "Offline")
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::SqliteStorage;
  use crate::db::Database;
  use crate::testing::{self, ScriptedNetwork};

  const VERSION: &str = "disaster-management-v1";

  struct Fixture {
    interceptor: FetchInterceptor<SqliteStorage, ScriptedNetwork>,
    storage: Arc<SqliteStorage>,
    network: ScriptedNetwork,
    queue: SubmissionQueue,
    db: Database,
    wait: WaitUntil,
  }

  fn fixture() -> Fixture {
    let db = testing::database();
    let storage = Arc::new(SqliteStorage::new(db.clone()));
    let network = ScriptedNetwork::new();
    let queue = SubmissionQueue::new(db.clone());
    let interceptor = FetchInterceptor::new(
      &testing::config(),
      &testing::origin(),
      Arc::clone(&storage),
      Arc::new(network.clone()),
      queue.clone(),
    )
    .unwrap();

    Fixture {
      interceptor,
      storage,
      network,
      queue,
      db,
      wait: WaitUntil::new(),
    }
  }

  fn get(path: &str) -> Request {
    Request::get(path, &testing::origin()).unwrap()
  }

  #[tokio::test]
  async fn test_classification() {
    let f = fixture();
    let nav = Request::navigate("/alerts", &testing::origin()).unwrap();
    assert_eq!(f.interceptor.classify(&nav), RequestClass::Navigation);
    assert_eq!(f.interceptor.classify(&get("/api/alerts")), RequestClass::Api);
    assert_eq!(f.interceptor.classify(&get("/styles.css")), RequestClass::Static);
    assert_eq!(f.interceptor.classify(&get("/apis.png")), RequestClass::Static);
  }

  #[tokio::test]
  async fn test_cached_asset_never_touches_network() {
    let mut f = fixture();
    let cached = Response::text(200, "text/css", "body{}");
    f.storage.put(VERSION, &get("/styles.css").identity(), &cached).unwrap();

    let result = f.interceptor.handle(&get("/styles.css"), VERSION, &mut f.wait).await;

    assert_eq!(result.source, ResponseSource::Cache);
    assert_eq!(result.response, cached);
    assert_eq!(f.network.request_count(), 0);
  }

  #[tokio::test]
  async fn test_asset_miss_is_fetched_and_stored() {
    let mut f = fixture();
    f.network.reply(Method::Get, "/script.js", Response::text(200, "text/javascript", "main()"));

    let result = f.interceptor.handle(&get("/script.js"), VERSION, &mut f.wait).await;
    f.wait.settle().await;

    assert_eq!(result.source, ResponseSource::Network);
    let stored = f.storage.match_entry(VERSION, &get("/script.js").identity()).unwrap();
    assert_eq!(stored.unwrap().response.body_text(), "main()");
  }

  #[tokio::test]
  async fn test_cross_origin_asset_is_not_stored() {
    let mut f = fixture();
    let mut tile = Response::text(200, "image/png", "png");
    tile.response_type = ResponseType::Cors;
    f.network.reply(Method::Get, "/tile.png", tile);

    f.interceptor.handle(&get("/tile.png"), VERSION, &mut f.wait).await;
    f.wait.settle().await;

    assert_eq!(f.storage.entry_count(VERSION).unwrap(), 0);
  }

  #[tokio::test]
  async fn test_failed_image_gets_placeholder() {
    let mut f = fixture();
    f.network.set_offline(true);
    let request = get("/icons/flood.png").with_destination(Destination::Image);

    let result = f.interceptor.handle(&request, VERSION, &mut f.wait).await;

    assert_eq!(result.source, ResponseSource::Placeholder);
    assert_eq!(result.response.status, 200);
    assert_eq!(result.response.header("content-type"), Some("image/svg+xml"));
    assert!(result.response.body_text().contains("No Image"));
  }

  #[tokio::test]
  async fn test_failed_script_gets_offline_text() {
    let mut f = fixture();
    f.network.set_offline(true);

    let result = f.interceptor.handle(&get("/script.js"), VERSION, &mut f.wait).await;

    assert_eq!(result.response.status, 503);
    assert_eq!(result.response.body_text(), "Offline");
  }

  #[tokio::test]
  async fn test_api_success_is_cached_and_replayed_offline() {
    let mut f = fixture();
    let body = r#"{"success":true,"data":[{"id":1,"type":"flood"}]}"#;
    f.network.reply(Method::Get, "/api/alerts", Response::text(200, "application/json", body));

    let online = f.interceptor.handle(&get("/api/alerts"), VERSION, &mut f.wait).await;
    assert_eq!(online.source, ResponseSource::Network);
    f.wait.settle().await;

    f.network.set_offline(true);
    let offline = f.interceptor.handle(&get("/api/alerts"), VERSION, &mut f.wait).await;

    assert_eq!(offline.source, ResponseSource::Cache);
    assert_eq!(offline.response.body_text(), body);
  }

  #[tokio::test]
  async fn test_api_network_wins_over_cache() {
    let mut f = fixture();
    f.storage
      .put(VERSION, &get("/api/alerts").identity(), &Response::text(200, "application/json", "old"))
      .unwrap();
    f.network.reply(Method::Get, "/api/alerts", Response::text(200, "application/json", "new"));

    let result = f.interceptor.handle(&get("/api/alerts"), VERSION, &mut f.wait).await;

    assert_eq!(result.response.body_text(), "new");
    assert_eq!(f.network.request_count(), 1);
  }

  #[tokio::test]
  async fn test_api_error_status_is_not_cached() {
    let mut f = fixture();
    f.network.reply(Method::Get, "/api/stats", Response::new(500));

    let result = f.interceptor.handle(&get("/api/stats"), VERSION, &mut f.wait).await;
    f.wait.settle().await;

    assert_eq!(result.response.status, 500);
    assert_eq!(f.storage.entry_count(VERSION).unwrap(), 0);
  }

  #[tokio::test]
  async fn test_offline_api_read_degrades_to_empty_data() {
    let mut f = fixture();
    f.network.set_offline(true);

    let result = f.interceptor.handle(&get("/api/forecasts"), VERSION, &mut f.wait).await;

    assert_eq!(result.source, ResponseSource::Degraded);
    assert_eq!(result.response.status, 200);
    let body = result.response.body_json().unwrap();
    assert_eq!(body["offline"], true);
    assert_eq!(body["data"], serde_json::json!([]));
  }

  #[tokio::test]
  async fn test_offline_sos_is_queued() {
    let mut f = fixture();
    f.network.set_offline(true);
    let payload = br#"{"latitude":17.40,"longitude":78.47}"#.to_vec();
    let request = Request::post_json("/api/sos", &testing::origin(), payload.clone()).unwrap();

    let result = f.interceptor.handle(&request, VERSION, &mut f.wait).await;

    assert_eq!(result.source, ResponseSource::Queued);
    assert_eq!(result.response.status, 503);
    let body = result.response.body_json().unwrap();
    assert_eq!(body["offline"], true);
    assert_eq!(body["queued"], true);
    assert!(body["message"].as_str().unwrap().contains("emergency services"));

    let pending = f.queue.pending().unwrap();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].endpoint, "/api/sos");
    assert_eq!(pending[0].payload, payload);
    assert_eq!(pending[0].content_type.as_deref(), Some("application/json"));
    assert_eq!(result.queued.unwrap().id, pending[0].id);
  }

  #[tokio::test]
  async fn test_unsaveable_sos_still_answers_offline() {
    let mut f = fixture();
    f.network.set_offline(true);
    f.db
      .lock()
      .unwrap()
      .execute_batch("DROP TABLE pending_submissions")
      .unwrap();
    let request = Request::post_json("/api/sos", &testing::origin(), b"{}".to_vec()).unwrap();

    let result = f.interceptor.handle(&request, VERSION, &mut f.wait).await;

    assert_eq!(result.source, ResponseSource::Queued);
    assert_eq!(result.response.status, 503);
    assert!(result.queued.is_none());
    let body = result.response.body_json().unwrap();
    assert_eq!(body["offline"], true);
    assert_eq!(body["queued"], false);
    assert_eq!(body["queueId"], serde_json::Value::Null);
    assert!(body["message"].as_str().unwrap().contains("emergency services directly at 112"));
  }

  #[tokio::test]
  async fn test_sos_status_lookup_is_not_queued() {
    let mut f = fixture();
    f.network.set_offline(true);

    let result = f.interceptor.handle(&get("/api/sos/abc123"), VERSION, &mut f.wait).await;

    assert_eq!(result.source, ResponseSource::Degraded);
    assert!(f.queue.is_empty().unwrap());
  }

  #[tokio::test]
  async fn test_online_sos_rejection_is_passed_through() {
    let mut f = fixture();
    f.network.reply(Method::Post, "/api/sos", Response::text(400, "application/json", "{}"));
    let request = Request::post_json("/api/sos", &testing::origin(), b"{}".to_vec()).unwrap();

    let result = f.interceptor.handle(&request, VERSION, &mut f.wait).await;
    f.wait.settle().await;

    assert_eq!(result.response.status, 400);
    assert!(f.queue.is_empty().unwrap());
    assert_eq!(f.storage.entry_count(VERSION).unwrap(), 0);
  }

  #[tokio::test]
  async fn test_offline_navigation_serves_app_shell() {
    let mut f = fixture();
    let shell = Response::text(200, "text/html", "<html>shell</html>");
    f.storage.put(VERSION, &get("/index.html").identity(), &shell).unwrap();
    f.network.set_offline(true);

    let request = Request::navigate("/alerts/5", &testing::origin()).unwrap();
    let result = f.interceptor.handle(&request, VERSION, &mut f.wait).await;

    assert_eq!(result.source, ResponseSource::Cache);
    assert_eq!(result.response, shell);
  }

  #[tokio::test]
  async fn test_offline_navigation_without_shell() {
    let mut f = fixture();
    f.network.set_offline(true);

    let request = Request::navigate("/", &testing::origin()).unwrap();
    let result = f.interceptor.handle(&request, VERSION, &mut f.wait).await;

    assert_eq!(result.source, ResponseSource::Placeholder);
    assert_eq!(result.response.status, 503);
  }
}
