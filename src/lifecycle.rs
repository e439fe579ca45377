//! Worker lifecycle: install, wait, activate, and cache-version garbage collection.

use color_eyre::{eyre::eyre, Result};
use futures::future::join_all;
use rusqlite::{params, OptionalExtension};
use std::fmt;
use tracing::{error, info, warn};
use url::Url;

use crate::cache::CacheStorage;
use crate::config::CacheConfig;
use crate::db::Database;
use crate::host::Host;
use crate::http::{Request, Response};
use crate::net::Network;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
  /// Loaded but not installed yet
  Parsed,
  Installing,
  /// Installed and waiting to take over
  Installed,
  Activating,
  /// Controls pages and serves fetches
  Activated,
  /// A failed install; never takes over
  Redundant,
}

impl fmt::Display for WorkerState {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let s = match self {
      Self::Parsed => "parsed",
      Self::Installing => "installing",
      Self::Installed => "installed",
      Self::Activating => "activating",
      Self::Activated => "activated",
      Self::Redundant => "redundant",
    };
    f.write_str(s)
  }
}

/// Persisted record of which cache version controls pages.
#[derive(Clone)]
pub struct Registration {
  db: Database,
}

impl Registration {
  const ACTIVE_VERSION: &'static str = "active_version";

  pub fn new(db: Database) -> Self {
    Self { db }
  }

  pub fn active_version(&self) -> Result<Option<String>> {
    let conn = self.db.lock()?;
    conn
      .query_row(
        "SELECT value FROM worker_meta WHERE key = ?",
        params![Self::ACTIVE_VERSION],
        |row| row.get(0),
      )
      .optional()
      .map_err(|e| eyre!("Failed to read active version: {}", e))
  }

  fn set_active_version(&self, version: &str) -> Result<()> {
    let conn = self.db.lock()?;
    conn
      .execute(
        "INSERT OR REPLACE INTO worker_meta (key, value) VALUES (?, ?)",
        params![Self::ACTIVE_VERSION, version],
      )
      .map_err(|e| eyre!("Failed to record active version: {}", e))?;
    Ok(())
  }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActivationReport {
  pub deleted_caches: Vec<String>,
  pub claimed_clients: usize,
}

pub struct LifecycleManager {
  config: CacheConfig,
  origin: Url,
  registration: Registration,
  state: WorkerState,
}

impl LifecycleManager {
  /// Pick up where a previous process left off: if this version is already
  /// the active one there is nothing to install.
  pub fn resume(config: CacheConfig, origin: Url, registration: Registration) -> Result<Self> {
    let state = if registration.active_version()?.as_deref() == Some(config.version.as_str()) {
      WorkerState::Activated
    } else {
      WorkerState::Parsed
    };

    Ok(Self {
      config,
      origin,
      registration,
      state,
    })
  }

  pub fn state(&self) -> WorkerState {
    self.state
  }

  /// The version of this worker.
  pub fn version(&self) -> &str {
    &self.config.version
  }

  pub fn registration(&self) -> &Registration {
    &self.registration
  }

  pub fn skip_waiting_on_install(&self) -> bool {
    self.config.skip_waiting_on_install
  }

  /// Fetch the whole precache manifest and store it under this version.
  ///
  /// All-or-nothing: one failed fetch or one non-2xx answer and nothing is
  /// written, the worker becomes redundant and whatever version was active
  /// stays in control.
  pub async fn install<S, N>(&mut self, storage: &S, network: &N) -> Result<usize>
  where
    S: CacheStorage + ?Sized,
    N: Network + ?Sized,
  {
    if self.state == WorkerState::Activated {
      info!(version = %self.config.version, "Already active, skipping install");
      return Ok(0);
    }

    self.state = WorkerState::Installing;
    info!(version = %self.config.version, resources = self.config.precache.len(), "Installing");

    match self.precache(storage, network).await {
      Ok(count) => {
        self.state = WorkerState::Installed;
        info!(version = %self.config.version, cached = count, "Installed");
        Ok(count)
      }
      Err(e) => {
        self.state = WorkerState::Redundant;
        error!(version = %self.config.version, "Failed to cache resources: {}", e);
        Err(e)
      }
    }
  }

  async fn precache<S, N>(&self, storage: &S, network: &N) -> Result<usize>
  where
    S: CacheStorage + ?Sized,
    N: Network + ?Sized,
  {
    let requests = self
      .config
      .precache
      .iter()
      .map(|raw| Request::get(raw, &self.origin))
      .collect::<Result<Vec<_>>>()?;

    let responses = join_all(requests.iter().map(|r| network.fetch(r))).await;

    let mut entries: Vec<(_, Response)> = Vec::with_capacity(requests.len());
    for (request, response) in requests.iter().zip(responses) {
      let response = response?;
      if !response.is_success() {
        return Err(eyre!(
          "Precache request {} answered {}",
          request.url,
          response.status
        ));
      }
      entries.push((request.identity(), response));
    }

    storage.put_all(&self.config.version, &entries)?;
    Ok(entries.len())
  }

  /// Make this version the only one: drop every other cache store, record
  /// the version as active and claim open windows. Never fetches, so running
  /// it again is harmless.
  pub fn activate<S, H>(&mut self, storage: &S, host: &H) -> Result<ActivationReport>
  where
    S: CacheStorage + ?Sized,
    H: Host + ?Sized,
  {
    match self.state {
      WorkerState::Installed | WorkerState::Activated => {}
      other => {
        return Err(eyre!(
          "Cannot activate {} while {}",
          self.config.version,
          other
        ))
      }
    }

    self.state = WorkerState::Activating;
    let result = self.collect_stale_caches(storage);
    let deleted_caches = match result {
      Ok(deleted) => deleted,
      Err(e) => {
        // The previous version's registration is untouched; stay installed
        self.state = WorkerState::Installed;
        return Err(e);
      }
    };

    self.registration.set_active_version(&self.config.version)?;
    self.state = WorkerState::Activated;

    let claimed_clients = host.claim_clients().unwrap_or_else(|e| {
      warn!("Failed to claim clients: {}", e);
      0
    });

    info!(
      version = %self.config.version,
      deleted = deleted_caches.len(),
      claimed = claimed_clients,
      "Activated"
    );

    Ok(ActivationReport {
      deleted_caches,
      claimed_clients,
    })
  }

  fn collect_stale_caches<S: CacheStorage + ?Sized>(&self, storage: &S) -> Result<Vec<String>> {
    storage.open_cache(&self.config.version)?;

    let mut deleted = Vec::new();
    for name in storage.cache_names()? {
      if name != self.config.version {
        info!(cache = %name, "Deleting old cache");
        storage.delete_cache(&name)?;
        deleted.push(name);
      }
    }
    Ok(deleted)
  }

  /// Skip the waiting phase. Only a waiting worker is affected.
  pub fn skip_waiting<S, H>(&mut self, storage: &S, host: &H) -> Result<Option<ActivationReport>>
  where
    S: CacheStorage + ?Sized,
    H: Host + ?Sized,
  {
    if self.state != WorkerState::Installed {
      return Ok(None);
    }
    self.activate(storage, host).map(Some)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::SqliteStorage;
  use crate::host::LocalHost;
  use crate::http::Method;
  use crate::testing::{self, ScriptedNetwork};

  fn cache_config(version: &str) -> CacheConfig {
    CacheConfig {
      version: version.to_string(),
      precache: vec!["/".to_string(), "/index.html".to_string(), "/styles.css".to_string()],
      ..CacheConfig::default()
    }
  }

  fn online_network() -> ScriptedNetwork {
    let network = ScriptedNetwork::new();
    network.reply(Method::Get, "/", Response::text(200, "text/html", "<html>root"));
    network.reply(Method::Get, "/index.html", Response::text(200, "text/html", "<html>shell"));
    network.reply(Method::Get, "/styles.css", Response::text(200, "text/css", "body{}"));
    network
  }

  fn manager(db: &Database, version: &str) -> LifecycleManager {
    LifecycleManager::resume(
      cache_config(version),
      testing::origin(),
      Registration::new(db.clone()),
    )
    .unwrap()
  }

  #[tokio::test]
  async fn test_install_then_activate() {
    let db = testing::database();
    let storage = SqliteStorage::new(db.clone());
    let host = LocalHost::new();
    host.attach_window("/").unwrap();
    let mut lifecycle = manager(&db, "v1");

    assert_eq!(lifecycle.state(), WorkerState::Parsed);
    let cached = lifecycle.install(&storage, &online_network()).await.unwrap();
    assert_eq!(cached, 3);
    assert_eq!(lifecycle.state(), WorkerState::Installed);

    let report = lifecycle.activate(&storage, &host).unwrap();
    assert_eq!(report.claimed_clients, 1);
    assert_eq!(lifecycle.state(), WorkerState::Activated);
    assert_eq!(
      lifecycle.registration().active_version().unwrap().as_deref(),
      Some("v1")
    );
  }

  #[tokio::test]
  async fn test_failed_precache_writes_nothing() {
    let db = testing::database();
    let storage = SqliteStorage::new(db.clone());
    let network = online_network();
    network.fail_once(Method::Get, "/styles.css");
    let mut lifecycle = manager(&db, "v1");

    assert!(lifecycle.install(&storage, &network).await.is_err());
    assert_eq!(lifecycle.state(), WorkerState::Redundant);
    assert!(storage.cache_names().unwrap().is_empty());
    assert!(lifecycle.activate(&storage, &LocalHost::new()).is_err());
  }

  #[tokio::test]
  async fn test_non_success_precache_fails_install() {
    let db = testing::database();
    let storage = SqliteStorage::new(db.clone());
    let network = online_network();
    network.reply(Method::Get, "/styles.css", Response::new(404));
    let mut lifecycle = manager(&db, "v1");

    assert!(lifecycle.install(&storage, &network).await.is_err());
    assert_eq!(storage.entry_count("v1").unwrap(), 0);
  }

  #[tokio::test]
  async fn test_failed_upgrade_keeps_previous_version() {
    let db = testing::database();
    let storage = SqliteStorage::new(db.clone());
    let host = LocalHost::new();

    let mut v1 = manager(&db, "v1");
    v1.install(&storage, &online_network()).await.unwrap();
    v1.activate(&storage, &host).unwrap();

    let network = online_network();
    network.fail_once(Method::Get, "/");
    let mut v2 = manager(&db, "v2");
    assert!(v2.install(&storage, &network).await.is_err());

    assert_eq!(v2.registration().active_version().unwrap().as_deref(), Some("v1"));
    assert_eq!(storage.cache_names().unwrap(), vec!["v1".to_string()]);
    assert_eq!(storage.entry_count("v1").unwrap(), 3);
  }

  #[tokio::test]
  async fn test_activation_deletes_old_versions() {
    let db = testing::database();
    let storage = SqliteStorage::new(db.clone());
    let host = LocalHost::new();

    let mut v1 = manager(&db, "v1");
    v1.install(&storage, &online_network()).await.unwrap();
    v1.activate(&storage, &host).unwrap();

    let mut v2 = manager(&db, "v2");
    v2.install(&storage, &online_network()).await.unwrap();
    let report = v2.activate(&storage, &host).unwrap();

    assert_eq!(report.deleted_caches, vec!["v1".to_string()]);
    assert_eq!(storage.cache_names().unwrap(), vec!["v2".to_string()]);
  }

  #[tokio::test]
  async fn test_activation_twice_is_idempotent() {
    let db = testing::database();
    let storage = SqliteStorage::new(db.clone());
    let host = LocalHost::new();
    let network = online_network();
    let mut lifecycle = manager(&db, "v1");

    lifecycle.install(&storage, &network).await.unwrap();
    let fetched = network.request_count();

    lifecycle.activate(&storage, &host).unwrap();
    let second = lifecycle.activate(&storage, &host).unwrap();

    assert!(second.deleted_caches.is_empty());
    assert_eq!(storage.cache_names().unwrap(), vec!["v1".to_string()]);
    assert_eq!(network.request_count(), fetched);
  }

  #[tokio::test]
  async fn test_resume_skips_install_for_active_version() {
    let db = testing::database();
    let storage = SqliteStorage::new(db.clone());
    let network = online_network();

    let mut first = manager(&db, "v1");
    first.install(&storage, &network).await.unwrap();
    first.activate(&storage, &LocalHost::new()).unwrap();
    let fetched = network.request_count();

    let mut resumed = manager(&db, "v1");
    assert_eq!(resumed.state(), WorkerState::Activated);
    assert_eq!(resumed.install(&storage, &network).await.unwrap(), 0);
    assert_eq!(network.request_count(), fetched);
  }

  #[tokio::test]
  async fn test_skip_waiting_only_affects_waiting_worker() {
    let db = testing::database();
    let storage = SqliteStorage::new(db.clone());
    let host = LocalHost::new();
    let mut lifecycle = manager(&db, "v1");

    assert!(lifecycle.skip_waiting(&storage, &host).unwrap().is_none());

    lifecycle.install(&storage, &online_network()).await.unwrap();
    assert!(lifecycle.skip_waiting(&storage, &host).unwrap().is_some());
    assert_eq!(lifecycle.state(), WorkerState::Activated);
  }
}
