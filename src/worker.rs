//! The worker as an event-driven state machine.
//!
//! Hosts turn whatever happened (install, a page fetch, connectivity coming
//! back, a push) into a [`WorkerEvent`] and hand it to [`Worker::dispatch`],
//! which selects the handler. Handler errors are logged and reported as
//! [`EventOutcome::Failed`]; they never stop later events from being handled.

use color_eyre::{eyre::eyre, Result};
use serde_json::{json, Value};
use std::sync::Arc;
use tokio::sync::oneshot;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};
use url::Url;

use crate::cache::CacheStorage;
use crate::config::Config;
use crate::db::Database;
use crate::fetch::{FetchInterceptor, FetchResult};
use crate::host::Host;
use crate::http::{Request, Response};
use crate::lifecycle::{ActivationReport, LifecycleManager, Registration, WorkerState};
use crate::net::Network;
use crate::notify::{ClickAction, ClickOutcome, NotificationDispatcher, NotificationRecord};
use crate::queue::SubmissionQueue;
use crate::sync::{SyncReport, SyncTrigger};

/// Events the host delivers to the worker.
#[derive(Debug)]
pub enum WorkerEvent {
  Install,
  Activate,
  Fetch(Request),
  /// Connectivity restored for a registered sync tag
  Sync { tag: String },
  Push { data: Option<Vec<u8>> },
  NotificationClick { tag: String, action: Option<String> },
  /// Message from a page, with an optional reply port
  Message {
    data: Value,
    reply: Option<oneshot::Sender<Value>>,
  },
  Error { message: String },
  UnhandledRejection { reason: String },
}

impl WorkerEvent {
  pub fn name(&self) -> &'static str {
    match self {
      Self::Install => "install",
      Self::Activate => "activate",
      Self::Fetch(_) => "fetch",
      Self::Sync { .. } => "sync",
      Self::Push { .. } => "push",
      Self::NotificationClick { .. } => "notificationclick",
      Self::Message { .. } => "message",
      Self::Error { .. } => "error",
      Self::UnhandledRejection { .. } => "unhandledrejection",
    }
  }
}

/// Result of dispatching one event.
#[derive(Debug)]
pub enum EventOutcome {
  Installed {
    cached: usize,
    activation: Option<ActivationReport>,
  },
  Activated(ActivationReport),
  /// Fetch answered by the worker
  Responded(FetchResult),
  /// Fetch made while no version controls pages
  PassedThrough(Response),
  NetworkError(String),
  Synced(SyncReport),
  Notified(NotificationRecord),
  Clicked(ClickOutcome),
  Replied(Value),
  /// Event accepted with nothing to report
  Handled,
  Failed(String),
}

/// Work that must finish before the worker may be torn down.
///
/// Handlers return as soon as they have an answer; anything still running
/// (cache writes) is parked here and awaited by [`WaitUntil::settle`].
#[derive(Default)]
pub struct WaitUntil {
  tasks: JoinSet<Result<()>>,
}

impl WaitUntil {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn extend_blocking<F>(&mut self, work: F)
  where
    F: FnOnce() -> Result<()> + Send + 'static,
  {
    self.tasks.spawn_blocking(work);
  }

  /// Wait for every extension. Returns how many of them failed.
  pub async fn settle(&mut self) -> usize {
    let mut failures = 0;
    while let Some(joined) = self.tasks.join_next().await {
      match joined {
        Ok(Ok(())) => {}
        Ok(Err(e)) => {
          error!("Background work failed: {}", e);
          failures += 1;
        }
        Err(e) => {
          error!("Background work aborted: {}", e);
          failures += 1;
        }
      }
    }
    failures
  }
}

pub struct Worker<S: CacheStorage, N: Network, H: Host> {
  storage: Arc<S>,
  network: Arc<N>,
  host: Arc<H>,
  queue: SubmissionQueue,
  lifecycle: LifecycleManager,
  interceptor: FetchInterceptor<S, N>,
  sync: SyncTrigger,
  notifications: NotificationDispatcher,
  wait: WaitUntil,
}

impl<S, N, H> Worker<S, N, H>
where
  S: CacheStorage + 'static,
  N: Network,
  H: Host,
{
  pub fn new(
    config: &Config,
    db: Database,
    storage: Arc<S>,
    network: Arc<N>,
    host: Arc<H>,
  ) -> Result<Self> {
    let origin =
      Url::parse(&config.origin).map_err(|e| eyre!("Invalid origin '{}': {}", config.origin, e))?;
    let queue = SubmissionQueue::new(db.clone());
    let lifecycle =
      LifecycleManager::resume(config.cache.clone(), origin.clone(), Registration::new(db))?;
    let interceptor = FetchInterceptor::new(
      config,
      &origin,
      Arc::clone(&storage),
      Arc::clone(&network),
      queue.clone(),
    )?;
    let sync = SyncTrigger::new(config.sync.tag.clone(), origin, queue.clone());

    info!(version = %lifecycle.version(), state = %lifecycle.state(), "Worker loaded");

    Ok(Self {
      storage,
      network,
      host,
      queue,
      lifecycle,
      interceptor,
      sync,
      notifications: NotificationDispatcher::new(config.notifications.clone()),
      wait: WaitUntil::new(),
    })
  }

  pub fn state(&self) -> WorkerState {
    self.lifecycle.state()
  }

  pub fn version(&self) -> &str {
    self.lifecycle.version()
  }

  pub fn sync_tag(&self) -> &str {
    self.sync.tag()
  }

  pub fn queue(&self) -> &SubmissionQueue {
    &self.queue
  }

  pub fn host(&self) -> &H {
    &self.host
  }

  /// Version whose cache serves fetches right now. While this worker waits
  /// that is still the previously active one.
  pub fn controlling_version(&self) -> Result<Option<String>> {
    if self.lifecycle.state() == WorkerState::Activated {
      return Ok(Some(self.lifecycle.version().to_string()));
    }
    self.lifecycle.registration().active_version()
  }

  /// Number of responses in the controlling cache.
  pub fn cached_entries(&self) -> Result<usize> {
    match self.controlling_version()? {
      Some(version) if self.storage.has_cache(&version)? => self.storage.entry_count(&version),
      _ => Ok(0),
    }
  }

  /// A sync stays registered for as long as anything is queued.
  pub fn sync_requested(&self) -> Result<bool> {
    Ok(!self.queue.is_empty()?)
  }

  /// Await every lifetime extension registered so far.
  pub async fn settle(&mut self) -> usize {
    self.wait.settle().await
  }

  /// Select and run the handler for one event.
  pub async fn dispatch(&mut self, event: WorkerEvent) -> EventOutcome {
    let name = event.name();
    debug!(event = name, "Dispatching");

    match self.handle(event).await {
      Ok(outcome) => outcome,
      Err(e) => {
        error!(event = name, "Worker error: {}", e);
        EventOutcome::Failed(e.to_string())
      }
    }
  }

  async fn handle(&mut self, event: WorkerEvent) -> Result<EventOutcome> {
    match event {
      WorkerEvent::Install => self.on_install().await,
      WorkerEvent::Activate => {
        let report = self
          .lifecycle
          .activate(self.storage.as_ref(), self.host.as_ref())?;
        Ok(EventOutcome::Activated(report))
      }
      WorkerEvent::Fetch(request) => self.on_fetch(request).await,
      WorkerEvent::Sync { tag } => {
        match self.sync.on_sync(&tag, self.network.as_ref()).await? {
          Some(report) => Ok(EventOutcome::Synced(report)),
          None => Ok(EventOutcome::Handled),
        }
      }
      WorkerEvent::Push { data } => {
        let record = self
          .notifications
          .on_push(self.host.as_ref(), data.as_deref())?;
        Ok(EventOutcome::Notified(record))
      }
      WorkerEvent::NotificationClick { tag, action } => {
        let outcome = self.notifications.on_click(
          self.host.as_ref(),
          &tag,
          ClickAction::parse(action.as_deref()),
        )?;
        Ok(EventOutcome::Clicked(outcome))
      }
      WorkerEvent::Message { data, reply } => self.on_message(data, reply),
      WorkerEvent::Error { message } => {
        error!("Service worker error: {}", message);
        Ok(EventOutcome::Handled)
      }
      WorkerEvent::UnhandledRejection { reason } => {
        error!("Service worker unhandled rejection: {}", reason);
        Ok(EventOutcome::Handled)
      }
    }
  }

  async fn on_install(&mut self) -> Result<EventOutcome> {
    let cached = self
      .lifecycle
      .install(self.storage.as_ref(), self.network.as_ref())
      .await?;

    let activation = if self.lifecycle.skip_waiting_on_install() {
      self
        .lifecycle
        .skip_waiting(self.storage.as_ref(), self.host.as_ref())?
    } else {
      None
    };

    Ok(EventOutcome::Installed { cached, activation })
  }

  async fn on_fetch(&mut self, request: Request) -> Result<EventOutcome> {
    let Some(cache_name) = self.controlling_version()? else {
      debug!(url = %request.url, "No active worker, passing through");
      return Ok(match self.network.fetch(&request).await {
        Ok(response) => EventOutcome::PassedThrough(response),
        Err(e) => EventOutcome::NetworkError(e.to_string()),
      });
    };

    let result = self
      .interceptor
      .handle(&request, &cache_name, &mut self.wait)
      .await;
    Ok(EventOutcome::Responded(result))
  }

  fn on_message(
    &mut self,
    data: Value,
    reply: Option<oneshot::Sender<Value>>,
  ) -> Result<EventOutcome> {
    match data.get("type").and_then(Value::as_str) {
      Some("SKIP_WAITING") => {
        match self
          .lifecycle
          .skip_waiting(self.storage.as_ref(), self.host.as_ref())?
        {
          Some(report) => Ok(EventOutcome::Activated(report)),
          None => Ok(EventOutcome::Handled),
        }
      }
      Some("GET_VERSION") => {
        let value = json!({ "version": self.lifecycle.version() });
        match reply {
          Some(port) => {
            if port.send(value.clone()).is_err() {
              warn!("Version reply port was closed");
            }
          }
          None => debug!("GET_VERSION without a reply port"),
        }
        Ok(EventOutcome::Replied(value))
      }
      other => {
        debug!(kind = ?other, "Ignoring message");
        Ok(EventOutcome::Handled)
      }
    }
  }
}
