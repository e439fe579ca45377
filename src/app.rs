use color_eyre::{eyre::eyre, Result};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};
use url::Url;

use crate::cache::SqliteStorage;
use crate::config::Config;
use crate::db::Database;
use crate::event::{Event, EventHandler, HostCommand};
use crate::fetch::FetchResult;
use crate::host::{Host, LocalHost, WindowClient};
use crate::http::{Request, Response};
use crate::net::Network;
use crate::notify::ClickOutcome;
use crate::queue::PendingSubmission;
use crate::worker::{EventOutcome, Worker};

/// Command line host for the worker: owns the storage, the network and the
/// windows, and feeds commands to the worker one at a time.
pub struct App<N: Network> {
  config: Config,
  origin: Url,
  network: Arc<N>,
  worker: Worker<SqliteStorage, N, LocalHost>,
}

impl<N: Network> App<N> {
  pub fn new(config: Config, db: Database, network: Arc<N>) -> Result<Self> {
    let origin =
      Url::parse(&config.origin).map_err(|e| eyre!("Invalid origin '{}': {}", config.origin, e))?;
    let storage = Arc::new(SqliteStorage::new(db.clone()));
    let worker = Worker::new(
      &config,
      db,
      storage,
      Arc::clone(&network),
      Arc::new(LocalHost::new()),
    )?;

    Ok(Self {
      config,
      origin,
      network,
      worker,
    })
  }

  /// Run one command and describe its outcome as JSON.
  pub async fn execute(&mut self, command: HostCommand) -> Result<Value> {
    match command {
      HostCommand::OpenWindow { url } => {
        let window = self.worker.host().attach_window(&url)?;
        Ok(json!({ "window": render_window(&window) }))
      }
      HostCommand::Queue => {
        let pending = self.worker.queue().pending()?;
        Ok(json!({
          "pending": pending.iter().map(render_submission).collect::<Vec<_>>(),
        }))
      }
      HostCommand::Status => self.status(),
      command => {
        let Some((event, reply)) = command.into_event(&self.origin, self.worker.sync_tag())? else {
          return Ok(Value::Null);
        };
        let outcome = self.worker.dispatch(event).await;
        let mut rendered = render_outcome(&outcome);
        if let Some(reply) = reply {
          if let Ok(value) = reply.await {
            rendered["reply"] = value;
          }
        }
        Ok(rendered)
      }
    }
  }

  fn status(&self) -> Result<Value> {
    let windows = self.worker.host().window_clients()?;
    let notifications = self.worker.host().notifications()?;
    Ok(json!({
      "version": self.worker.version(),
      "state": self.worker.state().to_string(),
      "controllingVersion": self.worker.controlling_version()?,
      "cachedEntries": self.worker.cached_entries()?,
      "queued": self.worker.queue().len()?,
      "syncRequested": self.worker.sync_requested()?,
      "windows": windows.iter().map(render_window).collect::<Vec<_>>(),
      "notifications": notifications,
    }))
  }

  /// Wait for background cache writes before the process exits.
  pub async fn shutdown(&mut self) {
    let failures = self.worker.settle().await;
    if failures > 0 {
      warn!(failures, "Some background work did not complete");
    }
  }

  /// React to one health check result. While the API answers and anything is
  /// queued, every tick fires a sync, so records a sync left behind get
  /// another attempt.
  pub async fn on_connectivity(&mut self, online: bool) -> Option<Value> {
    if !online {
      return None;
    }
    match self.worker.sync_requested() {
      Ok(false) => return None,
      Ok(true) => {}
      Err(e) => warn!("Cannot inspect submission queue: {}", e),
    }

    let tag = self.worker.sync_tag().to_string();
    match self.execute(HostCommand::Sync { tag: Some(tag) }).await {
      Ok(line) => Some(line),
      Err(e) => {
        warn!("Sync after health check failed: {}", e);
        None
      }
    }
  }

  /// Serve commands from stdin, one JSON object per line, until stdin
  /// closes or the process is interrupted. Every outcome is written to
  /// stdout as one JSON line. Queued submissions are resent on every health
  /// check that finds the API reachable.
  pub async fn run(&mut self) -> Result<()> {
    let probe = Request::get(&self.config.sync.health_path, &self.origin)?;
    let interval = Duration::from_secs(self.config.sync.probe_interval_secs.max(1));
    let mut events = EventHandler::new(Arc::clone(&self.network), probe, interval);

    info!(origin = %self.origin, "Worker host running");

    loop {
      let event = tokio::select! {
        event = events.next() => event,
        _ = tokio::signal::ctrl_c() => {
          info!("Interrupted");
          break;
        }
      };

      match event {
        Some(Event::Command(command)) => {
          let line = match self.execute(command).await {
            Ok(value) => value,
            Err(e) => json!({ "error": e.to_string() }),
          };
          println!("{}", line);
          self.worker.settle().await;
        }
        Some(Event::Malformed(line)) => {
          warn!("Ignoring malformed command: {}", line);
          println!("{}", json!({ "error": format!("Malformed command: {}", line) }));
        }
        Some(Event::Connectivity { online, changed }) => {
          if changed {
            info!(online, "Connectivity changed");
          }
          if let Some(line) = self.on_connectivity(online).await {
            println!("{}", line);
            self.worker.settle().await;
          }
        }
        Some(Event::InputClosed) | None => {
          debug!("Input closed");
          break;
        }
      }
    }

    self.shutdown().await;
    Ok(())
  }
}

pub fn render_outcome(outcome: &EventOutcome) -> Value {
  match outcome {
    EventOutcome::Installed { cached, activation } => json!({
      "outcome": "installed",
      "cached": cached,
      "activated": activation.is_some(),
      "deletedCaches": activation.as_ref().map(|a| a.deleted_caches.clone()),
    }),
    EventOutcome::Activated(report) => json!({
      "outcome": "activated",
      "deletedCaches": report.deleted_caches,
      "claimedClients": report.claimed_clients,
    }),
    EventOutcome::Responded(result) => render_fetch(result),
    EventOutcome::PassedThrough(response) => json!({
      "outcome": "passthrough",
      "response": render_response(response),
    }),
    EventOutcome::NetworkError(message) => json!({
      "outcome": "network_error",
      "error": message,
    }),
    EventOutcome::Synced(report) => json!({
      "outcome": "synced",
      "delivered": report.delivered,
      "retained": report.retained,
    }),
    EventOutcome::Notified(record) => json!({
      "outcome": "notified",
      "notification": record,
    }),
    EventOutcome::Clicked(click) => match click {
      ClickOutcome::Focused(window) => json!({
        "outcome": "focused",
        "window": render_window(window),
      }),
      ClickOutcome::Opened(window) => json!({
        "outcome": "opened",
        "window": render_window(window),
      }),
      ClickOutcome::Dismissed => json!({ "outcome": "dismissed" }),
    },
    EventOutcome::Replied(value) => json!({
      "outcome": "replied",
      "reply": value,
    }),
    EventOutcome::Handled => json!({ "outcome": "handled" }),
    EventOutcome::Failed(message) => json!({
      "outcome": "failed",
      "error": message,
    }),
  }
}

fn render_fetch(result: &FetchResult) -> Value {
  let mut value = json!({
    "outcome": "responded",
    "source": result.source.as_str(),
    "response": render_response(&result.response),
  });
  if let Some(submission) = &result.queued {
    value["queued"] = render_submission(submission);
  }
  value
}

fn render_response(response: &Response) -> Value {
  let is_json = response
    .header("content-type")
    .is_some_and(|ct| ct.contains("json"));
  let body = match response.body_json() {
    Ok(body) if is_json => body,
    _ => Value::String(response.body_text()),
  };

  json!({
    "status": response.status,
    "statusText": response.status_text,
    "type": response.response_type.as_str(),
    "headers": response.headers,
    "body": body,
  })
}

fn render_submission(submission: &PendingSubmission) -> Value {
  json!({
    "id": submission.id,
    "endpoint": submission.endpoint,
    "contentType": submission.content_type,
    "payload": String::from_utf8_lossy(&submission.payload),
    "createdAt": submission.created_at.to_rfc3339(),
    "attempts": submission.attempts,
    "lastAttemptAt": submission.last_attempt_at.map(|t| t.to_rfc3339()),
  })
}

fn render_window(window: &WindowClient) -> Value {
  json!({
    "id": window.id,
    "url": window.url,
    "focused": window.focused,
    "controlled": window.controlled,
  })
}
