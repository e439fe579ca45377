use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use serde_json::value::RawValue;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader};
use tokio::sync::{mpsc, oneshot};
use tracing::warn;
use url::Url;

use crate::http::{Destination, Method, Request, RequestMode};
use crate::net::Network;
use crate::worker::WorkerEvent;

/// A command for the worker, as typed on the command line or sent as one
/// JSON object per line on stdin.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum HostCommand {
  Install,
  Activate,
  Fetch {
    url: String,
    #[serde(default)]
    method: Option<String>,
    /// Body sent as `application/json`, byte for byte as given. Filled by
    /// [`HostCommand::from_line`] since a tagged enum cannot keep raw JSON.
    #[serde(skip_deserializing)]
    body: Option<String>,
    #[serde(default)]
    navigate: bool,
    #[serde(default)]
    destination: Option<String>,
  },
  Sync {
    #[serde(default)]
    tag: Option<String>,
  },
  Push {
    #[serde(default)]
    payload: Option<Value>,
  },
  Click {
    tag: String,
    #[serde(default)]
    action: Option<String>,
  },
  Message {
    data: Value,
  },
  /// Tell the host about a window the user opened
  OpenWindow {
    url: String,
  },
  /// Uncaught error reported by a page script
  Error {
    message: String,
  },
  UnhandledRejection {
    reason: String,
  },
  /// List the submissions waiting for a sync
  Queue,
  Status,
}

/// The `body` of a command line, left unparsed
#[derive(Deserialize)]
struct RawBody {
  #[serde(default)]
  body: Option<Box<RawValue>>,
}

impl HostCommand {
  /// Parse one JSON command. A fetch `body` is kept as the exact text that
  /// was sent: a JSON string contributes its contents, anything else its
  /// raw JSON.
  pub fn from_line(line: &str) -> Result<Self> {
    let mut command: HostCommand =
      serde_json::from_str(line).map_err(|e| eyre!("Invalid command: {}", e))?;

    if let HostCommand::Fetch { body, .. } = &mut command {
      let raw: RawBody = serde_json::from_str(line).map_err(|e| eyre!("Invalid command: {}", e))?;
      *body = match raw.body {
        Some(raw) if raw.get().starts_with('"') => Some(
          serde_json::from_str::<String>(raw.get()).map_err(|e| eyre!("Invalid body: {}", e))?,
        ),
        Some(raw) => Some(raw.get().to_string()),
        None => None,
      };
    }

    Ok(command)
  }

  /// Turn a command into the worker event it stands for. Returns `None` for
  /// commands the host answers itself. `GET_VERSION` style messages get a
  /// reply port whose receiver is returned alongside the event.
  pub fn into_event(
    self,
    origin: &Url,
    sync_tag: &str,
  ) -> Result<Option<(WorkerEvent, Option<oneshot::Receiver<Value>>)>> {
    let event = match self {
      Self::Install => WorkerEvent::Install,
      Self::Activate => WorkerEvent::Activate,
      Self::Fetch {
        url,
        method,
        body,
        navigate,
        destination,
      } => WorkerEvent::Fetch(build_request(
        origin,
        &url,
        method.as_deref(),
        body,
        navigate,
        destination.as_deref(),
      )?),
      Self::Sync { tag } => WorkerEvent::Sync {
        tag: tag.unwrap_or_else(|| sync_tag.to_string()),
      },
      Self::Push { payload } => WorkerEvent::Push {
        data: payload.map(|p| p.to_string().into_bytes()),
      },
      Self::Click { tag, action } => WorkerEvent::NotificationClick { tag, action },
      Self::Error { message } => WorkerEvent::Error { message },
      Self::UnhandledRejection { reason } => WorkerEvent::UnhandledRejection { reason },
      Self::Message { data } => {
        let (tx, rx) = oneshot::channel();
        return Ok(Some((
          WorkerEvent::Message {
            data,
            reply: Some(tx),
          },
          Some(rx),
        )));
      }
      Self::OpenWindow { .. } | Self::Queue | Self::Status => return Ok(None),
    };
    Ok(Some((event, None)))
  }
}

fn build_request(
  origin: &Url,
  url: &str,
  method: Option<&str>,
  body: Option<String>,
  navigate: bool,
  destination: Option<&str>,
) -> Result<Request> {
  let mut request = if navigate {
    Request::navigate(url, origin)?
  } else {
    Request::get(url, origin)?
  };

  if let Some(method) = method {
    request.method = method.parse::<Method>()?;
  }
  if let Some(destination) = destination {
    request = request.with_destination(destination.parse::<Destination>()?);
  }
  if let Some(body) = body {
    if request.mode == RequestMode::Navigate {
      return Err(eyre!("Navigations cannot carry a body"));
    }
    if request.method == Method::Get {
      request.method = Method::Post;
    }
    request
      .headers
      .insert("content-type".to_string(), "application/json".to_string());
    request.body = Some(body.into_bytes());
  }

  Ok(request)
}

/// Host events
#[derive(Debug)]
pub enum Event {
  Command(HostCommand),
  /// A stdin line that is not a valid command
  Malformed(String),
  /// Result of one connectivity probe
  Connectivity { online: bool, changed: bool },
  InputClosed,
}

/// Turn one stdin line into an event. Blank lines yield nothing.
pub fn parse_line(bytes: &[u8]) -> Option<Event> {
  let line = match std::str::from_utf8(bytes) {
    Ok(line) => line.trim(),
    Err(e) => return Some(Event::Malformed(format!("Line is not UTF-8: {}", e))),
  };
  if line.is_empty() {
    return None;
  }

  Some(match HostCommand::from_line(line) {
    Ok(command) => Event::Command(command),
    Err(e) => Event::Malformed(format!("{}: {}", e, line)),
  })
}

/// Forward every line of `reader` until end of input.
async fn read_commands<R: AsyncBufRead + Unpin>(mut reader: R, tx: mpsc::UnboundedSender<Event>) {
  let mut buf = Vec::new();
  loop {
    buf.clear();
    let event = match reader.read_until(b'\n', &mut buf).await {
      Ok(0) => {
        let _ = tx.send(Event::InputClosed);
        break;
      }
      Ok(_) => match parse_line(&buf) {
        Some(event) => event,
        None => continue,
      },
      Err(e) => {
        warn!("Failed to read commands: {}", e);
        let _ = tx.send(Event::InputClosed);
        break;
      }
    };
    if tx.send(event).is_err() {
      break;
    }
  }
}

/// Periodic reachability check against the API health endpoint.
pub struct ConnectivityProbe<N: Network> {
  network: Arc<N>,
  request: Request,
  last: Option<bool>,
}

impl<N: Network> ConnectivityProbe<N> {
  pub fn new(network: Arc<N>, request: Request) -> Self {
    Self {
      network,
      request,
      last: None,
    }
  }

  /// Ask once. Any answer at all means the API is reachable.
  pub async fn check(&mut self) -> Event {
    let online = self.network.fetch(&self.request).await.is_ok();
    let changed = self.last != Some(online);
    self.last = Some(online);
    Event::Connectivity { online, changed }
  }
}

/// Event handler that produces events from stdin commands and a
/// connectivity probe
pub struct EventHandler {
  rx: mpsc::UnboundedReceiver<Event>,
}

impl EventHandler {
  pub fn new<N: Network>(network: Arc<N>, probe: Request, probe_interval: Duration) -> Self {
    let (tx, rx) = mpsc::unbounded_channel();

    // Spawn stdin command reader
    tokio::spawn(read_commands(BufReader::new(tokio::io::stdin()), tx.clone()));

    // Spawn connectivity probe, reporting every tick
    let mut probe = ConnectivityProbe::new(network, probe);
    tokio::spawn(async move {
      let mut ticker = tokio::time::interval(probe_interval);
      loop {
        ticker.tick().await;
        if tx.send(probe.check().await).is_err() {
          break;
        }
      }
    });

    Self { rx }
  }

  /// Receive the next event
  pub async fn next(&mut self) -> Option<Event> {
    self.rx.recv().await
  }
}
