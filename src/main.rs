mod app;
mod cache;
mod config;
mod db;
mod event;
mod fetch;
mod host;
mod http;
mod lifecycle;
mod net;
mod notify;
mod queue;
mod sync;
#[cfg(test)]
mod testing;
mod worker;

use clap::{Parser, Subcommand};
use color_eyre::{eyre::eyre, Result};
use serde_json::Value;
use std::path::PathBuf;
use std::sync::Arc;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use crate::event::HostCommand;

#[derive(Parser, Debug)]
#[command(name = "resq")]
#[command(about = "Offline resilience worker for the disaster alert app")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/resq/config.yaml)
  #[arg(short, long)]
  config: Option<PathBuf>,

  /// Origin of the app, overrides the config file
  #[arg(short, long)]
  origin: Option<String>,

  /// SQLite database for caches and queued submissions
  #[arg(long)]
  db: Option<PathBuf>,

  /// Also write logs to daily files in this directory
  #[arg(long)]
  log_dir: Option<PathBuf>,

  #[command(subcommand)]
  command: Cmd,
}

#[derive(Subcommand, Debug)]
enum Cmd {
  /// Precache the app shell and take over if configured to
  Install,
  /// Activate the installed version and drop stale caches
  Activate,
  /// Route one request through the worker
  Fetch {
    url: String,
    #[arg(short = 'X', long)]
    method: Option<String>,
    /// JSON body, sent as given; turns a GET into a POST
    #[arg(short, long)]
    body: Option<String>,
    /// Treat the request as a page navigation
    #[arg(long)]
    navigate: bool,
    /// Request destination (image, script, style, ...)
    #[arg(long)]
    destination: Option<String>,
  },
  /// Resend queued submissions
  Sync {
    #[arg(long)]
    tag: Option<String>,
  },
  /// Deliver a push message
  Push { payload: Option<String> },
  /// Click a visible notification
  Click {
    tag: String,
    #[arg(long)]
    action: Option<String>,
  },
  /// Post a message to the worker
  Message { data: String },
  /// List queued submissions
  Queue,
  /// Show worker state
  Status,
  /// Read commands from stdin as JSON lines
  Run,
}

fn parse_json(raw: &str) -> Result<Value> {
  serde_json::from_str(raw).map_err(|e| eyre!("Invalid JSON '{}': {}", raw, e))
}

impl Cmd {
  fn into_host_command(self) -> Result<Option<HostCommand>> {
    let command = match self {
      Cmd::Install => HostCommand::Install,
      Cmd::Activate => HostCommand::Activate,
      Cmd::Fetch {
        url,
        method,
        body,
        navigate,
        destination,
      } => HostCommand::Fetch {
        url,
        method,
        body,
        navigate,
        destination,
      },
      Cmd::Sync { tag } => HostCommand::Sync { tag },
      Cmd::Push { payload } => HostCommand::Push {
        payload: payload.as_deref().map(parse_json).transpose()?,
      },
      Cmd::Click { tag, action } => HostCommand::Click { tag, action },
      Cmd::Message { data } => HostCommand::Message {
        data: parse_json(&data)?,
      },
      Cmd::Queue => HostCommand::Queue,
      Cmd::Status => HostCommand::Status,
      Cmd::Run => return Ok(None),
    };
    Ok(Some(command))
  }
}

/// Logs go to stderr so stdout stays machine readable.
fn init_tracing(log_dir: Option<&PathBuf>) -> Option<WorkerGuard> {
  let filter = EnvFilter::try_from_env("RESQ_LOG")
    .or_else(|_| EnvFilter::try_from_default_env())
    .unwrap_or_else(|_| EnvFilter::new("resq=info"));

  let stderr_layer = fmt::layer().with_writer(std::io::stderr).with_target(false);

  match log_dir {
    Some(dir) => {
      let appender = tracing_appender::rolling::daily(dir, "resq.log");
      let (writer, guard) = tracing_appender::non_blocking(appender);
      tracing_subscriber::registry()
        .with(filter)
        .with(stderr_layer)
        .with(fmt::layer().with_writer(writer).with_ansi(false))
        .init();
      Some(guard)
    }
    None => {
      tracing_subscriber::registry()
        .with(filter)
        .with(stderr_layer)
        .init();
      None
    }
  }
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();
  let _guard = init_tracing(args.log_dir.as_ref());

  // Load configuration
  let mut config = config::Config::load(args.config.as_deref())?;
  if let Some(origin) = args.origin {
    config.origin = origin;
  }
  if let Some(path) = args.db {
    config.storage.path = Some(path);
  }

  let db = db::Database::open(config.storage.path.as_deref())?;
  let network = Arc::new(net::HttpNetwork::new(&config)?);
  let mut app = app::App::new(config, db, network)?;

  match args.command.into_host_command()? {
    Some(command) => {
      let outcome = app.execute(command).await;
      app.shutdown().await;
      println!("{}", serde_json::to_string_pretty(&outcome?)?);
    }
    None => app.run().await?,
  }

  Ok(())
}
