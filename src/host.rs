//! Surface of the embedding environment: open windows and the notification tray.

use color_eyre::{eyre::eyre, Result};
use std::sync::{Mutex, MutexGuard};
use tracing::info;

use crate::notify::NotificationRecord;

/// A window of the app known to the host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WindowClient {
  pub id: u64,
  pub url: String,
  pub focused: bool,
  /// Whether the worker controls this window's requests
  pub controlled: bool,
}

/// Operations the worker may ask of its host.
pub trait Host: Send + Sync + 'static {
  /// Take control of every open window. Returns how many were claimed.
  fn claim_clients(&self) -> Result<usize>;

  fn window_clients(&self) -> Result<Vec<WindowClient>>;

  fn focus(&self, id: u64) -> Result<()>;

  fn open_window(&self, url: &str) -> Result<WindowClient>;

  /// Show a notification, replacing any visible one with the same tag.
  fn show_notification(&self, record: NotificationRecord) -> Result<()>;

  fn close_notification(&self, tag: &str) -> Result<()>;

  fn notifications(&self) -> Result<Vec<NotificationRecord>>;
}

#[derive(Default)]
struct LocalState {
  windows: Vec<WindowClient>,
  next_window_id: u64,
  tray: Vec<NotificationRecord>,
}

/// In-process host used by the command line runtime and the tests.
#[derive(Default)]
pub struct LocalHost {
  state: Mutex<LocalState>,
}

impl LocalHost {
  pub fn new() -> Self {
    Self::default()
  }

  /// Register a window that was opened outside the worker.
  pub fn attach_window(&self, url: &str) -> Result<WindowClient> {
    let mut state = self.lock()?;
    state.next_window_id += 1;
    let window = WindowClient {
      id: state.next_window_id,
      url: url.to_string(),
      focused: false,
      controlled: false,
    };
    state.windows.push(window.clone());
    Ok(window)
  }

  fn lock(&self) -> Result<MutexGuard<'_, LocalState>> {
    self.state.lock().map_err(|e| eyre!("Lock poisoned: {}", e))
  }
}

impl Host for LocalHost {
  fn claim_clients(&self) -> Result<usize> {
    let mut state = self.lock()?;
    let mut claimed = 0;
    for window in state.windows.iter_mut().filter(|w| !w.controlled) {
      window.controlled = true;
      claimed += 1;
    }
    Ok(claimed)
  }

  fn window_clients(&self) -> Result<Vec<WindowClient>> {
    Ok(self.lock()?.windows.clone())
  }

  fn focus(&self, id: u64) -> Result<()> {
    let mut state = self.lock()?;
    if !state.windows.iter().any(|w| w.id == id) {
      return Err(eyre!("No window with id {}", id));
    }
    for window in state.windows.iter_mut() {
      window.focused = window.id == id;
    }
    info!(window = id, "Focused window");
    Ok(())
  }

  fn open_window(&self, url: &str) -> Result<WindowClient> {
    let mut state = self.lock()?;
    state.next_window_id += 1;
    for window in state.windows.iter_mut() {
      window.focused = false;
    }
    let window = WindowClient {
      id: state.next_window_id,
      url: url.to_string(),
      focused: true,
      controlled: true,
    };
    state.windows.push(window.clone());
    info!(window = window.id, url, "Opened window");
    Ok(window)
  }

  fn show_notification(&self, record: NotificationRecord) -> Result<()> {
    let mut state = self.lock()?;
    state.tray.retain(|n| n.tag != record.tag);
    info!(tag = %record.tag, title = %record.title, "Showing notification");
    state.tray.push(record);
    Ok(())
  }

  fn close_notification(&self, tag: &str) -> Result<()> {
    self.lock()?.tray.retain(|n| n.tag != tag);
    Ok(())
  }

  fn notifications(&self) -> Result<Vec<NotificationRecord>> {
    Ok(self.lock()?.tray.clone())
  }
}
