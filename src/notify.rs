//! Push payloads to notifications, and notification clicks back into the app.

use color_eyre::Result;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::config::NotificationConfig;
use crate::host::{Host, WindowClient};

/// Incoming push payload; every field is optional.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PushPayload {
  pub title: Option<String>,
  pub body: Option<String>,
  pub url: Option<String>,
  #[serde(default, deserialize_with = "deserialize_loose_id")]
  pub alert_id: Option<String>,
  pub tag: Option<String>,
}

/// Alert ids arrive as strings or as bare numbers depending on the sender.
fn deserialize_loose_id<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
  D: serde::Deserializer<'de>,
{
  let v: Option<serde_json::Value> = Option::deserialize(deserializer)?;
  Ok(match v {
    Some(serde_json::Value::String(s)) => Some(s),
    Some(serde_json::Value::Number(n)) => Some(n.to_string()),
    _ => None,
  })
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NotificationAction {
  pub action: String,
  pub title: String,
  pub icon: String,
}

/// A notification as handed to the host.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NotificationRecord {
  pub title: String,
  pub body: String,
  pub icon: String,
  pub badge: String,
  pub vibrate: Vec<u32>,
  pub sound: String,
  /// Same-tag notifications replace each other
  pub tag: String,
  pub renotify: bool,
  /// Stays visible until the user acts on it
  pub require_interaction: bool,
  pub actions: Vec<NotificationAction>,
  pub url: String,
  pub alert_id: Option<String>,
}

/// What the user did with a notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClickAction {
  /// Tap on the notification body
  Default,
  View,
  Dismiss,
}

impl ClickAction {
  pub fn parse(action: Option<&str>) -> Self {
    match action.unwrap_or_default() {
      "view" => Self::View,
      "dismiss" => Self::Dismiss,
      _ => Self::Default,
    }
  }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClickOutcome {
  Focused(WindowClient),
  Opened(WindowClient),
  Dismissed,
}

pub struct NotificationDispatcher {
  defaults: NotificationConfig,
}

impl NotificationDispatcher {
  pub fn new(defaults: NotificationConfig) -> Self {
    Self { defaults }
  }

  /// Build the record for a raw push payload. Missing or malformed payloads
  /// still produce a notification with the default wording.
  pub fn render(&self, data: Option<&[u8]>) -> NotificationRecord {
    let payload = match data {
      Some(bytes) if !bytes.is_empty() => serde_json::from_slice::<PushPayload>(bytes)
        .unwrap_or_else(|e| {
          warn!("Push payload is not valid JSON, using defaults: {}", e);
          PushPayload::default()
        }),
      _ => PushPayload::default(),
    };

    let d = &self.defaults;
    NotificationRecord {
      title: payload.title.unwrap_or_else(|| d.title.clone()),
      body: payload.body.unwrap_or_else(|| d.body.clone()),
      icon: d.icon.clone(),
      badge: d.badge.clone(),
      vibrate: d.vibrate.clone(),
      sound: d.sound.clone(),
      tag: payload.tag.unwrap_or_else(|| d.tag.clone()),
      renotify: true,
      require_interaction: true,
      actions: vec![
        NotificationAction {
          action: "view".to_string(),
          title: "View Details".to_string(),
          icon: "/icons/view-icon.png".to_string(),
        },
        NotificationAction {
          action: "dismiss".to_string(),
          title: "Dismiss".to_string(),
          icon: "/icons/dismiss-icon.png".to_string(),
        },
      ],
      url: payload.url.unwrap_or_else(|| d.url.clone()),
      alert_id: payload.alert_id,
    }
  }

  pub fn on_push<H: Host + ?Sized>(&self, host: &H, data: Option<&[u8]>) -> Result<NotificationRecord> {
    let record = self.render(data);
    host.show_notification(record.clone())?;
    Ok(record)
  }

  /// Close the clicked notification, then route the user into the app.
  pub fn on_click<H: Host + ?Sized>(
    &self,
    host: &H,
    tag: &str,
    action: ClickAction,
  ) -> Result<ClickOutcome> {
    let target = host
      .notifications()?
      .into_iter()
      .find(|n| n.tag == tag)
      .map(|n| n.url)
      .unwrap_or_else(|| {
        debug!(tag, "Clicked notification no longer visible, using default url");
        self.defaults.url.clone()
      });

    host.close_notification(tag)?;

    if action == ClickAction::Dismiss {
      return Ok(ClickOutcome::Dismissed);
    }

    if let Some(window) = host.window_clients()?.into_iter().find(|w| w.url == target) {
      host.focus(window.id)?;
      return Ok(ClickOutcome::Focused(window));
    }

    let window = host.open_window(&target)?;
    info!(url = %target, "Opened app from notification");
    Ok(ClickOutcome::Opened(window))
  }
}
