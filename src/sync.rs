//! Background sync: drain the submission queue into the live API.

use color_eyre::Result;
use std::collections::BTreeMap;
use tracing::{debug, info, warn};
use url::Url;

use crate::http::{Method, Request};
use crate::net::Network;
use crate::queue::{PendingSubmission, SubmissionQueue};

/// What one sync run achieved.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncReport {
  /// Ids acknowledged by the API and removed from the queue
  pub delivered: Vec<i64>,
  /// Ids still waiting for a later sync
  pub retained: Vec<i64>,
}

impl SyncReport {
  pub fn is_complete(&self) -> bool {
    self.retained.is_empty()
  }
}

pub struct SyncTrigger {
  tag: String,
  origin: Url,
  queue: SubmissionQueue,
}

impl SyncTrigger {
  pub fn new(tag: impl Into<String>, origin: Url, queue: SubmissionQueue) -> Self {
    Self {
      tag: tag.into(),
      origin,
      queue,
    }
  }

  pub fn tag(&self) -> &str {
    &self.tag
  }

  /// Handle a sync event. Tags other than ours are ignored.
  ///
  /// Each pending record is resent once, oldest first. A 2xx answer removes
  /// it; anything else leaves it for the next sync. One failure never stops
  /// the records behind it.
  pub async fn on_sync<N: Network + ?Sized>(&self, tag: &str, network: &N) -> Result<Option<SyncReport>> {
    if tag != self.tag {
      debug!(tag, "Ignoring sync for unknown tag");
      return Ok(None);
    }

    let pending = self.queue.pending()?;
    info!(count = pending.len(), "Background sync triggered for pending submissions");

    let mut report = SyncReport::default();
    for submission in pending {
      if self.resend(&submission, network).await {
        report.delivered.push(submission.id);
      } else {
        report.retained.push(submission.id);
      }
    }

    if !report.is_complete() {
      warn!(
        delivered = report.delivered.len(),
        retained = report.retained.len(),
        "Background sync left submissions queued"
      );
    }
    Ok(Some(report))
  }

  async fn resend<N: Network + ?Sized>(&self, submission: &PendingSubmission, network: &N) -> bool {
    if let Err(e) = self.queue.record_attempt(submission.id) {
      warn!(id = submission.id, "{}", e);
    }

    let request = match self.request_for(submission) {
      Ok(request) => request,
      Err(e) => {
        warn!(id = submission.id, "Cannot rebuild submission request: {}", e);
        return false;
      }
    };

    match network.fetch(&request).await {
      Ok(response) if response.is_success() => match self.queue.remove(submission.id) {
        Ok(_) => {
          info!(id = submission.id, status = response.status, "Delivered queued submission");
          true
        }
        Err(e) => {
          // Delivered but still queued: the next sync sends a duplicate,
          // which at-least-once delivery allows
          warn!(id = submission.id, "Failed to dequeue delivered submission: {}", e);
          false
        }
      },
      Ok(response) => {
        warn!(
          id = submission.id,
          status = response.status,
          attempts = submission.attempts + 1,
          "Submission rejected, keeping it queued"
        );
        false
      }
      Err(e) => {
        debug!(id = submission.id, "Resend failed: {}", e);
        false
      }
    }
  }

  fn request_for(&self, submission: &PendingSubmission) -> Result<Request> {
    let mut request = Request::get(&submission.endpoint, &self.origin)?;
    request.method = Method::Post;
    let mut headers = BTreeMap::new();
    headers.insert(
      "content-type".to_string(),
      submission
        .content_type
        .clone()
        .unwrap_or_else(|| "application/json".to_string()),
    );
    request.headers = headers;
    request.body = Some(submission.payload.clone());
    Ok(request)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::http::Response;
  use crate::testing::{self, ScriptedNetwork};

  const TAG: &str = "background-sync-sos";

  fn trigger() -> (SyncTrigger, SubmissionQueue) {
    let queue = SubmissionQueue::new(testing::database());
    (SyncTrigger::new(TAG, testing::origin(), queue.clone()), queue)
  }

  fn created() -> Response {
    Response::text(201, "application/json", r#"{"success":true,"alertId":"a1"}"#)
  }

  #[tokio::test]
  async fn test_successful_resend_empties_queue() {
    let (trigger, queue) = trigger();
    let network = ScriptedNetwork::new();
    network.reply(Method::Post, "/api/sos", created());
    let payload = br#"{"latitude":17.40,"longitude":78.47}"#;
    queue.enqueue("/api/sos", Some("application/json"), payload).unwrap();

    let report = trigger.on_sync(TAG, &network).await.unwrap().unwrap();

    assert_eq!(report.delivered.len(), 1);
    assert!(queue.is_empty().unwrap());
    let sent = network.requests();
    assert_eq!(sent[0].method, Method::Post);
    assert_eq!(sent[0].body.as_deref(), Some(&payload[..]));
    assert_eq!(sent[0].header("content-type"), Some("application/json"));
  }

  #[tokio::test]
  async fn test_removes_exactly_the_delivered_record() {
    let (trigger, queue) = trigger();
    let network = ScriptedNetwork::new();
    let first = queue.enqueue("/api/sos", None, b"first").unwrap();
    let second = queue.enqueue("/api/sos", None, b"second").unwrap();
    network.fail_once(Method::Post, "/api/sos");
    network.reply(Method::Post, "/api/sos", created());

    let report = trigger.on_sync(TAG, &network).await.unwrap().unwrap();

    assert_eq!(report.retained, vec![first.id]);
    assert_eq!(report.delivered, vec![second.id]);
    let remaining = queue.pending().unwrap();
    assert_eq!(remaining.len(), 1);
    assert_eq!(remaining[0].id, first.id);
    assert_eq!(remaining[0].attempts, 1);
  }

  #[tokio::test]
  async fn test_resends_oldest_first() {
    let (trigger, queue) = trigger();
    let network = ScriptedNetwork::new();
    network.reply(Method::Post, "/api/sos", created());
    network.reply(Method::Post, "/api/report", created());
    queue.enqueue("/api/sos", None, b"1").unwrap();
    queue.enqueue("/api/report", None, b"2").unwrap();
    queue.enqueue("/api/sos", None, b"3").unwrap();

    trigger.on_sync(TAG, &network).await.unwrap();

    let bodies: Vec<Vec<u8>> = network
      .requests()
      .into_iter()
      .filter_map(|r| r.body)
      .collect();
    assert_eq!(bodies, vec![b"1".to_vec(), b"2".to_vec(), b"3".to_vec()]);
    assert_eq!(network.requests()[1].path(), "/api/report");
  }

  #[tokio::test]
  async fn test_rejected_resend_stays_queued() {
    let (trigger, queue) = trigger();
    let network = ScriptedNetwork::new();
    network.reply(Method::Post, "/api/sos", Response::new(429));
    queue.enqueue("/api/sos", None, b"{}").unwrap();

    let report = trigger.on_sync(TAG, &network).await.unwrap().unwrap();

    assert!(!report.is_complete());
    assert_eq!(queue.len().unwrap(), 1);
  }

  #[tokio::test]
  async fn test_offline_sync_keeps_everything() {
    let (trigger, queue) = trigger();
    let network = ScriptedNetwork::new();
    network.set_offline(true);
    queue.enqueue("/api/sos", None, b"1").unwrap();
    queue.enqueue("/api/sos", None, b"2").unwrap();

    let report = trigger.on_sync(TAG, &network).await.unwrap().unwrap();

    assert_eq!(report.retained.len(), 2);
    assert_eq!(network.request_count(), 2);
  }

  #[tokio::test]
  async fn test_other_tags_are_ignored() {
    let (trigger, queue) = trigger();
    let network = ScriptedNetwork::new();
    queue.enqueue("/api/sos", None, b"{}").unwrap();

    assert!(trigger.on_sync("periodic-refresh", &network).await.unwrap().is_none());
    assert_eq!(network.request_count(), 0);
    assert_eq!(queue.len().unwrap(), 1);
  }
}
