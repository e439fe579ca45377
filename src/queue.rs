//! Durable queue of submissions the API has not acknowledged yet.
//!
//! A record is inserted when a submission fails for lack of connectivity and
//! deleted only after a resend is answered with 2xx. Ids are monotonic, so
//! ordering by id is insertion order.

use chrono::{DateTime, Utc};
use color_eyre::{eyre::eyre, Result};
use rusqlite::{params, OptionalExtension};

use crate::db::Database;

#[derive(Debug, Clone, PartialEq)]
pub struct PendingSubmission {
  pub id: i64,
  /// API path the payload was originally posted to
  pub endpoint: String,
  pub content_type: Option<String>,
  /// Original request body, byte for byte
  pub payload: Vec<u8>,
  pub created_at: DateTime<Utc>,
  pub attempts: u32,
  pub last_attempt_at: Option<DateTime<Utc>>,
}

#[derive(Clone)]
pub struct SubmissionQueue {
  db: Database,
}

impl SubmissionQueue {
  pub fn new(db: Database) -> Self {
    Self { db }
  }

  pub fn enqueue(
    &self,
    endpoint: &str,
    content_type: Option<&str>,
    payload: &[u8],
  ) -> Result<PendingSubmission> {
    let conn = self.db.lock()?;
    let created_at = Utc::now();

    conn
      .execute(
        "INSERT INTO pending_submissions (endpoint, content_type, payload, created_at, attempts)
         VALUES (?, ?, ?, ?, 0)",
        params![endpoint, content_type, payload, created_at.to_rfc3339()],
      )
      .map_err(|e| eyre!("Failed to enqueue submission for {}: {}", endpoint, e))?;

    Ok(PendingSubmission {
      id: conn.last_insert_rowid(),
      endpoint: endpoint.to_string(),
      content_type: content_type.map(String::from),
      payload: payload.to_vec(),
      created_at,
      attempts: 0,
      last_attempt_at: None,
    })
  }

  /// All pending records, oldest first.
  pub fn pending(&self) -> Result<Vec<PendingSubmission>> {
    let conn = self.db.lock()?;
    let mut stmt = conn
      .prepare(
        "SELECT id, endpoint, content_type, payload, created_at, attempts, last_attempt_at
         FROM pending_submissions ORDER BY id",
      )
      .map_err(|e| eyre!("Failed to prepare query: {}", e))?;

    let rows = stmt
      .query_map([], |row| {
        Ok((
          row.get::<_, i64>(0)?,
          row.get::<_, String>(1)?,
          row.get::<_, Option<String>>(2)?,
          row.get::<_, Vec<u8>>(3)?,
          row.get::<_, String>(4)?,
          row.get::<_, u32>(5)?,
          row.get::<_, Option<String>>(6)?,
        ))
      })
      .map_err(|e| eyre!("Failed to query pending submissions: {}", e))?
      .collect::<rusqlite::Result<Vec<_>>>()
      .map_err(|e| eyre!("Failed to read pending submission: {}", e))?;

    rows
      .into_iter()
      .map(
        |(id, endpoint, content_type, payload, created_at, attempts, last_attempt_at)| {
          Ok(PendingSubmission {
            id,
            endpoint,
            content_type,
            payload,
            created_at: parse_timestamp(&created_at)?,
            attempts,
            last_attempt_at: last_attempt_at.as_deref().map(parse_timestamp).transpose()?,
          })
        },
      )
      .collect()
  }

  #[cfg(test)]
  pub fn get(&self, id: i64) -> Result<Option<PendingSubmission>> {
    Ok(self.pending()?.into_iter().find(|s| s.id == id))
  }

  /// Count one delivery attempt against a record.
  pub fn record_attempt(&self, id: i64) -> Result<()> {
    let conn = self.db.lock()?;
    conn
      .execute(
        "UPDATE pending_submissions SET attempts = attempts + 1, last_attempt_at = ? WHERE id = ?",
        params![Utc::now().to_rfc3339(), id],
      )
      .map_err(|e| eyre!("Failed to record attempt for submission {}: {}", id, e))?;
    Ok(())
  }

  /// Remove an acknowledged record. Returns false if it was already gone.
  pub fn remove(&self, id: i64) -> Result<bool> {
    let conn = self.db.lock()?;
    let removed = conn
      .execute("DELETE FROM pending_submissions WHERE id = ?", params![id])
      .map_err(|e| eyre!("Failed to remove submission {}: {}", id, e))?;
    Ok(removed > 0)
  }

  pub fn len(&self) -> Result<usize> {
    let conn = self.db.lock()?;
    let count: Option<i64> = conn
      .query_row("SELECT COUNT(*) FROM pending_submissions", [], |row| {
        row.get(0)
      })
      .optional()
      .map_err(|e| eyre!("Failed to count pending submissions: {}", e))?;
    Ok(count.unwrap_or(0) as usize)
  }

  pub fn is_empty(&self) -> Result<bool> {
    Ok(self.len()? == 0)
  }
}

fn parse_timestamp(s: &str) -> Result<DateTime<Utc>> {
  DateTime::parse_from_rfc3339(s)
    .map(|dt| dt.with_timezone(&Utc))
    .map_err(|e| eyre!("Failed to parse timestamp '{}': {}", s, e))
}
