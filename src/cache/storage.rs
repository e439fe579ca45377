//! SQLite implementation of the versioned cache store.

use chrono::{DateTime, Utc};
use color_eyre::{eyre::eyre, Result};
use rusqlite::{params, Connection, OptionalExtension};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;

use super::traits::{CacheStorage, CachedResponse};
use crate::db::Database;
use crate::http::{RequestIdentity, Response, ResponseType};

/// SQLite-based cache storage.
#[derive(Clone)]
pub struct SqliteStorage {
  db: Database,
}

impl SqliteStorage {
  pub fn new(db: Database) -> Self {
    Self { db }
  }
}

/// SHA256 of the identity, for stable fixed-length primary keys.
fn entry_key(identity: &RequestIdentity) -> String {
  let mut hasher = Sha256::new();
  hasher.update(identity.to_string().as_bytes());
  hex::encode(hasher.finalize())
}

fn ensure_store(conn: &Connection, name: &str) -> Result<()> {
  conn
    .execute(
      "INSERT OR IGNORE INTO cache_stores (name) VALUES (?)",
      params![name],
    )
    .map_err(|e| eyre!("Failed to create cache store {}: {}", name, e))?;
  Ok(())
}

fn insert_entry(
  conn: &Connection,
  name: &str,
  identity: &RequestIdentity,
  response: &Response,
) -> Result<()> {
  let headers = serde_json::to_string(&response.headers)
    .map_err(|e| eyre!("Failed to serialize headers: {}", e))?;

  conn
    .execute(
      "INSERT OR REPLACE INTO cache_entries
         (cache_name, entry_key, method, url, status, status_text, headers, body, response_type, cached_at)
       VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, datetime('now'))",
      params![
        name,
        entry_key(identity),
        identity.method.as_str(),
        identity.url,
        response.status,
        response.status_text,
        headers,
        response.body,
        response.response_type.as_str(),
      ],
    )
    .map_err(|e| eyre!("Failed to store cache entry {}: {}", identity, e))?;

  Ok(())
}

impl CacheStorage for SqliteStorage {
  fn open_cache(&self, name: &str) -> Result<()> {
    let conn = self.db.lock()?;
    ensure_store(&conn, name)
  }

  fn has_cache(&self, name: &str) -> Result<bool> {
    let conn = self.db.lock()?;
    let found: Option<String> = conn
      .query_row(
        "SELECT name FROM cache_stores WHERE name = ?",
        params![name],
        |row| row.get(0),
      )
      .optional()
      .map_err(|e| eyre!("Failed to look up cache store {}: {}", name, e))?;
    Ok(found.is_some())
  }

  fn cache_names(&self) -> Result<Vec<String>> {
    let conn = self.db.lock()?;
    let mut stmt = conn
      .prepare("SELECT name FROM cache_stores ORDER BY created_at, rowid")
      .map_err(|e| eyre!("Failed to prepare query: {}", e))?;

    let names = stmt
      .query_map([], |row| row.get(0))
      .map_err(|e| eyre!("Failed to list cache stores: {}", e))?
      .collect::<rusqlite::Result<Vec<String>>>()
      .map_err(|e| eyre!("Failed to read cache store name: {}", e))?;

    Ok(names)
  }

  fn delete_cache(&self, name: &str) -> Result<bool> {
    let mut conn = self.db.lock()?;
    let tx = conn
      .transaction()
      .map_err(|e| eyre!("Failed to begin transaction: {}", e))?;

    tx.execute(
      "DELETE FROM cache_entries WHERE cache_name = ?",
      params![name],
    )
    .map_err(|e| eyre!("Failed to delete entries of {}: {}", name, e))?;

    let removed = tx
      .execute("DELETE FROM cache_stores WHERE name = ?", params![name])
      .map_err(|e| eyre!("Failed to delete cache store {}: {}", name, e))?;

    tx.commit()
      .map_err(|e| eyre!("Failed to commit transaction: {}", e))?;

    Ok(removed > 0)
  }

  fn put(&self, name: &str, identity: &RequestIdentity, response: &Response) -> Result<()> {
    let conn = self.db.lock()?;
    ensure_store(&conn, name)?;
    insert_entry(&conn, name, identity, response)
  }

  fn put_all(&self, name: &str, entries: &[(RequestIdentity, Response)]) -> Result<()> {
    let mut conn = self.db.lock()?;
    let tx = conn
      .transaction()
      .map_err(|e| eyre!("Failed to begin transaction: {}", e))?;

    ensure_store(&tx, name)?;
    for (identity, response) in entries {
      insert_entry(&tx, name, identity, response)?;
    }

    // Dropping the transaction on an early return rolls everything back
    tx.commit()
      .map_err(|e| eyre!("Failed to commit transaction: {}", e))?;

    Ok(())
  }

  fn match_entry(&self, name: &str, identity: &RequestIdentity) -> Result<Option<CachedResponse>> {
    let conn = self.db.lock()?;

    let row: Option<(u16, String, String, Vec<u8>, String, String)> = conn
      .query_row(
        "SELECT status, status_text, headers, body, response_type, cached_at
         FROM cache_entries WHERE cache_name = ? AND entry_key = ?",
        params![name, entry_key(identity)],
        |row| {
          Ok((
            row.get(0)?,
            row.get(1)?,
            row.get(2)?,
            row.get(3)?,
            row.get(4)?,
            row.get(5)?,
          ))
        },
      )
      .optional()
      .map_err(|e| eyre!("Failed to query cache entry {}: {}", identity, e))?;

    let Some((status, status_text, headers, body, response_type, cached_at)) = row else {
      return Ok(None);
    };

    let headers: BTreeMap<String, String> = serde_json::from_str(&headers)
      .map_err(|e| eyre!("Failed to deserialize headers of {}: {}", identity, e))?;

    Ok(Some(CachedResponse {
      response: Response {
        status,
        status_text,
        headers,
        body,
        response_type: ResponseType::parse(&response_type),
      },
      cached_at: parse_datetime(&cached_at)?,
    }))
  }

  fn entry_count(&self, name: &str) -> Result<usize> {
    let conn = self.db.lock()?;
    let count: i64 = conn
      .query_row(
        "SELECT COUNT(*) FROM cache_entries WHERE cache_name = ?",
        params![name],
        |row| row.get(0),
      )
      .map_err(|e| eyre!("Failed to count entries of {}: {}", name, e))?;
    Ok(count as usize)
  }
}

/// Parse a datetime string from SQLite format.
fn parse_datetime(s: &str) -> Result<DateTime<Utc>> {
  // SQLite stores as "YYYY-MM-DD HH:MM:SS"
  chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S")
    .map(|dt| dt.and_utc())
    .map_err(|e| eyre!("Failed to parse datetime '{}': {}", s, e))
}
