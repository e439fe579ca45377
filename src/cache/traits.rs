//! Core traits and types for the versioned cache store.

use chrono::{DateTime, Utc};
use color_eyre::Result;

use crate::http::{RequestIdentity, Response};

/// A response read back from a cache store.
#[derive(Debug, Clone)]
pub struct CachedResponse {
  pub response: Response,
  /// When the entry was written
  pub cached_at: DateTime<Utc>,
}

/// Versioned key-value store: cache name -> request identity -> response.
///
/// Every cache name is one generation of assets. The lifecycle only ever
/// creates, lists and deletes whole stores; the fetch path reads and writes
/// single entries.
pub trait CacheStorage: Send + Sync {
  /// Create the named store if it does not exist yet.
  fn open_cache(&self, name: &str) -> Result<()>;

  fn has_cache(&self, name: &str) -> Result<bool>;

  /// Names of every existing store, oldest first.
  fn cache_names(&self) -> Result<Vec<String>>;

  /// Delete a store and all its entries. Returns false if it did not exist.
  fn delete_cache(&self, name: &str) -> Result<bool>;

  /// Insert or overwrite one entry, creating the store if needed.
  fn put(&self, name: &str, identity: &RequestIdentity, response: &Response) -> Result<()>;

  /// Insert a batch of entries atomically: either all are stored or none.
  fn put_all(&self, name: &str, entries: &[(RequestIdentity, Response)]) -> Result<()>;

  fn match_entry(&self, name: &str, identity: &RequestIdentity) -> Result<Option<CachedResponse>>;

  fn entry_count(&self, name: &str) -> Result<usize>;
}
