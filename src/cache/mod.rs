//! Versioned response cache backed by SQLite.
//!
//! Entries are keyed by request identity (normalized URL + method) inside a
//! named store; the store name is the cache version. Invalidation only ever
//! happens wholesale, by deleting a store.

mod storage;
mod traits;

pub use storage::SqliteStorage;
pub use traits::CacheStorage;
