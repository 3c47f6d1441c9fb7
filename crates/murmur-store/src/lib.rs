//! Persistence contracts for rooms, sessions and the message cache.
//!
//! Two backends implement both traits:
//!
//! - [`MemoryStore`]: in-process, TTL-native. Expired entries are invisible
//!   and get dropped the next time their key space is touched.
//! - [`SqliteStore`]: rooms and sessions carry an `expires_at` column that
//!   every read filters on.
//!
//! For both, [`cleanup::run_cleanup_loop`] reclaims whatever expired without
//! being looked at again.
//!
//! All methods are blocking. Async callers go through [`blocking`].

pub mod cleanup;
pub mod memory;
mod migrations;
mod queries;
pub mod sqlite;

use std::time::Duration;

use murmur_types::models::{DateFilter, Message, RoomRecord, Session};

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// The key is absent or its TTL has lapsed.
    #[error("not found")]
    NotFound,

    /// A live room already holds the id.
    #[error("already exists")]
    AlreadyExists,

    #[error("sqlite: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("store lock poisoned")]
    Poisoned,

    #[error("corrupt record: {0}")]
    Corrupt(String),

    #[error("blocking task failed: {0}")]
    Task(String),
}

pub type Result<T> = std::result::Result<T, StoreError>;

/// Rooms and sessions, both with TTL semantics.
///
/// TTLs are relative to the call. Re-adding an existing key replaces its value
/// and resets its TTL. Removals are idempotent.
pub trait RoomStore: Send + Sync {
    fn add_room(&self, room: &RoomRecord, ttl: Duration) -> Result<()>;
    /// Insert `room` unless a live room holds its id, in which case nothing
    /// is written and [`StoreError::AlreadyExists`] is returned. Sessions left
    /// over from an expired room under the same id are dropped.
    fn create_room(&self, room: &RoomRecord, ttl: Duration) -> Result<()>;
    fn get_room(&self, id: &str) -> Result<RoomRecord>;
    fn room_exists(&self, id: &str) -> Result<bool>;
    /// Fails with [`StoreError::NotFound`] if the room already expired.
    fn extend_room_ttl(&self, id: &str, ttl: Duration) -> Result<()>;
    fn remove_room(&self, id: &str) -> Result<()>;

    fn add_session(&self, session_id: &str, handle: &str, room_id: &str, ttl: Duration) -> Result<()>;
    fn get_session(&self, session_id: &str, room_id: &str) -> Result<Session>;
    fn remove_session(&self, session_id: &str, room_id: &str) -> Result<()>;
    fn clear_sessions(&self, room_id: &str) -> Result<()>;

    /// Drop every expired room and session. Returns how many were removed.
    fn purge_expired(&self) -> Result<usize>;
}

/// Durable, time-range queryable log of broadcast messages.
pub trait MessageCache: Send + Sync {
    /// Persist one record. A timestamp already taken in the room is shifted
    /// forward by a nanosecond until it is unique.
    fn append(&self, message: &Message) -> Result<()>;

    /// Records of `room_id` inside any of `filters` (all records when
    /// `filters` is empty), ascending by timestamp. With `limit > 0` only the
    /// newest `limit` matches are returned.
    fn query(&self, room_id: &str, limit: usize, filters: &[DateFilter]) -> Result<Vec<Message>>;
}

/// Run a blocking store call off the async runtime.
pub async fn blocking<T, F>(f: F) -> Result<T>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| StoreError::Task(e.to_string()))?
}

/// Convert a TTL into an absolute expiry in unix milliseconds.
pub(crate) fn expiry_millis(now: chrono::DateTime<chrono::Utc>, ttl: Duration) -> i64 {
    let ttl_ms = i64::try_from(ttl.as_millis()).unwrap_or(i64::MAX);
    now.timestamp_millis().saturating_add(ttl_ms)
}
