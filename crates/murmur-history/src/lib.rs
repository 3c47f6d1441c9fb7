//! Chat history lookup.
//!
//! A request names a range of calendar days, optionally narrowed to daily hour
//! ranges in some timezone. [`resolve_windows`] turns that into UTC windows and
//! [`fetch`] runs them against the message cache.

mod windows;

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Deserialize;
use tracing::debug;

use murmur_store::{MessageCache, StoreError, blocking};
use murmur_types::models::Message;

pub use windows::resolve_windows;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct HistoryRequest {
    /// First day, `YYYY-MM-DD`.
    #[serde(default)]
    pub from: String,
    /// Last day, inclusive.
    #[serde(default)]
    pub until: String,
    /// Comma separated `HH:MM:SS-HH:MM:SS` ranges applied to every day.
    #[serde(default)]
    pub hours: Option<String>,
    /// IANA zone name the days and hours are expressed in. Defaults to UTC.
    #[serde(default)]
    pub timezone: Option<String>,
    /// Newest records to keep; 0 keeps all.
    #[serde(default)]
    pub limit: usize,
}

#[derive(Debug, thiserror::Error)]
pub enum HistoryError {
    #[error("error parsing \"{0}\" param, expected YYYY-MM-DD")]
    InvalidDate(&'static str),

    /// Outside the years a nanosecond timestamp can hold.
    #[error("\"{0}\" must fall between years 1678 and 2261")]
    DateOutOfRange(&'static str),

    #[error("date of \"from\" can't be after \"until\"")]
    InvalidRange,

    #[error("error parsing hours range {0:?}")]
    InvalidHours(String),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Resolve `req` and query the cache for `room_id`, oldest first.
///
/// A request lying entirely in the future yields nothing without touching the
/// cache; an empty window list would otherwise mean "no time restriction".
pub async fn fetch(
    cache: Arc<dyn MessageCache>,
    room_id: &str,
    req: &HistoryRequest,
    now: DateTime<Utc>,
) -> Result<Vec<Message>, HistoryError> {
    let windows = resolve_windows(req, now)?;
    if windows.is_empty() {
        debug!("History request for room {} is entirely in the future", room_id);
        return Ok(Vec::new());
    }

    debug!("Querying room {} history over {} windows", room_id, windows.len());
    let room_id = room_id.to_string();
    let limit = req.limit;
    Ok(blocking(move || cache.query(&room_id, limit, &windows)).await?)
}
