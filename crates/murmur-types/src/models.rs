use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A room as persisted in the room store.
///
/// `password` holds the credential hash (a PHC string), never the clear text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoomRecord {
    pub id: String,
    pub name: String,
    pub password: String,
    pub created_at: DateTime<Utc>,
}

/// An authenticated peer session, bound to one room.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    pub id: String,
    pub handle: String,
    pub room_id: String,
}

/// One record of the message cache.
///
/// The timestamp doubles as the record's identity within a room, so it is
/// always UTC and unique per room.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub timestamp: DateTime<Utc>,
    pub room_id: String,
    pub payload: Vec<u8>,
}

/// The application payload stored in [`Message::payload`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatPayload {
    pub message: String,
    pub peer_handle: String,
    pub peer_id: String,
}

/// A time window used to restrict a history query. Both bounds are
/// inclusive; a missing bound is unbounded on that side.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DateFilter {
    pub start: Option<DateTime<Utc>>,
    pub end: Option<DateTime<Utc>>,
}

impl DateFilter {
    pub fn between(start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        Self {
            start: Some(start),
            end: Some(end),
        }
    }

    pub fn contains(&self, ts: DateTime<Utc>) -> bool {
        self.start.is_none_or(|start| ts >= start) && self.end.is_none_or(|end| ts <= end)
    }

    /// Whether `ts` falls inside any of `filters`. An empty list matches everything.
    pub fn any_contains(filters: &[DateFilter], ts: DateTime<Utc>) -> bool {
        filters.is_empty() || filters.iter().any(|f| f.contains(ts))
    }
}
