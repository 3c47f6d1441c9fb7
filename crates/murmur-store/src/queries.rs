use std::collections::BTreeMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use rusqlite::types::Value;
use rusqlite::{Connection, OptionalExtension, params, params_from_iter};

use murmur_types::models::{DateFilter, Message, RoomRecord, Session};

use crate::sqlite::SqliteStore;
use crate::{MessageCache, Result, RoomStore, StoreError, expiry_millis};

/// Windows OR'd into a single statement. SQLite caps expression depth at
/// 1000 and bound parameters at 32766; larger window lists are batched.
const WINDOWS_PER_QUERY: usize = 200;

fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

fn to_nanos(ts: DateTime<Utc>) -> Result<i64> {
    ts.timestamp_nanos_opt()
        .ok_or_else(|| StoreError::Corrupt(format!("timestamp out of range: {ts}")))
}

impl RoomStore for SqliteStore {
    // -- Rooms --

    fn add_room(&self, room: &RoomRecord, ttl: Duration) -> Result<()> {
        let expires_at = expiry_millis(Utc::now(), ttl);
        self.with_conn(|conn| {
            conn.execute(
                "INSERT OR REPLACE INTO rooms (id, name, password, created_at, expires_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    room.id,
                    room.name,
                    room.password,
                    room.created_at.to_rfc3339(),
                    expires_at
                ],
            )?;
            Ok(())
        })
    }

    fn create_room(&self, room: &RoomRecord, ttl: Duration) -> Result<()> {
        let now = Utc::now();
        let expires_at = expiry_millis(now, ttl);
        self.with_conn(|conn| {
            let tx = conn.unchecked_transaction()?;
            // Only an expired row may be taken over.
            let written = tx.execute(
                "INSERT INTO rooms (id, name, password, created_at, expires_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)
                 ON CONFLICT(id) DO UPDATE SET
                    name = excluded.name,
                    password = excluded.password,
                    created_at = excluded.created_at,
                    expires_at = excluded.expires_at
                 WHERE rooms.expires_at <= ?6",
                params![
                    room.id,
                    room.name,
                    room.password,
                    room.created_at.to_rfc3339(),
                    expires_at,
                    now.timestamp_millis()
                ],
            )?;
            if written == 0 {
                return Err(StoreError::AlreadyExists);
            }
            tx.execute("DELETE FROM sessions WHERE room_id = ?1", [&room.id])?;
            tx.commit()?;
            Ok(())
        })
    }

    fn get_room(&self, id: &str) -> Result<RoomRecord> {
        self.with_conn(|conn| query_room(conn, id))?
            .ok_or(StoreError::NotFound)
    }

    fn room_exists(&self, id: &str) -> Result<bool> {
        self.with_conn(|conn| {
            let found = conn
                .query_row(
                    "SELECT 1 FROM rooms WHERE id = ?1 AND expires_at > ?2",
                    params![id, now_millis()],
                    |_| Ok(()),
                )
                .optional()?;
            Ok(found.is_some())
        })
    }

    fn extend_room_ttl(&self, id: &str, ttl: Duration) -> Result<()> {
        let now = Utc::now();
        let changed = self.with_conn(|conn| {
            Ok(conn.execute(
                "UPDATE rooms SET expires_at = ?2 WHERE id = ?1 AND expires_at > ?3",
                params![id, expiry_millis(now, ttl), now.timestamp_millis()],
            )?)
        })?;

        if changed == 0 {
            return Err(StoreError::NotFound);
        }
        Ok(())
    }

    fn remove_room(&self, id: &str) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute("DELETE FROM rooms WHERE id = ?1", [id])?;
            Ok(())
        })
    }

    // -- Sessions --

    fn add_session(&self, session_id: &str, handle: &str, room_id: &str, ttl: Duration) -> Result<()> {
        let expires_at = expiry_millis(Utc::now(), ttl);
        self.with_conn(|conn| {
            conn.execute(
                "INSERT OR REPLACE INTO sessions (id, room_id, handle, expires_at)
                 VALUES (?1, ?2, ?3, ?4)",
                params![session_id, room_id, handle, expires_at],
            )?;
            Ok(())
        })
    }

    fn get_session(&self, session_id: &str, room_id: &str) -> Result<Session> {
        self.with_conn(|conn| {
            Ok(conn
                .query_row(
                    "SELECT id, handle, room_id FROM sessions
                     WHERE id = ?1 AND room_id = ?2 AND expires_at > ?3",
                    params![session_id, room_id, now_millis()],
                    |row| {
                        Ok(Session {
                            id: row.get(0)?,
                            handle: row.get(1)?,
                            room_id: row.get(2)?,
                        })
                    },
                )
                .optional()?)
        })?
        .ok_or(StoreError::NotFound)
    }

    fn remove_session(&self, session_id: &str, room_id: &str) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "DELETE FROM sessions WHERE id = ?1 AND room_id = ?2",
                [session_id, room_id],
            )?;
            Ok(())
        })
    }

    fn clear_sessions(&self, room_id: &str) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute("DELETE FROM sessions WHERE room_id = ?1", [room_id])?;
            Ok(())
        })
    }

    fn purge_expired(&self) -> Result<usize> {
        let now = now_millis();
        self.with_conn(|conn| {
            let rooms = conn.execute("DELETE FROM rooms WHERE expires_at <= ?1", [now])?;
            let sessions = conn.execute("DELETE FROM sessions WHERE expires_at <= ?1", [now])?;
            Ok(rooms + sessions)
        })
    }
}

impl MessageCache for SqliteStore {
    fn append(&self, message: &Message) -> Result<()> {
        let mut ts = to_nanos(message.timestamp)?;
        self.with_conn(|conn| {
            // (room_id, ts) is the primary key; nudge forward until it is free.
            loop {
                let inserted = conn.execute(
                    "INSERT OR IGNORE INTO messages (room_id, ts, payload) VALUES (?1, ?2, ?3)",
                    params![message.room_id, ts, message.payload],
                )?;
                if inserted == 1 {
                    return Ok(());
                }
                ts = ts
                    .checked_add(1)
                    .ok_or_else(|| StoreError::Corrupt("timestamp overflow".into()))?;
            }
        })
    }

    fn query(&self, room_id: &str, limit: usize, filters: &[DateFilter]) -> Result<Vec<Message>> {
        if filters.len() <= WINDOWS_PER_QUERY {
            let mut rows = self.query_windows(room_id, limit, filters)?;
            rows.reverse();
            return Ok(rows);
        }

        // Each batch yields its own newest `limit`; the overall newest are
        // among them. Windows may overlap across batches, so key by ts.
        let mut merged: BTreeMap<DateTime<Utc>, Vec<u8>> = BTreeMap::new();
        for batch in filters.chunks(WINDOWS_PER_QUERY) {
            for message in self.query_windows(room_id, limit, batch)? {
                merged.insert(message.timestamp, message.payload);
            }
        }

        let take = if limit > 0 { limit } else { usize::MAX };
        let mut out: Vec<Message> = merged
            .into_iter()
            .rev()
            .take(take)
            .map(|(timestamp, payload)| Message {
                timestamp,
                room_id: room_id.to_string(),
                payload,
            })
            .collect();
        out.reverse();
        Ok(out)
    }
}

impl SqliteStore {
    /// One statement over `filters`, newest first.
    fn query_windows(&self, room_id: &str, limit: usize, filters: &[DateFilter]) -> Result<Vec<Message>> {
        let mut sql = String::from("SELECT ts, payload FROM messages WHERE room_id = ?");
        let mut values: Vec<Value> = vec![Value::Text(room_id.to_string())];

        if !filters.is_empty() {
            let mut windows = Vec::with_capacity(filters.len());
            for filter in filters {
                let mut bounds = Vec::new();
                if let Some(start) = filter.start {
                    bounds.push("ts >= ?");
                    values.push(Value::Integer(to_nanos(start)?));
                }
                if let Some(end) = filter.end {
                    bounds.push("ts <= ?");
                    values.push(Value::Integer(to_nanos(end)?));
                }
                if bounds.is_empty() {
                    windows.push("1".to_string());
                } else {
                    windows.push(bounds.join(" AND "));
                }
            }
            sql.push_str(&format!(" AND (({}))", windows.join(") OR (")));
        }

        sql.push_str(" ORDER BY ts DESC");
        if limit > 0 {
            sql.push_str(" LIMIT ?");
            values.push(Value::Integer(i64::try_from(limit).unwrap_or(i64::MAX)));
        }

        self.with_conn(|conn| {
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt
                .query_map(params_from_iter(values.iter()), |row| {
                    Ok(Message {
                        timestamp: DateTime::from_timestamp_nanos(row.get(0)?),
                        room_id: room_id.to_string(),
                        payload: row.get(1)?,
                    })
                })?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }
}

fn query_room(conn: &Connection, id: &str) -> Result<Option<RoomRecord>> {
    let row = conn
        .query_row(
            "SELECT id, name, password, created_at FROM rooms WHERE id = ?1 AND expires_at > ?2",
            params![id, now_millis()],
            |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                ))
            },
        )
        .optional()?;

    let Some((id, name, password, created_at)) = row else {
        return Ok(None);
    };

    let created_at = DateTime::parse_from_rfc3339(&created_at)
        .map_err(|e| StoreError::Corrupt(format!("room {id} created_at '{created_at}': {e}")))?
        .with_timezone(&Utc);

    Ok(Some(RoomRecord {
        id,
        name,
        password,
        created_at,
    }))
}
