use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};

use chrono::{DateTime, TimeDelta, Utc};
use murmur_types::models::{DateFilter, Message, RoomRecord, Session};

use crate::{MessageCache, Result, RoomStore, StoreError};

struct Expiring<T> {
    value: T,
    expires_at: Instant,
}

impl<T> Expiring<T> {
    fn new(value: T, ttl: Duration) -> Self {
        Self {
            value,
            expires_at: deadline(ttl),
        }
    }

    fn is_live(&self, now: Instant) -> bool {
        now < self.expires_at
    }
}

fn deadline(ttl: Duration) -> Instant {
    let now = Instant::now();
    // Roughly a century; anything longer is "never" for our purposes.
    now.checked_add(ttl)
        .unwrap_or_else(|| now + Duration::from_secs(3_153_600_000))
}

fn lock<T>(mutex: &Mutex<T>) -> Result<MutexGuard<'_, T>> {
    mutex.lock().map_err(|_| StoreError::Poisoned)
}

/// In-process store with native TTL semantics.
///
/// An expired entry stops being visible and is dropped by the next call that
/// looks at it, or by [`RoomStore::purge_expired`]. An expired room takes its
/// sessions with it.
#[derive(Default)]
pub struct MemoryStore {
    rooms: Mutex<HashMap<String, Expiring<RoomRecord>>>,
    /// room_id -> session_id -> session
    sessions: Mutex<HashMap<String, HashMap<String, Expiring<Session>>>>,
    /// room_id -> timestamp -> payload
    messages: Mutex<HashMap<String, BTreeMap<DateTime<Utc>, Vec<u8>>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drop an expired room together with its sessions. Takes the rooms
    /// guard so the sessions lock is always acquired second.
    fn forget_room(
        &self,
        rooms: &mut MutexGuard<'_, HashMap<String, Expiring<RoomRecord>>>,
        id: &str,
    ) -> Result<()> {
        rooms.remove(id);
        lock(&self.sessions)?.remove(id);
        Ok(())
    }
}

impl RoomStore for MemoryStore {
    fn add_room(&self, room: &RoomRecord, ttl: Duration) -> Result<()> {
        lock(&self.rooms)?.insert(room.id.clone(), Expiring::new(room.clone(), ttl));
        Ok(())
    }

    fn create_room(&self, room: &RoomRecord, ttl: Duration) -> Result<()> {
        let mut rooms = lock(&self.rooms)?;
        match rooms.get(&room.id) {
            Some(entry) if entry.is_live(Instant::now()) => return Err(StoreError::AlreadyExists),
            Some(_) => self.forget_room(&mut rooms, &room.id)?,
            None => {}
        }
        rooms.insert(room.id.clone(), Expiring::new(room.clone(), ttl));
        Ok(())
    }

    fn get_room(&self, id: &str) -> Result<RoomRecord> {
        let mut rooms = lock(&self.rooms)?;
        match rooms.get(id) {
            Some(entry) if entry.is_live(Instant::now()) => Ok(entry.value.clone()),
            Some(_) => {
                self.forget_room(&mut rooms, id)?;
                Err(StoreError::NotFound)
            }
            None => Err(StoreError::NotFound),
        }
    }

    fn room_exists(&self, id: &str) -> Result<bool> {
        match self.get_room(id) {
            Ok(_) => Ok(true),
            Err(StoreError::NotFound) => Ok(false),
            Err(e) => Err(e),
        }
    }

    fn extend_room_ttl(&self, id: &str, ttl: Duration) -> Result<()> {
        let mut rooms = lock(&self.rooms)?;
        match rooms.get_mut(id) {
            Some(entry) if entry.is_live(Instant::now()) => {
                entry.expires_at = deadline(ttl);
                Ok(())
            }
            Some(_) => {
                self.forget_room(&mut rooms, id)?;
                Err(StoreError::NotFound)
            }
            None => Err(StoreError::NotFound),
        }
    }

    fn remove_room(&self, id: &str) -> Result<()> {
        lock(&self.rooms)?.remove(id);
        Ok(())
    }

    fn add_session(&self, session_id: &str, handle: &str, room_id: &str, ttl: Duration) -> Result<()> {
        let now = Instant::now();
        let mut sessions = lock(&self.sessions)?;
        let room = sessions.entry(room_id.to_string()).or_default();
        room.retain(|_, s| s.is_live(now));
        room.insert(
            session_id.to_string(),
            Expiring::new(
                Session {
                    id: session_id.to_string(),
                    handle: handle.to_string(),
                    room_id: room_id.to_string(),
                },
                ttl,
            ),
        );
        Ok(())
    }

    fn get_session(&self, session_id: &str, room_id: &str) -> Result<Session> {
        let mut sessions = lock(&self.sessions)?;
        let room = sessions.get_mut(room_id).ok_or(StoreError::NotFound)?;
        match room.get(session_id) {
            Some(entry) if entry.is_live(Instant::now()) => Ok(entry.value.clone()),
            Some(_) => {
                room.remove(session_id);
                Err(StoreError::NotFound)
            }
            None => Err(StoreError::NotFound),
        }
    }

    fn remove_session(&self, session_id: &str, room_id: &str) -> Result<()> {
        if let Some(room) = lock(&self.sessions)?.get_mut(room_id) {
            room.remove(session_id);
        }
        Ok(())
    }

    fn clear_sessions(&self, room_id: &str) -> Result<()> {
        lock(&self.sessions)?.remove(room_id);
        Ok(())
    }

    fn purge_expired(&self) -> Result<usize> {
        let now = Instant::now();
        let mut rooms = lock(&self.rooms)?;
        let mut sessions = lock(&self.sessions)?;

        let mut purged = 0;
        rooms.retain(|id, room| {
            if room.is_live(now) {
                return true;
            }
            purged += 1 + sessions.remove(id).map_or(0, |bucket| bucket.len());
            false
        });

        sessions.retain(|_, bucket| {
            let before = bucket.len();
            bucket.retain(|_, s| s.is_live(now));
            purged += before - bucket.len();
            !bucket.is_empty()
        });
        Ok(purged)
    }
}

impl MessageCache for MemoryStore {
    fn append(&self, message: &Message) -> Result<()> {
        let mut messages = lock(&self.messages)?;
        let log = messages.entry(message.room_id.clone()).or_default();

        let mut timestamp = message.timestamp;
        while log.contains_key(&timestamp) {
            timestamp += TimeDelta::nanoseconds(1);
        }
        log.insert(timestamp, message.payload.clone());
        Ok(())
    }

    fn query(&self, room_id: &str, limit: usize, filters: &[DateFilter]) -> Result<Vec<Message>> {
        let messages = lock(&self.messages)?;
        let Some(log) = messages.get(room_id) else {
            return Ok(vec![]);
        };

        let take = if limit > 0 { limit } else { usize::MAX };
        let mut out: Vec<Message> = log
            .iter()
            .rev()
            .filter(|(ts, _)| DateFilter::any_contains(filters, **ts))
            .take(take)
            .map(|(ts, payload)| Message {
                timestamp: *ts,
                room_id: room_id.to_string(),
                payload: payload.clone(),
            })
            .collect();
        out.reverse();
        Ok(out)
    }
}
