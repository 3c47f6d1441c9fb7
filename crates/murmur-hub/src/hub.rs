use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::RwLock;
use tracing::{debug, info};

use murmur_store::{MessageCache, RoomStore, StoreError, blocking};
use murmur_types::models::RoomRecord;

use crate::room::{Room, RoomConfig};
use crate::{HubError, generate_token};

#[derive(Debug, Clone)]
pub struct HubConfig {
    /// TTL given to a room on creation and on every activation.
    pub room_age: Duration,
    /// Length of generated room ids.
    pub room_id_length: usize,
    pub room: RoomConfig,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            room_age: Duration::from_secs(24 * 60 * 60),
            room_id_length: 10,
            room: RoomConfig::default(),
        }
    }
}

/// Registry of live rooms.
///
/// The store is the source of truth; the registry only caches running rooms
/// and is reconciled with the store on every [`Hub::activate`]. There is no
/// background expiry: a room whose TTL lapsed is noticed the next time
/// something tries to activate it.
#[derive(Clone)]
pub struct Hub {
    inner: Arc<HubInner>,
}

struct HubInner {
    store: Arc<dyn RoomStore>,
    messages: Arc<dyn MessageCache>,
    config: HubConfig,
    rooms: RwLock<HashMap<String, Room>>,
}

impl Hub {
    pub fn new(store: Arc<dyn RoomStore>, messages: Arc<dyn MessageCache>, config: HubConfig) -> Self {
        Self {
            inner: Arc::new(HubInner {
                store,
                messages,
                config,
                rooms: RwLock::new(HashMap::new()),
            }),
        }
    }

    pub fn store(&self) -> Arc<dyn RoomStore> {
        self.inner.store.clone()
    }

    pub fn message_cache(&self) -> Arc<dyn MessageCache> {
        self.inner.messages.clone()
    }

    pub fn room_age(&self) -> Duration {
        self.inner.config.room_age
    }

    /// Create and activate a room.
    ///
    /// With no `id` a fresh one is generated. An explicit `id` that is already
    /// live in the store fails with [`HubError::AlreadyExists`]; the existence
    /// check and the write are one store operation, so of several concurrent
    /// creators exactly one wins.
    pub async fn create_room(
        &self,
        id: Option<&str>,
        name: &str,
        password_hash: &str,
    ) -> Result<Room, HubError> {
        let explicit = id.filter(|id| !id.is_empty());

        loop {
            let record = RoomRecord {
                id: explicit
                    .map(str::to_string)
                    .unwrap_or_else(|| generate_token(self.inner.config.room_id_length)),
                name: name.to_string(),
                password: password_hash.to_string(),
                created_at: Utc::now(),
            };

            let store = self.store();
            let ttl = self.room_age();
            let stored = record.clone();
            match blocking(move || store.create_room(&stored, ttl)).await {
                Ok(()) => {
                    info!("Created room {} ({})", record.id, record.name);
                    return Ok(self.cache_room(record).await);
                }
                // Generated id collided; draw another.
                Err(StoreError::AlreadyExists) if explicit.is_none() => continue,
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Look up a live room and extend its TTL.
    pub async fn activate(&self, room_id: &str) -> Result<Room, HubError> {
        let store = self.store();
        let ttl = self.room_age();
        let id = room_id.to_string();
        match blocking(move || store.extend_room_ttl(&id, ttl)).await {
            Ok(()) => {}
            Err(StoreError::NotFound) => {
                self.evict_stale(room_id).await?;
                return Err(HubError::NotFound);
            }
            Err(e) => return Err(e.into()),
        }

        if let Some(room) = self.inner.rooms.read().await.get(room_id) {
            if !room.is_closed() {
                return Ok(room.clone());
            }
        }

        let store = self.store();
        let id = room_id.to_string();
        let record = blocking(move || store.get_room(&id)).await?;
        Ok(self.cache_room(record).await)
    }

    /// Delete a room and all of its sessions, disconnecting its peers.
    /// Removing an unknown room is not an error.
    pub async fn remove(&self, room_id: &str) -> Result<(), HubError> {
        let store = self.store();
        let id = room_id.to_string();
        blocking(move || {
            store.remove_room(&id)?;
            store.clear_sessions(&id)
        })
        .await?;

        self.evict_stale(room_id).await?;
        info!("Removed room {}", room_id);
        Ok(())
    }

    /// Stop cached rooms whose store record has expired. Returns how many
    /// were evicted.
    pub async fn evict_expired(&self) -> Result<usize, HubError> {
        let ids: Vec<String> = self.inner.rooms.read().await.keys().cloned().collect();

        let mut evicted = 0;
        for id in ids {
            if self.evict_stale(&id).await? {
                debug!("Room {} expired, evicted", id);
                evicted += 1;
            }
        }
        Ok(evicted)
    }

    /// Number of rooms with a running broadcast loop.
    pub async fn active_rooms(&self) -> usize {
        self.inner.rooms.read().await.len()
    }

    /// Dispose every cached room. Used on process shutdown.
    pub async fn shutdown(&self) {
        let rooms: Vec<Room> = self
            .inner
            .rooms
            .write()
            .await
            .drain()
            .map(|(_, room)| room)
            .collect();

        info!("Shutting down {} rooms", rooms.len());
        for room in rooms {
            room.dispose().await;
        }
    }

    /// The running room for `record`, spawning one if none is cached. A cached
    /// room that stopped or belongs to an earlier room under the same id is
    /// replaced and disposed.
    async fn cache_room(&self, record: RoomRecord) -> Room {
        let mut rooms = self.inner.rooms.write().await;
        if let Some(room) = rooms.get(&record.id) {
            if !room.is_closed() && is_same_room(room, &record) {
                return room.clone();
            }
        }

        let room = Room::spawn(record, self.message_cache(), self.inner.config.room.clone());
        let stale = rooms.insert(room.id().to_string(), room.clone());
        drop(rooms);

        if let Some(stale) = stale {
            debug!("Replacing stale room {}", room.id());
            stale.dispose().await;
        }
        room
    }

    /// Dispose the cached room under `room_id` unless the store still holds
    /// that same room. The check runs under the registry lock so a room
    /// created concurrently is never the one evicted.
    async fn evict_stale(&self, room_id: &str) -> Result<bool, HubError> {
        let mut rooms = self.inner.rooms.write().await;
        let Some(room) = rooms.get(room_id).cloned() else {
            return Ok(false);
        };

        let store = self.store();
        let id = room_id.to_string();
        let current = match blocking(move || store.get_room(&id)).await {
            Ok(record) => Some(record),
            Err(StoreError::NotFound) => None,
            Err(e) => return Err(e.into()),
        };
        if current.is_some_and(|record| !room.is_closed() && is_same_room(&room, &record)) {
            return Ok(false);
        }

        rooms.remove(room_id);
        drop(rooms);
        room.dispose().await;
        Ok(true)
    }
}

fn is_same_room(room: &Room, record: &RoomRecord) -> bool {
    room.created_at() == record.created_at && room.password_hash() == record.password
}
