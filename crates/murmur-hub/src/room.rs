use std::collections::HashMap;
use std::fmt::Display;
use std::sync::Arc;

use bytes::Bytes;
use chrono::{DateTime, TimeDelta, Utc};
use futures_util::{Sink, Stream};
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use murmur_store::MessageCache;
use murmur_types::events::{PeerEvent, PeerInfo};
use murmur_types::models::{ChatPayload, Message, RoomRecord};

use crate::HubError;
use crate::peer::{self, PeerSlot};

/// Inbox size of a room's broadcast loop.
const COMMAND_BUFFER: usize = 256;

#[derive(Debug, Clone)]
pub struct RoomConfig {
    /// Outbound frames buffered per peer before it counts as a slow consumer.
    pub queue_capacity: usize,
    pub max_peers: usize,
    /// Longest accepted chat message, in bytes.
    pub max_message_length: usize,
}

impl Default for RoomConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 64,
            max_peers: 100,
            max_message_length: 2048,
        }
    }
}

/// Everything sent into a room's broadcast loop.
pub(crate) enum Command {
    Join {
        peer_id: String,
        slot: PeerSlot,
    },
    /// Sent by a connection's read pump when it stops. Ignored if the peer id
    /// has since been taken over by a newer connection.
    Leave {
        peer_id: String,
        conn_id: Uuid,
    },
    Kick {
        peer_id: String,
    },
    Message {
        peer_id: String,
        conn_id: Uuid,
        message: String,
    },
    PeerList {
        peer_id: String,
        conn_id: Uuid,
    },
    Peers {
        reply: oneshot::Sender<Vec<PeerInfo>>,
    },
    Dispose,
}

/// Handle to one live chat room.
///
/// Cloning is cheap. All peer bookkeeping and fan-out happens on the room's
/// own broadcast task; this handle only sends it commands.
#[derive(Clone)]
pub struct Room {
    inner: Arc<RoomInner>,
}

struct RoomInner {
    record: RoomRecord,
    config: RoomConfig,
    commands: mpsc::Sender<Command>,
}

impl Room {
    /// Start the broadcast loop for `record`.
    pub(crate) fn spawn(record: RoomRecord, cache: Arc<dyn MessageCache>, config: RoomConfig) -> Self {
        let (commands, inbox) = mpsc::channel(COMMAND_BUFFER);

        let broadcaster = Broadcaster {
            room_id: record.id.clone(),
            config: config.clone(),
            cache,
            peers: HashMap::new(),
            last_timestamp: None,
        };
        tokio::spawn(broadcaster.run(inbox));

        Self {
            inner: Arc::new(RoomInner {
                record,
                config,
                commands,
            }),
        }
    }

    pub fn id(&self) -> &str {
        &self.inner.record.id
    }

    pub fn name(&self) -> &str {
        &self.inner.record.name
    }

    /// The stored credential hash.
    pub fn password_hash(&self) -> &str {
        &self.inner.record.password
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.inner.record.created_at
    }

    /// Whether the broadcast loop has stopped.
    pub fn is_closed(&self) -> bool {
        self.inner.commands.is_closed()
    }

    /// Attach an authenticated connection as a peer.
    ///
    /// `sink` receives outbound frames, `stream` yields inbound ones. The join
    /// is queued for the broadcast loop and both pumps are spawned; this does
    /// not wait for the loop to process the join. A second connection with the
    /// same `session_id` replaces the first.
    pub async fn add_peer<S, R, E>(
        &self,
        session_id: &str,
        handle: &str,
        sink: S,
        stream: R,
    ) -> Result<(), HubError>
    where
        S: Sink<Bytes> + Send + 'static,
        S::Error: Display + Send,
        R: Stream<Item = Result<Bytes, E>> + Send + 'static,
        E: Display + Send + 'static,
    {
        let conn_id = Uuid::new_v4();
        let cancel = CancellationToken::new();
        let (queue_tx, queue_rx) = mpsc::channel(self.inner.config.queue_capacity.max(1));

        self.inner
            .commands
            .send(Command::Join {
                peer_id: session_id.to_string(),
                slot: PeerSlot {
                    conn_id,
                    handle: handle.to_string(),
                    queue: queue_tx,
                    cancel: cancel.clone(),
                },
            })
            .await
            .map_err(|_| HubError::RoomClosed)?;

        tokio::spawn(peer::write_pump(
            sink,
            queue_rx,
            cancel.clone(),
            session_id.to_string(),
        ));
        tokio::spawn(peer::read_pump(
            stream,
            session_id.to_string(),
            conn_id,
            self.inner.commands.clone(),
            cancel,
        ));

        Ok(())
    }

    /// Snapshot of the connected peers, ordered by peer id.
    pub async fn peers(&self) -> Result<Vec<PeerInfo>, HubError> {
        let (reply, rx) = oneshot::channel();
        self.inner
            .commands
            .send(Command::Peers { reply })
            .await
            .map_err(|_| HubError::RoomClosed)?;
        rx.await.map_err(|_| HubError::RoomClosed)
    }

    /// Disconnect a peer, whichever connection it is on.
    pub async fn remove_peer(&self, peer_id: &str) -> Result<(), HubError> {
        self.inner
            .commands
            .send(Command::Kick {
                peer_id: peer_id.to_string(),
            })
            .await
            .map_err(|_| HubError::RoomClosed)
    }

    /// Tell every peer the room is gone and stop the broadcast loop.
    pub(crate) async fn dispose(&self) {
        let _ = self.inner.commands.send(Command::Dispose).await;
    }
}

/// State owned by a room's broadcast task. Nothing else touches `peers`.
struct Broadcaster {
    room_id: String,
    config: RoomConfig,
    cache: Arc<dyn MessageCache>,
    peers: HashMap<String, PeerSlot>,
    last_timestamp: Option<DateTime<Utc>>,
}

impl Broadcaster {
    async fn run(mut self, mut inbox: mpsc::Receiver<Command>) {
        debug!("Room {} broadcast loop started", self.room_id);

        while let Some(command) = inbox.recv().await {
            match command {
                Command::Join { peer_id, slot } => self.join(peer_id, slot),
                Command::Leave { peer_id, conn_id } => self.leave(&peer_id, Some(conn_id)),
                Command::Kick { peer_id } => self.leave(&peer_id, None),
                Command::Message {
                    peer_id,
                    conn_id,
                    message,
                } => self.message(&peer_id, conn_id, message),
                Command::PeerList { peer_id, conn_id } => self.peer_list(&peer_id, conn_id),
                Command::Peers { reply } => {
                    let _ = reply.send(self.peer_infos());
                }
                Command::Dispose => {
                    self.dispose();
                    break;
                }
            }
        }

        info!("Room {} closed", self.room_id);
    }

    fn join(&mut self, peer_id: String, slot: PeerSlot) {
        let replaced = match self.peers.remove(&peer_id) {
            Some(previous) => {
                debug!("{} reconnected to room {}, dropping old connection", peer_id, self.room_id);
                previous.cancel.cancel();
                true
            }
            None => false,
        };

        if !replaced && self.peers.len() >= self.config.max_peers {
            warn!("Room {} is full, refusing {} ({})", self.room_id, slot.handle, peer_id);
            if let Some(frame) = encode(&PeerEvent::RoomFull) {
                let _ = slot.queue.try_send(frame);
            }
            // Dropping the slot closes the queue once RoomFull has drained.
            return;
        }

        info!("{} ({}) joined room {}", slot.handle, peer_id, self.room_id);
        let event = PeerEvent::PeerJoin {
            peer_id: peer_id.clone(),
            handle: slot.handle.clone(),
        };
        self.peers.insert(peer_id.clone(), slot);

        if !replaced {
            self.fan_out(&event, Some(&peer_id));
        }
    }

    fn leave(&mut self, peer_id: &str, conn_id: Option<Uuid>) {
        let current = self
            .peers
            .get(peer_id)
            .is_some_and(|slot| conn_id.is_none_or(|id| id == slot.conn_id));
        if !current {
            return;
        }

        let Some(slot) = self.peers.remove(peer_id) else {
            return;
        };
        slot.cancel.cancel();
        info!("{} ({}) left room {}", slot.handle, peer_id, self.room_id);

        self.fan_out(
            &PeerEvent::PeerLeave {
                peer_id: peer_id.to_string(),
                handle: slot.handle,
            },
            None,
        );
    }

    fn message(&mut self, peer_id: &str, conn_id: Uuid, message: String) {
        let Some(slot) = self.peers.get(peer_id).filter(|slot| slot.conn_id == conn_id) else {
            return;
        };

        if message.trim().is_empty() {
            return;
        }
        if message.len() > self.config.max_message_length {
            warn!(
                "{} ({}) sent {} bytes to room {}, over the {} byte limit",
                slot.handle,
                peer_id,
                message.len(),
                self.room_id,
                self.config.max_message_length
            );
            return;
        }

        let payload = ChatPayload {
            message,
            peer_handle: slot.handle.clone(),
            peer_id: peer_id.to_string(),
        };
        let timestamp = self.next_timestamp();
        self.persist(timestamp, &payload);

        let event = PeerEvent::Message {
            timestamp,
            message: payload.message,
            peer_handle: payload.peer_handle,
            peer_id: payload.peer_id,
        };
        self.fan_out(&event, Some(peer_id));
    }

    fn peer_list(&mut self, peer_id: &str, conn_id: Uuid) {
        if !self.peers.get(peer_id).is_some_and(|slot| slot.conn_id == conn_id) {
            return;
        }
        let event = PeerEvent::PeerList {
            peers: self.peer_infos(),
        };
        if let Some(frame) = encode(&event) {
            self.deliver(peer_id, frame);
        }
    }

    fn dispose(&mut self) {
        info!("Disposing room {} ({} peers)", self.room_id, self.peers.len());
        let frame = encode(&PeerEvent::RoomDispose);
        for (_, slot) in self.peers.drain() {
            if let Some(frame) = &frame {
                let _ = slot.queue.try_send(frame.clone());
            }
            // Queue closes when the slot drops; the write pump drains and exits.
        }
    }

    /// Strictly increasing per room, so it can serve as the record key.
    fn next_timestamp(&mut self) -> DateTime<Utc> {
        let mut now = Utc::now();
        if let Some(last) = self.last_timestamp {
            if now <= last {
                now = last + TimeDelta::nanoseconds(1);
            }
        }
        self.last_timestamp = Some(now);
        now
    }

    /// Append to the message cache on the blocking pool. Failures are logged
    /// and never hold up delivery.
    fn persist(&self, timestamp: DateTime<Utc>, payload: &ChatPayload) {
        let payload = match serde_json::to_vec(payload) {
            Ok(bytes) => bytes,
            Err(e) => {
                error!("Failed to encode message for room {}: {}", self.room_id, e);
                return;
            }
        };

        let record = Message {
            timestamp,
            room_id: self.room_id.clone(),
            payload,
        };
        let cache = self.cache.clone();
        tokio::task::spawn_blocking(move || {
            if let Err(e) = cache.append(&record) {
                error!("Failed to cache message for room {}: {}", record.room_id, e);
            }
        });
    }

    /// Queue `event` for every peer except `except`. Peers whose queue is full
    /// are disconnected.
    fn fan_out(&mut self, event: &PeerEvent, except: Option<&str>) {
        let Some(frame) = encode(event) else {
            return;
        };

        let mut slow = Vec::new();
        for (id, slot) in &self.peers {
            if except == Some(id.as_str()) {
                continue;
            }
            match slot.queue.try_send(frame.clone()) {
                Ok(()) => {}
                Err(TrySendError::Full(_)) => slow.push(id.clone()),
                // Write pump already gone; its Leave is on the way.
                Err(TrySendError::Closed(_)) => {}
            }
        }

        for id in slow {
            self.drop_slow_consumer(&id);
        }
    }

    fn deliver(&mut self, peer_id: &str, frame: Bytes) {
        let Some(slot) = self.peers.get(peer_id) else {
            return;
        };
        if let Err(TrySendError::Full(_)) = slot.queue.try_send(frame) {
            self.drop_slow_consumer(peer_id);
        }
    }

    fn drop_slow_consumer(&mut self, peer_id: &str) {
        if let Some(slot) = self.peers.remove(peer_id) {
            warn!(
                "{} ({}) in room {} is not keeping up, disconnecting",
                slot.handle, peer_id, self.room_id
            );
            slot.cancel.cancel();
        }
    }

    fn peer_infos(&self) -> Vec<PeerInfo> {
        let mut peers: Vec<PeerInfo> = self
            .peers
            .iter()
            .map(|(id, slot)| PeerInfo {
                id: id.clone(),
                handle: slot.handle.clone(),
            })
            .collect();
        peers.sort_by(|a, b| a.id.cmp(&b.id));
        peers
    }
}

fn encode(event: &PeerEvent) -> Option<Bytes> {
    match serde_json::to_vec(event) {
        Ok(bytes) => Some(Bytes::from(bytes)),
        Err(e) => {
            error!("Failed to encode peer event: {}", e);
            None
        }
    }
}
