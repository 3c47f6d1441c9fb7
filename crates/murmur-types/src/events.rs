use serde::{Deserialize, Serialize};

/// A connected peer as seen by the rest of the room.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerInfo {
    pub id: String,
    pub handle: String,
}

/// Events sent over the WebSocket to peers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum PeerEvent {
    /// A chat message from another peer
    Message {
        timestamp: chrono::DateTime<chrono::Utc>,
        message: String,
        peer_handle: String,
        peer_id: String,
    },

    /// A peer joined the room
    PeerJoin { peer_id: String, handle: String },

    /// A peer left the room
    PeerLeave { peer_id: String, handle: String },

    /// Reply to a `PeerList` command
    PeerList { peers: Vec<PeerInfo> },

    /// The room is at capacity; the connection is closed after this frame
    RoomFull,

    /// The room was removed; the connection is closed after this frame
    RoomDispose,
}

/// Commands sent FROM peers TO the room over WebSocket.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum PeerCommand {
    /// Broadcast a chat message to the other peers
    Message { message: String },

    /// Ask for the list of connected peers
    PeerList,
}
