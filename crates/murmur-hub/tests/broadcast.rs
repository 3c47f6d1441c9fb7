//! Fan-out behavior of a room's broadcast loop, driven through in-memory
//! transports.
use std::collections::HashMap;
use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures_util::{Sink, Stream};
use serde_json::json;
use tokio::sync::mpsc;
use tokio::time::timeout;

use murmur_hub::{Hub, HubConfig, Room, RoomConfig};
use murmur_store::{MemoryStore, MessageCache};
use murmur_types::events::PeerEvent;
use murmur_types::models::ChatPayload;

const WAIT: Duration = Duration::from_secs(2);

/// The test's end of a peer connection.
struct Client {
    id: String,
    to_room: Option<mpsc::UnboundedSender<Bytes>>,
    from_room: mpsc::UnboundedReceiver<Bytes>,
}

impl Client {
    fn say(&self, text: &str) {
        self.command(json!({"type": "Message", "data": {"message": text}}));
    }

    fn command(&self, value: serde_json::Value) {
        let frame = Bytes::from(serde_json::to_vec(&value).unwrap());
        self.to_room.as_ref().unwrap().send(frame).unwrap();
    }

    /// Hang up: the room sees the inbound stream end.
    fn disconnect(&mut self) {
        self.to_room = None;
    }

    async fn next_event(&mut self) -> PeerEvent {
        let frame = timeout(WAIT, self.from_room.recv())
            .await
            .expect("timed out waiting for a frame")
            .expect("connection closed");
        serde_json::from_slice(&frame).unwrap()
    }

    /// Next chat message, skipping presence events.
    async fn next_message(&mut self) -> (String, String) {
        loop {
            if let PeerEvent::Message {
                message, peer_id, ..
            } = self.next_event().await
            {
                return (peer_id, message);
            }
        }
    }

    async fn closed(&mut self) -> bool {
        loop {
            match timeout(WAIT, self.from_room.recv()).await {
                Ok(Some(_)) => continue,
                Ok(None) => return true,
                Err(_) => return false,
            }
        }
    }
}

fn transport() -> (
    impl Sink<Bytes, Error = &'static str> + Send + 'static,
    impl Stream<Item = Result<Bytes, Infallible>> + Send + 'static,
    mpsc::UnboundedSender<Bytes>,
    mpsc::UnboundedReceiver<Bytes>,
) {
    let (out_tx, out_rx) = mpsc::unbounded_channel::<Bytes>();
    let (in_tx, in_rx) = mpsc::unbounded_channel::<Bytes>();

    let sink = futures_util::sink::unfold(out_tx, |tx, frame: Bytes| async move {
        tx.send(frame).map_err(|_| "client gone")?;
        Ok::<_, &'static str>(tx)
    });
    let stream = futures_util::stream::unfold(in_rx, |mut rx| async move {
        rx.recv().await.map(|frame| (Ok::<_, Infallible>(frame), rx))
    });

    (sink, stream, in_tx, out_rx)
}

async fn connect(room: &Room, id: &str) -> Client {
    let (sink, stream, to_room, from_room) = transport();
    room.add_peer(id, &format!("{id}-handle"), sink, stream)
        .await
        .unwrap();
    Client {
        id: id.to_string(),
        to_room: Some(to_room),
        from_room,
    }
}

/// A peer whose transport accepts nothing: the first write never completes.
async fn connect_stalled(room: &Room, id: &str) -> mpsc::UnboundedSender<Bytes> {
    let sink = futures_util::sink::unfold((), |(), _frame: Bytes| async move {
        std::future::pending::<()>().await;
        Ok::<_, &'static str>(())
    });
    let (_, stream, to_room, _) = transport();
    room.add_peer(id, "stalled", sink, stream).await.unwrap();
    to_room
}

fn hub(room: RoomConfig) -> (Hub, Arc<MemoryStore>) {
    let store = Arc::new(MemoryStore::new());
    let hub = Hub::new(
        store.clone(),
        store.clone(),
        HubConfig {
            room,
            ..HubConfig::default()
        },
    );
    (hub, store)
}

async fn peer_ids(room: &Room) -> Vec<String> {
    room.peers()
        .await
        .unwrap()
        .into_iter()
        .map(|p| p.id)
        .collect()
}

#[tokio::test]
async fn every_peer_sees_the_same_order() {
    let (hub, _) = hub(RoomConfig {
        queue_capacity: 256,
        ..RoomConfig::default()
    });
    let room = hub.create_room(None, "order", "hash").await.unwrap();

    let mut clients = Vec::new();
    for i in 0..4 {
        clients.push(connect(&room, &format!("p{i}")).await);
    }
    assert_eq!(peer_ids(&room).await.len(), 4);

    const PER_PEER: usize = 25;
    for n in 0..PER_PEER {
        for client in &clients {
            client.say(&format!("{}-{n}", client.id));
        }
    }

    let mut seen: HashMap<String, Vec<(String, String)>> = HashMap::new();
    for client in &mut clients {
        let mut got = Vec::new();
        for _ in 0..PER_PEER * 3 {
            got.push(client.next_message().await);
        }
        // No echo of our own messages.
        assert!(got.iter().all(|(from, _)| *from != client.id));
        seen.insert(client.id.clone(), got);
    }

    // Any two peers agree on the order of the messages they both received.
    for a in seen.keys() {
        for b in seen.keys() {
            if a == b {
                continue;
            }
            let view = |of: &str, without: &str| -> Vec<(String, String)> {
                seen[of]
                    .iter()
                    .filter(|(from, _)| from != without)
                    .cloned()
                    .collect()
            };
            assert_eq!(view(a, b), view(b, a), "{a} and {b} disagree");
        }
    }

    // Per-sender FIFO.
    for got in seen.values() {
        let mut last: HashMap<&str, usize> = HashMap::new();
        for (from, text) in got {
            let n: usize = text.rsplit('-').next().unwrap().parse().unwrap();
            if let Some(prev) = last.insert(from.as_str(), n) {
                assert!(n > prev);
            }
        }
    }
}

#[tokio::test]
async fn sender_gets_no_echo() {
    let (hub, _) = hub(RoomConfig::default());
    let room = hub.create_room(None, "echo", "hash").await.unwrap();
    let mut ana = connect(&room, "ana").await;
    let mut bo = connect(&room, "bo").await;

    ana.say("hello");
    assert_eq!(bo.next_message().await, ("ana".to_string(), "hello".to_string()));

    // The loop answers in order, so an echo would arrive before this reply.
    ana.command(json!({"type": "PeerList"}));
    assert!(matches!(ana.next_event().await, PeerEvent::PeerJoin { .. }));
    match ana.next_event().await {
        PeerEvent::PeerList { peers } => {
            let ids: Vec<_> = peers.into_iter().map(|p| p.id).collect();
            assert_eq!(ids, ["ana", "bo"]);
        }
        other => panic!("expected PeerList, got {other:?}"),
    }
}

#[tokio::test]
async fn slow_consumer_is_dropped_without_stalling_others() {
    let (hub, _) = hub(RoomConfig {
        queue_capacity: 4,
        ..RoomConfig::default()
    });
    let room = hub.create_room(None, "slow", "hash").await.unwrap();

    let ana = connect(&room, "ana").await;
    let mut bo = connect(&room, "bo").await;
    let _stalled = connect_stalled(&room, "cy").await;
    assert_eq!(peer_ids(&room).await, ["ana", "bo", "cy"]);

    for n in 0..20 {
        ana.say(&format!("m{n}"));
        assert_eq!(bo.next_message().await.1, format!("m{n}"));
    }

    assert_eq!(peer_ids(&room).await, ["ana", "bo"]);

    // The drop is silent to everyone else.
    while let Ok(frame) = bo.from_room.try_recv() {
        let event: PeerEvent = serde_json::from_slice(&frame).unwrap();
        assert!(!matches!(event, PeerEvent::PeerLeave { .. }), "{event:?}");
    }
}

#[tokio::test]
async fn departure_is_announced() {
    let (hub, _) = hub(RoomConfig::default());
    let room = hub.create_room(None, "leave", "hash").await.unwrap();
    let mut ana = connect(&room, "ana").await;
    let mut bo = connect(&room, "bo").await;

    assert_eq!(
        ana.next_event().await,
        PeerEvent::PeerJoin {
            peer_id: "bo".into(),
            handle: "bo-handle".into()
        }
    );

    bo.disconnect();
    assert_eq!(
        ana.next_event().await,
        PeerEvent::PeerLeave {
            peer_id: "bo".into(),
            handle: "bo-handle".into()
        }
    );
    assert!(bo.closed().await);
    assert_eq!(peer_ids(&room).await, ["ana"]);

    // Remaining peers keep working.
    let mut cy = connect(&room, "cy").await;
    ana.say("still here");
    assert_eq!(cy.next_message().await.1, "still here");
}

#[tokio::test]
async fn explicit_removal_disconnects_peer() {
    let (hub, _) = hub(RoomConfig::default());
    let room = hub.create_room(None, "kick", "hash").await.unwrap();
    let _ana = connect(&room, "ana").await;
    let mut bo = connect(&room, "bo").await;

    room.remove_peer("bo").await.unwrap();
    assert!(bo.closed().await);
    assert_eq!(peer_ids(&room).await, ["ana"]);
}

#[tokio::test]
async fn full_room_refuses_join() {
    let (hub, _) = hub(RoomConfig {
        max_peers: 1,
        ..RoomConfig::default()
    });
    let room = hub.create_room(None, "tiny", "hash").await.unwrap();
    let _ana = connect(&room, "ana").await;
    let mut bo = connect(&room, "bo").await;

    assert_eq!(bo.next_event().await, PeerEvent::RoomFull);
    assert!(bo.closed().await);
    assert_eq!(peer_ids(&room).await, ["ana"]);
}

#[tokio::test]
async fn reconnect_replaces_previous_connection() {
    let (hub, _) = hub(RoomConfig::default());
    let room = hub.create_room(None, "again", "hash").await.unwrap();
    let mut ana = connect(&room, "ana").await;
    let mut first = connect(&room, "bo").await;
    let mut second = connect(&room, "bo").await;

    assert!(first.closed().await);
    assert_eq!(peer_ids(&room).await, ["ana", "bo"]);

    ana.say("which one?");
    assert_eq!(second.next_message().await.1, "which one?");

    // ana saw bo join once, and no departure for the replaced connection.
    assert!(matches!(ana.next_event().await, PeerEvent::PeerJoin { .. }));
    assert!(ana.from_room.try_recv().is_err());
}

#[tokio::test]
async fn oversized_and_blank_messages_are_dropped() {
    let (hub, _) = hub(RoomConfig {
        max_message_length: 8,
        ..RoomConfig::default()
    });
    let room = hub.create_room(None, "limits", "hash").await.unwrap();
    let ana = connect(&room, "ana").await;
    let mut bo = connect(&room, "bo").await;

    ana.say("this is far too long");
    ana.say("   ");
    ana.command(json!({"type": "Nonsense"}));
    ana.say("short");
    assert_eq!(bo.next_message().await.1, "short");
}

#[tokio::test]
async fn messages_are_persisted_in_order() {
    let (hub, store) = hub(RoomConfig::default());
    let room = hub.create_room(None, "log", "hash").await.unwrap();
    let ana = connect(&room, "ana").await;
    let mut bo = connect(&room, "bo").await;

    for n in 0..5 {
        ana.say(&format!("m{n}"));
    }
    for _ in 0..5 {
        bo.next_message().await;
    }

    // Appends are fire-and-forget; give the blocking pool a moment.
    let mut stored = Vec::new();
    for _ in 0..100 {
        stored = store.query(room.id(), 0, &[]).unwrap();
        if stored.len() == 5 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    let texts: Vec<String> = stored
        .iter()
        .map(|m| {
            let payload: ChatPayload = serde_json::from_slice(&m.payload).unwrap();
            assert_eq!(payload.peer_id, "ana");
            assert_eq!(payload.peer_handle, "ana-handle");
            payload.message
        })
        .collect();
    assert_eq!(texts, ["m0", "m1", "m2", "m3", "m4"]);
    assert!(stored.windows(2).all(|w| w[0].timestamp < w[1].timestamp));
}

#[tokio::test]
async fn removing_room_disposes_peers() {
    let (hub, _) = hub(RoomConfig::default());
    let room = hub.create_room(None, "bye", "hash").await.unwrap();
    let mut ana = connect(&room, "ana").await;

    hub.remove(room.id()).await.unwrap();
    assert_eq!(ana.next_event().await, PeerEvent::RoomDispose);
    assert!(ana.closed().await);
    assert!(room.peers().await.is_err());
}
