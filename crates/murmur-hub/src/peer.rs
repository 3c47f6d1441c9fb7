use std::fmt::Display;
use std::pin::pin;
use std::time::Duration;

use bytes::Bytes;
use futures_util::{Sink, SinkExt, Stream, StreamExt};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

use murmur_types::events::PeerCommand;

use crate::room::Command;

/// Upper bound on flushing/closing a transport whose peer is gone.
const CLOSE_TIMEOUT: Duration = Duration::from_secs(5);

/// What the broadcast loop holds for one attached connection.
pub(crate) struct PeerSlot {
    pub conn_id: Uuid,
    pub handle: String,
    pub queue: mpsc::Sender<Bytes>,
    pub cancel: CancellationToken,
}

/// Drain the peer's queue into its transport. This is the only writer of
/// `sink`, so frames are never interleaved.
///
/// Ends when the queue closes, a write fails, or the peer is cancelled; a write
/// stuck on a stalled transport is abandoned on cancellation.
pub(crate) async fn write_pump<S>(
    sink: S,
    mut queue: mpsc::Receiver<Bytes>,
    cancel: CancellationToken,
    peer_id: String,
) where
    S: Sink<Bytes> + Send,
    S::Error: Display + Send,
{
    let mut sink = pin!(sink);

    loop {
        let frame = tokio::select! {
            _ = cancel.cancelled() => break,
            frame = queue.recv() => match frame {
                Some(frame) => frame,
                None => break,
            },
        };

        tokio::select! {
            _ = cancel.cancelled() => break,
            result = sink.send(frame) => {
                if let Err(e) = result {
                    debug!("{} write failed: {}", peer_id, e);
                    break;
                }
            }
        }
    }

    // Either way the connection is done; make sure the read side stops too.
    cancel.cancel();
    if tokio::time::timeout(CLOSE_TIMEOUT, sink.close()).await.is_err() {
        debug!("{} transport did not close in time", peer_id);
    }
}

/// Parse inbound frames and forward them to the room's broadcast loop.
///
/// On exit (transport closed, read error, cancellation) the peer is
/// deregistered with a `Leave` carrying this connection's id.
pub(crate) async fn read_pump<R, E>(
    stream: R,
    peer_id: String,
    conn_id: Uuid,
    commands: mpsc::Sender<Command>,
    cancel: CancellationToken,
) where
    R: Stream<Item = Result<Bytes, E>> + Send,
    E: Display + Send,
{
    let mut stream = pin!(stream);

    loop {
        let frame = tokio::select! {
            _ = cancel.cancelled() => break,
            next = stream.next() => match next {
                Some(Ok(frame)) => frame,
                Some(Err(e)) => {
                    debug!("{} read failed: {}", peer_id, e);
                    break;
                }
                None => break,
            },
        };

        let command = match serde_json::from_slice::<PeerCommand>(&frame) {
            Ok(PeerCommand::Message { message }) => Command::Message {
                peer_id: peer_id.clone(),
                conn_id,
                message,
            },
            Ok(PeerCommand::PeerList) => Command::PeerList {
                peer_id: peer_id.clone(),
                conn_id,
            },
            Err(e) => {
                warn!(
                    "{} bad command: {} -- raw: {}",
                    peer_id,
                    e,
                    String::from_utf8_lossy(&frame[..frame.len().min(200)])
                );
                continue;
            }
        };

        tokio::select! {
            _ = cancel.cancelled() => break,
            sent = commands.send(command) => {
                if sent.is_err() {
                    // Room loop is gone
                    break;
                }
            }
        }
    }

    cancel.cancel();
    let _ = commands.send(Command::Leave { peer_id, conn_id }).await;
}
