use std::future;

use axum::{
    Extension,
    extract::ws::{Message, WebSocket, WebSocketUpgrade},
    response::IntoResponse,
};
use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use tracing::{error, info};

use murmur_hub::Room;
use murmur_types::models::Session;

pub async fn ws_upgrade(
    ws: WebSocketUpgrade,
    Extension(room): Extension<Room>,
    Extension(session): Extension<Session>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| attach(socket, room, session))
}

/// Split the socket into frame sink and stream and hand both to the room.
async fn attach(socket: WebSocket, room: Room, session: Session) {
    let (sink, stream) = socket.split();

    let sink = sink.with(|frame: Bytes| {
        let text = String::from_utf8_lossy(&frame).into_owned();
        future::ready(Ok::<_, axum::Error>(Message::Text(text.into())))
    });

    // Control frames are handled by axum; a close frame ends the stream.
    let stream = stream
        .take_while(|msg| future::ready(!matches!(msg, Ok(Message::Close(_)))))
        .filter_map(|msg| {
            future::ready(match msg {
                Ok(Message::Text(text)) => Some(Ok(Bytes::copy_from_slice(text.as_str().as_bytes()))),
                Ok(Message::Binary(data)) => Some(Ok(data)),
                Ok(_) => None,
                Err(e) => Some(Err(e)),
            })
        });

    info!("WebSocket connected: {} in room {}", session.handle, room.id());
    if let Err(e) = room.add_peer(&session.id, &session.handle, sink, stream).await {
        error!("Failed to attach {} to room {}: {}", session.handle, room.id(), e);
    }
}
