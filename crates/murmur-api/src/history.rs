use axum::{
    Extension,
    extract::{Query, State, rejection::QueryRejection},
    response::IntoResponse,
};
use base64::Engine;
use base64::engine::general_purpose::STANDARD as B64;
use chrono::{DateTime, Utc};
use serde::Serialize;

use murmur_history::HistoryRequest;
use murmur_hub::Room;
use murmur_types::models::Message;

use crate::error::ok;
use crate::{ApiError, AppState};

#[derive(Debug, Serialize)]
pub struct HistoryEntry {
    pub timestamp: DateTime<Utc>,
    pub room_id: String,
    /// The stored payload as JSON, or a base64 string when it is not JSON.
    pub data: serde_json::Value,
}

impl From<Message> for HistoryEntry {
    fn from(message: Message) -> Self {
        let data = serde_json::from_slice(&message.payload)
            .unwrap_or_else(|_| serde_json::Value::String(B64.encode(&message.payload)));
        Self {
            timestamp: message.timestamp,
            room_id: message.room_id,
            data,
        }
    }
}

pub async fn get_history(
    State(state): State<AppState>,
    Extension(room): Extension<Room>,
    query: Result<Query<HistoryRequest>, QueryRejection>,
) -> Result<impl IntoResponse, ApiError> {
    let Query(req) = query.map_err(|e| ApiError::BadRequest(e.body_text()))?;

    let messages =
        murmur_history::fetch(state.hub.message_cache(), room.id(), &req, Utc::now()).await?;
    let entries: Vec<HistoryEntry> = messages.into_iter().map(HistoryEntry::from).collect();
    Ok(ok(entries))
}
