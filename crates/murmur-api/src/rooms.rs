use axum::{
    Extension, Json,
    extract::State,
    response::IntoResponse,
};
use serde::{Deserialize, Serialize};

use murmur_hub::Room;

use crate::auth::{hash_password, validate_password};
use crate::error::ok;
use crate::{ApiError, AppState};

#[derive(Debug, Deserialize)]
pub struct CreateRoomRequest {
    #[serde(default)]
    pub name: String,
    pub password: String,
}

#[derive(Debug, Serialize)]
pub struct CreateRoomResponse {
    pub id: String,
}

pub async fn create_room(
    State(state): State<AppState>,
    Json(req): Json<CreateRoomRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let name = req.name.trim();
    if !name.is_empty() && (name.chars().count() < 3 || name.chars().count() > 100) {
        return Err(ApiError::BadRequest("invalid room name (3 - 100 chars)".into()));
    }
    validate_password(&req.password)?;

    let hash = hash_password(&req.password)?;
    let room = state.hub.create_room(None, name, &hash).await?;

    Ok(ok(CreateRoomResponse {
        id: room.id().to_string(),
    }))
}

/// Delete the room, its sessions and disconnect everyone in it.
pub async fn remove_room(
    State(state): State<AppState>,
    Extension(room): Extension<Room>,
) -> Result<impl IntoResponse, ApiError> {
    state.hub.remove(room.id()).await?;
    Ok(ok(true))
}
