use std::collections::HashMap;

use argon2::{
    Argon2, PasswordHash, PasswordHasher, PasswordVerifier,
    password_hash::{SaltString, rand_core::OsRng},
};
use axum::{
    Extension, Json,
    extract::{Path, State},
    http::{HeaderMap, HeaderValue, header},
    response::IntoResponse,
};
use serde::Deserialize;
use tracing::info;

use murmur_hub::{HubError, Room, generate_token};
use murmur_store::blocking;
use murmur_types::models::Session;

use crate::error::ok;
use crate::{ApiError, AppState};

/// Length of generated session ids.
const SESSION_ID_LENGTH: usize = 32;

#[derive(Debug, Deserialize)]
pub struct LoginRequest {
    pub handle: String,
    pub password: String,
}

pub fn validate_password(password: &str) -> Result<(), ApiError> {
    if password.len() < 6 || password.len() > 100 {
        return Err(ApiError::BadRequest("invalid password (6 - 100 chars)".into()));
    }
    Ok(())
}

/// Argon2id PHC string for `password`.
pub fn hash_password(password: &str) -> Result<String, ApiError> {
    let salt = SaltString::generate(&mut OsRng);
    Argon2::default()
        .hash_password(password.as_bytes(), &salt)
        .map(|hash| hash.to_string())
        .map_err(|e| ApiError::Internal(format!("hashing password: {e}")))
}

pub fn verify_password(password: &str, hash: &str) -> Result<(), ApiError> {
    let parsed = PasswordHash::new(hash)
        .map_err(|e| ApiError::Internal(format!("stored password hash: {e}")))?;
    Argon2::default()
        .verify_password(password.as_bytes(), &parsed)
        .map_err(|_| ApiError::Forbidden("incorrect password".into()))
}

/// Authenticate into a room, creating it under this id if it does not exist.
pub async fn login(
    State(state): State<AppState>,
    Path(room_id): Path<String>,
    Json(req): Json<LoginRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let handle = req.handle.trim();
    if handle.is_empty() || handle.chars().count() > 50 {
        return Err(ApiError::BadRequest("invalid handle (1 - 50 chars)".into()));
    }

    let room = match state.hub.activate(&room_id).await {
        Ok(room) => room,
        Err(HubError::NotFound) => create_on_login(&state, &room_id, &req.password).await?,
        Err(e) => return Err(e.into()),
    };

    verify_password(&req.password, room.password_hash())?;

    let session_id = generate_token(SESSION_ID_LENGTH);
    let store = state.hub.store();
    let ttl = state.hub.room_age();
    let (sid, h, rid) = (session_id.clone(), handle.to_string(), room.id().to_string());
    blocking(move || store.add_session(&sid, &h, &rid, ttl)).await?;

    info!("{} logged into room {}", handle, room.id());

    let mut headers = HeaderMap::new();
    headers.insert(
        header::SET_COOKIE,
        cookie(&format!("{}={}; Path=/", state.session_cookie, session_id))?,
    );
    let body = HashMap::from([(state.session_cookie.clone(), session_id)]);
    Ok((headers, ok(body)))
}

async fn create_on_login(state: &AppState, room_id: &str, password: &str) -> Result<Room, ApiError> {
    validate_password(password)?;
    let hash = hash_password(password)?;
    match state.hub.create_room(Some(room_id), room_id, &hash).await {
        Ok(room) => Ok(room),
        // Someone else created it in the meantime.
        Err(HubError::AlreadyExists) => Ok(state.hub.activate(room_id).await?),
        Err(e) => Err(e.into()),
    }
}

pub async fn logout(
    State(state): State<AppState>,
    Extension(session): Extension<Session>,
) -> Result<impl IntoResponse, ApiError> {
    let store = state.hub.store();
    let (sid, rid) = (session.id.clone(), session.room_id.clone());
    blocking(move || store.remove_session(&sid, &rid)).await?;

    info!("{} logged out of room {}", session.handle, session.room_id);

    let mut headers = HeaderMap::new();
    headers.insert(
        header::SET_COOKIE,
        cookie(&format!("{}=; Max-Age=0; Path=/", state.session_cookie))?,
    );
    Ok((headers, ok(true)))
}

fn cookie(value: &str) -> Result<HeaderValue, ApiError> {
    HeaderValue::from_str(value).map_err(|e| ApiError::Internal(format!("session cookie: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hash_round_trip() {
        let hash = hash_password("hunter22").unwrap();
        assert!(hash.starts_with("$argon2id$"));
        assert!(verify_password("hunter22", &hash).is_ok());
        assert!(matches!(
            verify_password("hunter23", &hash),
            Err(ApiError::Forbidden(_))
        ));
    }

    #[test]
    fn password_length_bounds() {
        assert!(validate_password("12345").is_err());
        assert!(validate_password("123456").is_ok());
        assert!(validate_password(&"x".repeat(100)).is_ok());
        assert!(validate_password(&"x".repeat(101)).is_err());
    }
}
