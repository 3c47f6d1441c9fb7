//! HTTP and WebSocket surface of the relay.

pub mod auth;
pub mod error;
pub mod history;
pub mod middleware;
pub mod rooms;
pub mod ws;

use std::sync::Arc;

use axum::{
    Router,
    routing::{delete, get, post},
};

use murmur_hub::Hub;

pub use error::ApiError;

pub type AppState = Arc<AppStateInner>;

pub struct AppStateInner {
    pub hub: Hub,
    /// Name of the cookie carrying the session id.
    pub session_cookie: String,
}

/// All API routes. Room-scoped routes other than login go through
/// [`middleware::require_session`].
pub fn router(state: AppState) -> Router {
    let authed = axum::middleware::from_fn_with_state(state.clone(), middleware::require_session);

    Router::new()
        .route("/api/rooms", post(rooms::create_room))
        .route(
            "/api/rooms/{room_id}",
            delete(rooms::remove_room).route_layer(authed.clone()),
        )
        .route(
            "/api/rooms/{room_id}/login",
            post(auth::login).merge(delete(auth::logout).route_layer(authed.clone())),
        )
        .route(
            "/api/rooms/{room_id}/history",
            get(history::get_history).route_layer(authed.clone()),
        )
        .route(
            "/api/rooms/{room_id}/ws",
            get(ws::ws_upgrade).route_layer(authed),
        )
        .with_state(state)
}
