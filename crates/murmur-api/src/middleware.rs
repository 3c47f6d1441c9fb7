use axum::{
    extract::{Path, Query, Request, State},
    http::HeaderMap,
    middleware::Next,
    response::Response,
};
use axum_extra::headers::{Cookie, HeaderMapExt};
use serde::Deserialize;
use tracing::debug;

use murmur_store::{StoreError, blocking};

use crate::{ApiError, AppState};

/// Query parameter and header that may carry the session id.
pub const SESSION_PARAM: &str = "session_id";

#[derive(Debug, Default, Deserialize)]
struct SessionQuery {
    session_id: Option<String>,
}

/// Resolve the room and the caller's session for room-scoped routes.
///
/// Activates the room (extending its TTL) and inserts the live
/// [`murmur_hub::Room`] and the [`murmur_types::models::Session`] into the
/// request extensions.
pub async fn require_session(
    State(state): State<AppState>,
    Path(room_id): Path<String>,
    mut req: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let room = state.hub.activate(&room_id).await?;

    let query = Query::<SessionQuery>::try_from_uri(req.uri())
        .map(|Query(q)| q)
        .unwrap_or_default();
    let session_id = session_id(req.headers(), &state.session_cookie, query)
        .ok_or_else(|| ApiError::Forbidden("invalid session".into()))?;

    let store = state.hub.store();
    let rid = room_id.clone();
    let session = match blocking(move || store.get_session(&session_id, &rid)).await {
        Ok(session) => session,
        Err(StoreError::NotFound) => {
            debug!("Rejected unknown session for room {}", room_id);
            return Err(ApiError::Forbidden("invalid session".into()));
        }
        Err(e) => return Err(e.into()),
    };

    req.extensions_mut().insert(room);
    req.extensions_mut().insert(session);
    Ok(next.run(req).await)
}

/// Cookie first, then the query parameter, then the header.
fn session_id(headers: &HeaderMap, cookie_name: &str, query: SessionQuery) -> Option<String> {
    let from_cookie = headers
        .typed_get::<Cookie>()
        .and_then(|c| c.get(cookie_name).map(str::to_string));
    let from_header = || {
        headers
            .get(SESSION_PARAM)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
    };

    from_cookie
        .filter(|id| !id.is_empty())
        .or(query.session_id.filter(|id| !id.is_empty()))
        .or_else(|| from_header().filter(|id| !id.is_empty()))
}
