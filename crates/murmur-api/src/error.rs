use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::Serialize;
use tracing::error;

use murmur_history::HistoryError;
use murmur_hub::HubError;
use murmur_store::StoreError;

/// Body of every JSON response.
#[derive(Debug, Serialize)]
pub struct Envelope<T> {
    pub error: Option<String>,
    pub data: T,
}

/// Wrap `data` in a successful envelope.
pub fn ok<T: Serialize>(data: T) -> Json<Envelope<T>> {
    Json(Envelope { error: None, data })
}

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("{0}")]
    BadRequest(String),

    #[error("{0}")]
    Forbidden(String),

    #[error("{0}")]
    NotFound(String),

    #[error("{0}")]
    Conflict(String),

    /// The detail is logged, never sent to the client.
    #[error("internal server error")]
    Internal(String),
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::Forbidden(_) => StatusCode::FORBIDDEN,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::Conflict(_) => StatusCode::CONFLICT,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub(crate) fn room_not_found() -> Self {
        ApiError::NotFound("room is invalid or has expired".into())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        if let ApiError::Internal(detail) = &self {
            error!("Request failed: {}", detail);
        }

        let body = Envelope {
            error: Some(self.to_string()),
            data: serde_json::Value::Null,
        };
        (self.status(), Json(body)).into_response()
    }
}

impl From<HubError> for ApiError {
    fn from(e: HubError) -> Self {
        match e {
            HubError::NotFound | HubError::RoomClosed => ApiError::room_not_found(),
            HubError::AlreadyExists => ApiError::Conflict("room already exists".into()),
            HubError::Store(e) => e.into(),
        }
    }
}

impl From<StoreError> for ApiError {
    fn from(e: StoreError) -> Self {
        ApiError::Internal(e.to_string())
    }
}

impl From<HistoryError> for ApiError {
    fn from(e: HistoryError) -> Self {
        match e {
            HistoryError::Store(e) => e.into(),
            e => ApiError::BadRequest(e.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hub_errors_map_to_statuses() {
        assert_eq!(ApiError::from(HubError::NotFound).status(), StatusCode::NOT_FOUND);
        assert_eq!(ApiError::from(HubError::AlreadyExists).status(), StatusCode::CONFLICT);
        assert_eq!(
            ApiError::from(HubError::Store(StoreError::Poisoned)).status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn internal_detail_is_not_exposed() {
        let e = ApiError::Internal("disk on fire".into());
        assert_eq!(e.to_string(), "internal server error");
    }

    #[test]
    fn history_validation_is_bad_request() {
        assert_eq!(
            ApiError::from(HistoryError::InvalidRange).status(),
            StatusCode::BAD_REQUEST
        );
    }
}
