use murmur_store::StoreError;

#[derive(Debug, thiserror::Error)]
pub enum HubError {
    /// The room is absent from the store or its TTL lapsed.
    #[error("room not found or expired")]
    NotFound,

    #[error("room already exists")]
    AlreadyExists,

    /// The room's broadcast loop has stopped.
    #[error("room is closed")]
    RoomClosed,

    #[error(transparent)]
    Store(StoreError),
}

impl From<StoreError> for HubError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound => Self::NotFound,
            StoreError::AlreadyExists => Self::AlreadyExists,
            other => Self::Store(other),
        }
    }
}
