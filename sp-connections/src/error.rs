use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("store error: {0}")]
    Store(#[from] sp_store::StoreError),

    #[error("transition error: {0}")]
    Transition(#[from] sp_sessions::TransitionError),

    #[error("connection {0} not found")]
    NotFound(String),
}

impl From<ConnectionError> for sp_common::AppError {
    fn from(e: ConnectionError) -> Self {
        match e {
            ConnectionError::Store(e) => sp_common::AppError::Store(e.to_string()),
            ConnectionError::Transition(e) => e.into(),
            ConnectionError::NotFound(id) => sp_common::AppError::NotFound(id),
        }
    }
}
