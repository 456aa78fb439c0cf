use thiserror::Error;

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("store error: {0}")]
    Store(#[from] sp_store::StoreError),

    #[error("command {0} not found")]
    CommandNotFound(String),

    #[error("stale write racing another worker for command {0}, treated as a no-op")]
    StaleWrite(String),
}

impl From<DispatchError> for sp_common::AppError {
    fn from(e: DispatchError) -> Self {
        match e {
            DispatchError::Store(e) => sp_common::AppError::Store(e.to_string()),
            other => sp_common::AppError::Other(anyhow::anyhow!(other.to_string())),
        }
    }
}
