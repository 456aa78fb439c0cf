use thiserror::Error;

#[derive(Debug, Error)]
pub enum ReconcileError {
    #[error("store error: {0}")]
    Store(#[from] sp_store::StoreError),

    #[error("transition error: {0}")]
    Transition(#[from] sp_sessions::TransitionError),

    #[error("dispatch error: {0}")]
    Dispatch(#[from] sp_dispatcher::DispatchError),

    #[error("connection error: {0}")]
    Connection(#[from] sp_connections::ConnectionError),
}

impl From<ReconcileError> for sp_common::AppError {
    fn from(e: ReconcileError) -> Self {
        match e {
            ReconcileError::Store(e) => sp_common::AppError::Store(e.to_string()),
            ReconcileError::Transition(e) => e.into(),
            ReconcileError::Dispatch(e) => e.into(),
            ReconcileError::Connection(e) => e.into(),
        }
    }
}
