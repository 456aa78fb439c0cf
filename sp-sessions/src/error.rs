use thiserror::Error;

#[derive(Debug, Error)]
pub enum TransitionError {
    #[error("no transition defined for ({current:?}, {event:?})")]
    InvalidTransition {
        current: sp_store::model::ObservedState,
        event: String,
    },

    /// §4.3 Rules: a non-terminal command of a conflicting action already
    /// exists for this session.
    #[error("conflicting non-terminal command already exists for session {0}")]
    CommandInFlight(String),

    #[error("no online agent available for platform {0:?}")]
    NoEligibleAgent(sp_store::model::Platform),

    #[error("session {0} not found")]
    NotFound(String),

    #[error("store error: {0}")]
    Store(#[from] sp_store::StoreError),
}

impl From<TransitionError> for sp_common::AppError {
    fn from(e: TransitionError) -> Self {
        match e {
            TransitionError::Store(e) => sp_common::AppError::Store(e.to_string()),
            other => sp_common::AppError::validation(other.to_string()),
        }
    }
}
