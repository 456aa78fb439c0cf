use thiserror::Error;

/// Error taxonomy shared across the control-plane core (§7).
///
/// Each component still defines its own narrow error enum (see
/// `sp-store::StoreError`, `sp-sessions::TransitionError`) — this is the
/// shape those convert into at the boundary where an error surfaces to a
/// caller or gets logged, so propagation policy stays consistent.
#[derive(Error, Debug)]
pub enum AppError {
    /// Invalid transition, malformed input. Caller-visible, 4xx-equivalent.
    #[error("validation error: {0}")]
    Validation(String),

    /// Agent API key mismatch. Caller must close the WS with code 4002 and
    /// never reveal whether the `agent_id` existed.
    #[error("authentication failed")]
    Auth,

    /// Durable store failure. Transient ones are retried at the call site;
    /// persistent ones bubble up here.
    #[error("store error: {0}")]
    Store(String),

    /// WebSocket write/transport failure. Never surfaced to the end user;
    /// triggers a connection close and command requeue.
    #[error("transport error: {0}")]
    Transport(String),

    /// Agent reported `success=false` for a command. Terminal for that
    /// command; the session transitions to `failed`.
    #[error("agent error: {0}")]
    Agent(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl AppError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }
}
