use sp_store::model::Agent;

/// Result of a registration or key-rotation call: the persisted row plus the
/// plaintext API key, which exists only for the duration of this return
/// value — the Store only ever sees the salted hash (§4.2).
#[derive(Debug, Clone)]
pub struct RegisteredAgent {
    pub agent: Agent,
    pub api_key: String,
}

/// Outcome of `send(agent_id, frame)` (§4.2). Best-effort — durability is
/// the Dispatcher's job, not the registry's.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    Delivered,
    NoLiveConnection,
}

/// What happened to a previous connection when a new one authenticated for
/// the same `agent_id`.
#[derive(Debug, Clone)]
pub struct ConnectOutcome {
    pub websocket_id: String,
    /// The prior live `websocket_id`, if any — the caller must close that
    /// socket with `close_codes::SUPERSEDED` (§4.2 step 2, §8 property 5).
    pub superseded_websocket_id: Option<String>,
}
