//! Event bus for inter-component notification. Nothing in the core depends
//! on these for correctness — all durable state lives in the Store — they
//! exist so an external observability layer (metrics dashboards, the web UI)
//! can subscribe without the core knowing about it.

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

pub struct EventBus {
    /// Session observed_state transitions (state machine → observers).
    pub session_status: broadcast::Sender<SessionStatusEvent>,
    /// Command lifecycle transitions (dispatcher → observers).
    pub command_status: broadcast::Sender<CommandStatusEvent>,
    /// Agent connect/disconnect/status flips (registry → observers).
    pub agent_status: broadcast::Sender<AgentStatusEvent>,
    /// Not an error — a log-level event surfaced for observability (§7 ReconcilerRepair).
    pub reconciler_repair: broadcast::Sender<ReconcilerRepairEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        Self {
            session_status: broadcast::channel(256).0,
            command_status: broadcast::channel(256).0,
            agent_status: broadcast::channel(64).0,
            reconciler_repair: broadcast::channel(64).0,
        }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionStatusEvent {
    pub session_id: String,
    pub observed_state: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub assigned_agent_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandStatusEvent {
    pub command_id: String,
    pub agent_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    pub action: String,
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentStatusEvent {
    pub agent_id: String,
    pub status: String,
}

/// What kind of divergence the Reconciler closed. Logged, never an error.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReconcilerRepairKind {
    CommandRequeued,
    SessionMarkedFailed,
    OrphanConnectionRemoved,
    StaleCommandGarbageCollected,
    DriftStopEmitted,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconcilerRepairEvent {
    pub kind: ReconcilerRepairKind,
    pub subject_id: String,
    pub detail: String,
}
