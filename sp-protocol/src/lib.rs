//! Wire types for the Control-Plane ↔ Agent WebSocket protocol (§4.7, §6).
//!
//! Every frame is a JSON object tagged by `type`. Inbound and outbound
//! directions get separate enums — an agent never receives an `AgentMessage`
//! and the control plane never receives a `ControlMessage` — so a mismatched
//! frame is a deserialize error rather than a silently-accepted wrong variant.

use serde::{Deserialize, Serialize};

/// The four actions a command may carry. Mirrors `AgentCommand.action` in
/// the Store (§3); kept as its own type so the wire and persisted
/// representations can't drift independently.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Action {
    StartSession,
    StopSession,
    HibernateSession,
    WakeSession,
}

impl Action {
    pub fn as_str(&self) -> &'static str {
        match self {
            Action::StartSession => "start_session",
            Action::StopSession => "stop_session",
            Action::HibernateSession => "hibernate_session",
            Action::WakeSession => "wake_session",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "start_session" => Action::StartSession,
            "stop_session" => Action::StopSession,
            "hibernate_session" => Action::HibernateSession,
            "wake_session" => Action::WakeSession,
            _ => return None,
        })
    }
}

/// Resource shape carried in a session's opaque `resources` column and echoed
/// into `start_session` payloads. Values are free-form strings ("1000m",
/// "2Gi") — the control plane never parses them, only an agent does.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ResourceSpec {
    #[serde(default)]
    pub cpu: Option<String>,
    #[serde(default)]
    pub memory: Option<String>,
    #[serde(default)]
    pub storage: Option<String>,
}

/// A mount an agent should bind into the container/VM it creates.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VolumeMount {
    pub host_path: String,
    pub mount_path: String,
    #[serde(default)]
    pub read_only: bool,
}

/// Full template manifest, the `start_session` payload (§4.7).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TemplateManifest {
    pub image: String,
    pub vnc_port: u16,
    #[serde(default)]
    pub env: std::collections::BTreeMap<String, String>,
    #[serde(default)]
    pub volume_mounts: Vec<VolumeMount>,
    #[serde(default)]
    pub resources: ResourceSpec,
    #[serde(default)]
    pub persistent_home: bool,
}

/// Declared capacity of an agent, reported at registration and heartbeat.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Capacity {
    pub max_sessions: u32,
    #[serde(default)]
    pub cpu: Option<String>,
    #[serde(default)]
    pub memory: Option<String>,
}

/// Session state as an agent observes it. Distinct from `ObservedState`
/// (sp-sessions) because the wire value `failed` maps onto the same state
/// machine event for every non-terminal current state (§4.3) — keeping the
/// wire enum separate means the state machine owns what each value means.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentObservedState {
    Creating,
    Running,
    Hibernating,
    Hibernated,
    Waking,
    Terminating,
    Terminated,
    Failed,
}

/// Messages an Agent sends to the Control Plane (§4.7 Inbound).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum AgentMessage {
    /// Initial handshake, sent immediately after the WS upgrade.
    #[serde(rename = "register")]
    Register {
        agent_id: String,
        platform: String,
        #[serde(default)]
        region: Option<String>,
        capacity: Capacity,
        #[serde(default)]
        metadata: serde_json::Value,
        api_key: String,
    },
    /// Liveness + load report, sent every H seconds.
    #[serde(rename = "heartbeat")]
    Heartbeat {
        status: String,
        active_sessions: u32,
        capacity: Capacity,
    },
    /// Receipt of a command — not a result.
    #[serde(rename = "command_ack")]
    CommandAck { command_id: String },
    /// Terminal outcome of exactly one command.
    #[serde(rename = "command_result")]
    CommandResult {
        command_id: String,
        success: bool,
        #[serde(default)]
        error: Option<String>,
        #[serde(default)]
        data: Option<serde_json::Value>,
    },
    /// Unsolicited observed-state update; drives the state machine
    /// independently of any in-flight command.
    #[serde(rename = "session_status")]
    SessionStatus {
        session_id: String,
        state: AgentObservedState,
        #[serde(default)]
        vnc_ready: bool,
        #[serde(default)]
        vnc_port: Option<u16>,
        #[serde(default)]
        platform_metadata: serde_json::Value,
    },
}

/// Messages the Control Plane sends to an Agent (§4.7 Outbound).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ControlMessage {
    #[serde(rename = "command")]
    Command {
        command_id: String,
        action: Action,
        #[serde(default)]
        session_id: Option<String>,
        payload: serde_json::Value,
    },
    #[serde(rename = "ping")]
    Ping { timestamp: chrono::DateTime<chrono::Utc> },
    #[serde(rename = "shutdown")]
    Shutdown { reason: String },
}

impl ControlMessage {
    pub fn command(
        command_id: impl Into<String>,
        action: Action,
        session_id: Option<String>,
        payload: serde_json::Value,
    ) -> Self {
        Self::Command {
            command_id: command_id.into(),
            action,
            session_id,
            payload,
        }
    }
}

/// WebSocket close codes the gateway uses (§6). Plain `u16`s rather than an
/// enum — `axum`'s `CloseFrame` wants a raw code and these never round-trip
/// through JSON.
pub mod close_codes {
    /// A newer connection for the same `agent_id` replaced this one.
    pub const SUPERSEDED: u16 = 4001;
    /// API key did not match the stored hash.
    pub const AUTH_FAILED: u16 = 4002;
    /// Malformed JSON or an otherwise-unparseable frame.
    pub const PROTOCOL_ERROR: u16 = 4003;
}
