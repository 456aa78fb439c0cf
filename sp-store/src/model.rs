//! Persisted entities (§3). Every nullable column in §6 is an `Option` here
//! — there is no empty-string-as-absent convention anywhere in this crate.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sp_protocol::{Action, Capacity, ResourceSpec};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Platform {
    Kubernetes,
    Docker,
    Vm,
    Cloud,
}

impl Platform {
    pub fn as_str(&self) -> &'static str {
        match self {
            Platform::Kubernetes => "kubernetes",
            Platform::Docker => "docker",
            Platform::Vm => "vm",
            Platform::Cloud => "cloud",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "kubernetes" => Some(Platform::Kubernetes),
            "docker" => Some(Platform::Docker),
            "vm" => Some(Platform::Vm),
            "cloud" => Some(Platform::Cloud),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentStatus {
    Online,
    Offline,
    Draining,
}

impl AgentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AgentStatus::Online => "online",
            AgentStatus::Offline => "offline",
            AgentStatus::Draining => "draining",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "online" => Some(AgentStatus::Online),
            "offline" => Some(AgentStatus::Offline),
            "draining" => Some(AgentStatus::Draining),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Agent {
    pub id: String,
    pub agent_id: String,
    pub platform: Platform,
    pub region: Option<String>,
    pub status: AgentStatus,
    pub capacity: Capacity,
    pub last_heartbeat: Option<DateTime<Utc>>,
    pub websocket_id: Option<String>,
    pub metadata: Option<serde_json::Value>,
    pub api_key_hash: Option<String>,
    pub api_key_created_at: Option<DateTime<Utc>>,
    pub api_key_last_used_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DesiredState {
    Running,
    Hibernated,
    Terminated,
}

impl DesiredState {
    pub fn as_str(&self) -> &'static str {
        match self {
            DesiredState::Running => "running",
            DesiredState::Hibernated => "hibernated",
            DesiredState::Terminated => "terminated",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "running" => Some(DesiredState::Running),
            "hibernated" => Some(DesiredState::Hibernated),
            "terminated" => Some(DesiredState::Terminated),
            _ => None,
        }
    }
}

/// `observed_state` per §3/§4.3. Order here is purely enumerative — validity
/// of a transition between two values is the Session State Machine's
/// business, not this crate's.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ObservedState {
    Pending,
    Creating,
    Running,
    Hibernating,
    Hibernated,
    Waking,
    Failed,
    Terminating,
    Terminated,
}

impl ObservedState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ObservedState::Pending => "pending",
            ObservedState::Creating => "creating",
            ObservedState::Running => "running",
            ObservedState::Hibernating => "hibernating",
            ObservedState::Hibernated => "hibernated",
            ObservedState::Waking => "waking",
            ObservedState::Failed => "failed",
            ObservedState::Terminating => "terminating",
            ObservedState::Terminated => "terminated",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "pending" => ObservedState::Pending,
            "creating" => ObservedState::Creating,
            "running" => ObservedState::Running,
            "hibernating" => ObservedState::Hibernating,
            "hibernated" => ObservedState::Hibernated,
            "waking" => ObservedState::Waking,
            "failed" => ObservedState::Failed,
            "terminating" => ObservedState::Terminating,
            "terminated" => ObservedState::Terminated,
            _ => return None,
        })
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, ObservedState::Terminated)
    }
}

#[derive(Debug, Clone)]
pub struct Session {
    pub id: String,
    pub user_id: String,
    pub template_id: String,
    pub platform: Platform,
    pub desired_state: DesiredState,
    pub observed_state: ObservedState,
    pub assigned_agent_id: Option<String>,
    pub resources: ResourceSpec,
    pub persistent_home: bool,
    pub idle_timeout: String,
    pub max_duration: Option<String>,
    pub last_activity: DateTime<Utc>,
    pub url: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandStatus {
    Pending,
    Sent,
    Ack,
    Completed,
    Failed,
}

impl CommandStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CommandStatus::Pending => "pending",
            CommandStatus::Sent => "sent",
            CommandStatus::Ack => "ack",
            CommandStatus::Completed => "completed",
            CommandStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "pending" => CommandStatus::Pending,
            "sent" => CommandStatus::Sent,
            "ack" => CommandStatus::Ack,
            "completed" => CommandStatus::Completed,
            "failed" => CommandStatus::Failed,
            _ => return None,
        })
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, CommandStatus::Completed | CommandStatus::Failed)
    }
}

#[derive(Debug, Clone)]
pub struct AgentCommand {
    pub id: String,
    pub command_id: String,
    pub agent_id: String,
    pub session_id: Option<String>,
    pub action: Action,
    pub payload: Option<serde_json::Value>,
    pub status: CommandStatus,
    /// MUST remain nullable (§4.4 nullability pitfall) — no empty-string sentinel.
    pub error_message: Option<String>,
    pub attempts: i64,
    pub created_at: DateTime<Utc>,
    pub sent_at: Option<DateTime<Utc>>,
    pub acknowledged_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub next_retry_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone)]
pub struct Connection {
    pub id: String,
    pub session_id: String,
    pub user_id: String,
    pub client_fingerprint: String,
    pub connected_at: DateTime<Utc>,
    pub last_heartbeat: DateTime<Utc>,
}
