//! Fixed DDL for the four authoritative tables (§6). Unlike a schema-builder
//! engine there is nothing generic here — these tables are the product, not
//! user-defined data.

pub const CREATE_TABLES_SQL: &str = "
CREATE TABLE IF NOT EXISTS agents (
    id TEXT PRIMARY KEY,
    agent_id TEXT UNIQUE NOT NULL,
    platform TEXT NOT NULL,
    region TEXT,
    status TEXT NOT NULL,
    capacity TEXT NOT NULL,
    last_heartbeat TEXT,
    websocket_id TEXT,
    metadata TEXT,
    api_key_hash TEXT,
    api_key_created_at TEXT,
    api_key_last_used_at TEXT,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS sessions (
    id TEXT PRIMARY KEY,
    user_id TEXT NOT NULL,
    template_id TEXT NOT NULL,
    platform TEXT NOT NULL,
    desired_state TEXT NOT NULL,
    observed_state TEXT NOT NULL,
    assigned_agent_id TEXT,
    resources TEXT NOT NULL,
    persistent_home INTEGER NOT NULL DEFAULT 0,
    idle_timeout TEXT NOT NULL,
    max_duration TEXT,
    last_activity TEXT NOT NULL,
    url TEXT,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_sessions_assigned_agent ON sessions(assigned_agent_id);
CREATE INDEX IF NOT EXISTS idx_sessions_observed_state ON sessions(observed_state);

CREATE TABLE IF NOT EXISTS agent_commands (
    id TEXT PRIMARY KEY,
    command_id TEXT UNIQUE NOT NULL,
    agent_id TEXT NOT NULL,
    session_id TEXT,
    action TEXT NOT NULL,
    payload TEXT,
    status TEXT NOT NULL,
    error_message TEXT,
    attempts INTEGER NOT NULL DEFAULT 0,
    created_at TEXT NOT NULL,
    sent_at TEXT,
    acknowledged_at TEXT,
    completed_at TEXT,
    next_retry_at TEXT
);

CREATE INDEX IF NOT EXISTS idx_commands_agent_status ON agent_commands(agent_id, status);
CREATE INDEX IF NOT EXISTS idx_commands_session ON agent_commands(session_id);
CREATE INDEX IF NOT EXISTS idx_commands_status_retry ON agent_commands(status, next_retry_at);

CREATE TABLE IF NOT EXISTS connections (
    id TEXT PRIMARY KEY,
    session_id TEXT NOT NULL,
    user_id TEXT NOT NULL,
    client_fingerprint TEXT NOT NULL,
    connected_at TEXT NOT NULL,
    last_heartbeat TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_connections_session ON connections(session_id);
";
