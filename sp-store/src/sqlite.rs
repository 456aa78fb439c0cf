use std::path::Path;

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use tracing::{info, warn};
use uuid::Uuid;

use sp_protocol::{Action, Capacity, ResourceSpec};

use crate::error::StoreError;
use crate::model::{
    Agent, AgentCommand, AgentStatus, CommandStatus, Connection as ConnectionRow, DesiredState,
    ObservedState, Platform, Session,
};
use crate::schema::CREATE_TABLES_SQL;

/// The durable Store (§4.1). A thin wrapper over a single `rusqlite`
/// connection — the Store is the sole synchronization point for
/// cross-component state (§5), so there is deliberately no connection pool:
/// SQLite serializes writers anyway, and `unchecked_transaction` gives us
/// atomic multi-statement compounds without needing `&mut self` everywhere.
pub struct SqliteStore {
    conn: Connection,
}

fn now_str(now: DateTime<Utc>) -> String {
    now.to_rfc3339()
}

fn parse_dt(s: &str) -> Result<DateTime<Utc>, StoreError> {
    DateTime::parse_from_rfc3339(s)
        .map(|d| d.with_timezone(&Utc))
        .map_err(|e| StoreError::CorruptRow(format!("bad timestamp {s:?}: {e}")))
}

fn parse_opt_dt(s: Option<String>) -> Result<Option<DateTime<Utc>>, StoreError> {
    s.map(|s| parse_dt(&s)).transpose()
}

impl SqliteStore {
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;")?;
        let store = Self { conn };
        store.conn.execute_batch(CREATE_TABLES_SQL)?;
        Ok(store)
    }

    pub fn open_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch("PRAGMA foreign_keys=ON;")?;
        let store = Self { conn };
        store.conn.execute_batch(CREATE_TABLES_SQL)?;
        Ok(store)
    }

    // ── Agents ──────────────────────────────────────────────────────

    /// Inserts a new agent row, or rotates the API key hash of an existing
    /// one with the same `agent_id` (§4.2 re-registration rotates the key).
    pub fn upsert_agent(
        &self,
        agent_id: &str,
        platform: Platform,
        region: Option<&str>,
        capacity: &Capacity,
        api_key_hash: &str,
        now: DateTime<Utc>,
    ) -> Result<Agent, StoreError> {
        let tx = self.conn.unchecked_transaction()?;
        let existing: Option<String> = tx
            .query_row(
                "SELECT id FROM agents WHERE agent_id = ?1",
                params![agent_id],
                |r| r.get(0),
            )
            .optional()?;

        let capacity_json = serde_json::to_string(capacity)?;
        let now_s = now_str(now);

        let id = if let Some(id) = existing {
            tx.execute(
                "UPDATE agents SET platform = ?1, region = ?2, capacity = ?3,
                 api_key_hash = ?4, api_key_created_at = ?5, updated_at = ?6
                 WHERE agent_id = ?7",
                params![
                    platform.as_str(),
                    region,
                    capacity_json,
                    api_key_hash,
                    now_s,
                    now_s,
                    agent_id
                ],
            )?;
            info!(agent_id, "agent re-registered, API key rotated");
            id
        } else {
            let id = Uuid::new_v4().to_string();
            tx.execute(
                "INSERT INTO agents (id, agent_id, platform, region, status, capacity,
                 api_key_hash, api_key_created_at, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, 'offline', ?5, ?6, ?7, ?8, ?9)",
                params![
                    id,
                    agent_id,
                    platform.as_str(),
                    region,
                    capacity_json,
                    api_key_hash,
                    now_s,
                    now_s,
                    now_s
                ],
            )?;
            info!(agent_id, "agent registered");
            id
        };
        tx.commit()?;
        self.get_agent_by_agent_id(agent_id)?
            .ok_or_else(|| StoreError::NotFound(format!("agent {id} vanished after upsert")))
    }

    pub fn get_agent_by_agent_id(&self, agent_id: &str) -> Result<Option<Agent>, StoreError> {
        self.conn
            .query_row(
                "SELECT id, agent_id, platform, region, status, capacity, last_heartbeat,
                 websocket_id, metadata, api_key_hash, api_key_created_at, api_key_last_used_at,
                 created_at, updated_at FROM agents WHERE agent_id = ?1",
                params![agent_id],
                row_to_agent,
            )
            .optional()?
            .transpose()
    }

    /// Authenticates a connect attempt and, on success, assigns a fresh
    /// `websocket_id`, closing out any prior one the caller must then close
    /// on the wire (§4.2 step 2). Returns the previous `websocket_id` if any.
    pub fn bind_agent_websocket(
        &self,
        agent_id: &str,
        websocket_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<String>, StoreError> {
        let tx = self.conn.unchecked_transaction()?;
        let prior: Option<String> = tx
            .query_row(
                "SELECT websocket_id FROM agents WHERE agent_id = ?1",
                params![agent_id],
                |r| r.get(0),
            )
            .optional()?
            .flatten();
        let changed = tx.execute(
            "UPDATE agents SET websocket_id = ?1, status = 'online', last_heartbeat = ?2,
             updated_at = ?2 WHERE agent_id = ?3",
            params![websocket_id, now_str(now), agent_id],
        )?;
        if changed == 0 {
            return Err(StoreError::NotFound(format!("agent {agent_id}")));
        }
        tx.commit()?;
        Ok(prior)
    }

    /// Clears the live websocket binding, e.g. on disconnect or when a
    /// superseding connection closes this one.
    pub fn clear_agent_websocket(
        &self,
        agent_id: &str,
        expected_websocket_id: &str,
    ) -> Result<(), StoreError> {
        let changed = self.conn.execute(
            "UPDATE agents SET websocket_id = NULL WHERE agent_id = ?1 AND websocket_id = ?2",
            params![agent_id, expected_websocket_id],
        )?;
        if changed == 0 {
            // Already superseded by a newer connection; not an error.
            warn!(agent_id, "clear_agent_websocket found a different or absent binding");
        }
        Ok(())
    }

    /// Records a heartbeat; flips `offline -> online` on first heartbeat
    /// after a gap (§4.1).
    pub fn record_heartbeat(&self, agent_id: &str, now: DateTime<Utc>) -> Result<(), StoreError> {
        let changed = self.conn.execute(
            "UPDATE agents SET last_heartbeat = ?1, updated_at = ?1,
             status = CASE WHEN status = 'offline' THEN 'online' ELSE status END
             WHERE agent_id = ?2",
            params![now_str(now), agent_id],
        )?;
        if changed == 0 {
            return Err(StoreError::NotFound(format!("agent {agent_id}")));
        }
        Ok(())
    }

    /// Flips `status -> offline` and nulls `websocket_id` for any agent whose
    /// last heartbeat is older than `threshold`. Returns the affected
    /// `agent_id`s, for the caller to emit events/logs.
    pub fn mark_stale_agents_offline(
        &self,
        threshold: DateTime<Utc>,
    ) -> Result<Vec<String>, StoreError> {
        let mut stmt = self.conn.prepare(
            "SELECT agent_id FROM agents WHERE status = 'online' AND
             (last_heartbeat IS NULL OR last_heartbeat < ?1)",
        )?;
        let ids: Vec<String> = stmt
            .query_map(params![now_str(threshold)], |r| r.get(0))?
            .collect::<Result<_, _>>()?;
        drop(stmt);
        self.conn.execute(
            "UPDATE agents SET status = 'offline', websocket_id = NULL WHERE status = 'online' AND
             (last_heartbeat IS NULL OR last_heartbeat < ?1)",
            params![now_str(threshold)],
        )?;
        Ok(ids)
    }

    pub fn set_agent_status(&self, agent_id: &str, status: AgentStatus) -> Result<(), StoreError> {
        let changed = self.conn.execute(
            "UPDATE agents SET status = ?1 WHERE agent_id = ?2",
            params![status.as_str(), agent_id],
        )?;
        if changed == 0 {
            return Err(StoreError::NotFound(format!("agent {agent_id}")));
        }
        Ok(())
    }

    /// Agents with `status = online`, ordered so callers can pick the least
    /// loaded; load ratio itself is computed by the caller from
    /// `active_sessions_for_agent`.
    pub fn list_online_agents(&self, platform: Platform) -> Result<Vec<Agent>, StoreError> {
        let mut stmt = self.conn.prepare(
            "SELECT id, agent_id, platform, region, status, capacity, last_heartbeat,
             websocket_id, metadata, api_key_hash, api_key_created_at, api_key_last_used_at,
             created_at, updated_at FROM agents WHERE status = 'online' AND platform = ?1",
        )?;
        let rows = stmt.query_map(params![platform.as_str()], row_to_agent)?;
        rows.collect::<Result<Vec<_>, _>>()?.into_iter().collect()
    }

    /// Every currently-online agent, any platform — the dispatch worker
    /// pool's source of agent ids to poll (§4.4 "Selection & queueing").
    pub fn list_online_agent_ids(&self) -> Result<Vec<String>, StoreError> {
        let mut stmt = self.conn.prepare("SELECT agent_id FROM agents WHERE status = 'online'")?;
        let rows = stmt.query_map([], |r| r.get::<_, String>(0))?;
        rows.collect::<Result<Vec<_>, _>>().map_err(StoreError::from)
    }

    pub fn count_active_sessions_for_agent(&self, agent_id: &str) -> Result<u32, StoreError> {
        let n: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM sessions WHERE assigned_agent_id = ?1 AND
             observed_state NOT IN ('terminated', 'failed')",
            params![agent_id],
            |r| r.get(0),
        )?;
        Ok(n as u32)
    }

    // ── Sessions ────────────────────────────────────────────────────

    #[allow(clippy::too_many_arguments)]
    pub fn create_session(
        &self,
        user_id: &str,
        template_id: &str,
        platform: Platform,
        resources: &ResourceSpec,
        persistent_home: bool,
        idle_timeout: &str,
        max_duration: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<Session, StoreError> {
        let id = Uuid::new_v4().to_string();
        let now_s = now_str(now);
        let resources_json = serde_json::to_string(resources)?;
        self.conn.execute(
            "INSERT INTO sessions (id, user_id, template_id, platform, desired_state,
             observed_state, resources, persistent_home, idle_timeout, max_duration,
             last_activity, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, 'running', 'pending', ?5, ?6, ?7, ?8, ?9, ?9, ?9)",
            params![
                id,
                user_id,
                template_id,
                platform.as_str(),
                resources_json,
                persistent_home as i32,
                idle_timeout,
                max_duration,
                now_s,
            ],
        )?;
        info!(session_id = %id, user_id, template_id, "session created");
        self.get_session(&id)?
            .ok_or_else(|| StoreError::NotFound(format!("session {id} vanished after create")))
    }

    pub fn get_session(&self, session_id: &str) -> Result<Option<Session>, StoreError> {
        self.conn
            .query_row(
                "SELECT id, user_id, template_id, platform, desired_state, observed_state,
                 assigned_agent_id, resources, persistent_home, idle_timeout, max_duration,
                 last_activity, url, created_at, updated_at FROM sessions WHERE id = ?1",
                params![session_id],
                row_to_session,
            )
            .optional()?
            .transpose()
    }

    pub fn list_sessions_for_user(&self, user_id: &str) -> Result<Vec<Session>, StoreError> {
        let mut stmt = self.conn.prepare(
            "SELECT id, user_id, template_id, platform, desired_state, observed_state,
             assigned_agent_id, resources, persistent_home, idle_timeout, max_duration,
             last_activity, url, created_at, updated_at FROM sessions WHERE user_id = ?1
             ORDER BY created_at DESC",
        )?;
        let rows = stmt.query_map(params![user_id], row_to_session)?;
        rows.collect::<Result<Vec<_>, _>>()?.into_iter().collect()
    }

    pub fn list_non_terminal_sessions(&self) -> Result<Vec<Session>, StoreError> {
        let mut stmt = self.conn.prepare(
            "SELECT id, user_id, template_id, platform, desired_state, observed_state,
             assigned_agent_id, resources, persistent_home, idle_timeout, max_duration,
             last_activity, url, created_at, updated_at FROM sessions
             WHERE observed_state != 'terminated'",
        )?;
        let rows = stmt.query_map([], row_to_session)?;
        rows.collect::<Result<Vec<_>, _>>()?.into_iter().collect()
    }

    /// Sessions this agent is expected to own right now (§4.2 step 3
    /// "registered" handshake frame) — every non-terminal session pinned to
    /// it.
    pub fn list_non_terminal_sessions_for_agent(&self, agent_id: &str) -> Result<Vec<Session>, StoreError> {
        let mut stmt = self.conn.prepare(
            "SELECT id, user_id, template_id, platform, desired_state, observed_state,
             assigned_agent_id, resources, persistent_home, idle_timeout, max_duration,
             last_activity, url, created_at, updated_at FROM sessions
             WHERE assigned_agent_id = ?1 AND observed_state != 'terminated'",
        )?;
        let rows = stmt.query_map(params![agent_id], row_to_session)?;
        rows.collect::<Result<Vec<_>, _>>()?.into_iter().collect()
    }

    pub fn set_session_desired_state(
        &self,
        session_id: &str,
        desired: DesiredState,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let changed = self.conn.execute(
            "UPDATE sessions SET desired_state = ?1, updated_at = ?2 WHERE id = ?3",
            params![desired.as_str(), now_str(now), session_id],
        )?;
        if changed == 0 {
            return Err(StoreError::NotFound(format!("session {session_id}")));
        }
        Ok(())
    }

    pub fn set_session_observed_state(
        &self,
        session_id: &str,
        observed: ObservedState,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let changed = self.conn.execute(
            "UPDATE sessions SET observed_state = ?1, updated_at = ?2 WHERE id = ?3",
            params![observed.as_str(), now_str(now), session_id],
        )?;
        if changed == 0 {
            return Err(StoreError::NotFound(format!("session {session_id}")));
        }
        Ok(())
    }

    pub fn set_session_assigned_agent(
        &self,
        session_id: &str,
        agent_id: &str,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let changed = self.conn.execute(
            "UPDATE sessions SET assigned_agent_id = ?1, updated_at = ?2 WHERE id = ?3",
            params![agent_id, now_str(now), session_id],
        )?;
        if changed == 0 {
            return Err(StoreError::NotFound(format!("session {session_id}")));
        }
        Ok(())
    }

    pub fn set_session_url(
        &self,
        session_id: &str,
        url: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let changed = self.conn.execute(
            "UPDATE sessions SET url = ?1, updated_at = ?2 WHERE id = ?3",
            params![url, now_str(now), session_id],
        )?;
        if changed == 0 {
            return Err(StoreError::NotFound(format!("session {session_id}")));
        }
        Ok(())
    }

    pub fn touch_last_activity(
        &self,
        session_id: &str,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let changed = self.conn.execute(
            "UPDATE sessions SET last_activity = ?1, updated_at = ?1 WHERE id = ?2",
            params![now_str(now), session_id],
        )?;
        if changed == 0 {
            return Err(StoreError::NotFound(format!("session {session_id}")));
        }
        Ok(())
    }

    /// Sessions with no live connection whose `last_activity` predates
    /// `now - idle_timeout` are candidates for the Connection Tracker's idle
    /// hibernation sweep. `idle_timeout` is stored as free text (§3) so the
    /// caller parses and filters in Rust rather than in SQL.
    pub fn list_running_sessions_with_last_activity(&self) -> Result<Vec<Session>, StoreError> {
        let mut stmt = self.conn.prepare(
            "SELECT id, user_id, template_id, platform, desired_state, observed_state,
             assigned_agent_id, resources, persistent_home, idle_timeout, max_duration,
             last_activity, url, created_at, updated_at FROM sessions WHERE observed_state = 'running'",
        )?;
        let rows = stmt.query_map([], row_to_session)?;
        rows.collect::<Result<Vec<_>, _>>()?.into_iter().collect()
    }

    // ── Commands ────────────────────────────────────────────────────

    /// Creates a pending command and applies the accompanying observed-state
    /// transition atomically (§4.4 step 1 — "created ... along with the
    /// state transition, in the same transaction").
    pub fn create_command_with_session_transition(
        &self,
        agent_id: &str,
        session_id: Option<&str>,
        action: Action,
        payload: Option<&serde_json::Value>,
        transition: Option<(&str, ObservedState)>,
        now: DateTime<Utc>,
    ) -> Result<AgentCommand, StoreError> {
        let tx = self.conn.unchecked_transaction()?;
        let id = Uuid::new_v4().to_string();
        let command_id = Uuid::new_v4().to_string();
        let now_s = now_str(now);
        let payload_json = payload.map(serde_json::to_string).transpose()?;
        tx.execute(
            "INSERT INTO agent_commands (id, command_id, agent_id, session_id, action,
             payload, status, attempts, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, 'pending', 0, ?7)",
            params![id, command_id, agent_id, session_id, action.as_str(), payload_json, now_s],
        )?;
        if let Some((sid, observed)) = transition {
            tx.execute(
                "UPDATE sessions SET observed_state = ?1, updated_at = ?2 WHERE id = ?3",
                params![observed.as_str(), now_s, sid],
            )?;
        }
        tx.commit()?;
        info!(command_id, agent_id, action = action.as_str(), "command created");
        self.get_command_by_command_id(&command_id)?.ok_or_else(|| {
            StoreError::NotFound(format!("command {command_id} vanished after create"))
        })
    }

    /// Atomically selects up to `limit` commands eligible for this agent
    /// (`status = pending`, `next_retry_at <= now` or null), marks them
    /// `sent`, stamps `sent_at`, and increments `attempts` — all inside one
    /// transaction so concurrent dispatcher workers never double-claim a
    /// row (§4.1, §4.4 step 2).
    ///
    /// The scanner for this query is the one place the §4.4 nullability
    /// pitfall bites hardest: `error_message` must round-trip through here
    /// as `NULL` for a freshly-created command, never an empty string.
    pub fn claim_pending_commands(
        &self,
        agent_id: &str,
        limit: u32,
        now: DateTime<Utc>,
    ) -> Result<Vec<AgentCommand>, StoreError> {
        let tx = self.conn.unchecked_transaction()?;
        let now_s = now_str(now);
        let ids: Vec<String> = {
            let mut stmt = tx.prepare(
                "SELECT id FROM agent_commands WHERE agent_id = ?1 AND status = 'pending'
                 AND (next_retry_at IS NULL OR next_retry_at <= ?2)
                 ORDER BY created_at ASC LIMIT ?3",
            )?;
            stmt.query_map(params![agent_id, now_s, limit], |r| r.get(0))?
                .collect::<Result<_, _>>()?
        };
        for id in &ids {
            tx.execute(
                "UPDATE agent_commands SET status = 'sent', sent_at = ?1, attempts = attempts + 1
                 WHERE id = ?2 AND status = 'pending'",
                params![now_s, id],
            )?;
        }
        let mut claimed = Vec::with_capacity(ids.len());
        for id in &ids {
            let row: AgentCommand = tx.query_row(
                "SELECT id, command_id, agent_id, session_id, action, payload, status,
                 error_message, attempts, created_at, sent_at, acknowledged_at, completed_at,
                 next_retry_at FROM agent_commands WHERE id = ?1",
                params![id],
                row_to_command,
            )??;
            claimed.push(row);
        }
        tx.commit()?;
        Ok(claimed)
    }

    /// Compare-and-set on command status (§4.1, §4.4 steps 3-5). Fails with
    /// `StaleWrite` if the row's current status does not match `expected` —
    /// the caller (e.g. a late-arriving duplicate `command_ack`) should
    /// treat that as a no-op, not an error to surface.
    pub fn cas_command_status(
        &self,
        command_id: &str,
        expected: CommandStatus,
        new: CommandStatus,
        error_message: Option<&str>,
        next_retry_at: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> Result<AgentCommand, StoreError> {
        let tx = self.conn.unchecked_transaction()?;
        let now_s = now_str(now);
        let timestamp_column = match new {
            CommandStatus::Ack => Some("acknowledged_at"),
            CommandStatus::Completed | CommandStatus::Failed => Some("completed_at"),
            _ => None,
        };
        let changed = match timestamp_column {
            Some(col) => {
                let sql = format!(
                    "UPDATE agent_commands SET status = ?1, error_message = ?2, next_retry_at = ?3,
                     {col} = ?4 WHERE command_id = ?5 AND status = ?6"
                );
                tx.execute(
                    &sql,
                    params![
                        new.as_str(),
                        error_message,
                        next_retry_at.map(now_str),
                        now_s,
                        command_id,
                        expected.as_str()
                    ],
                )?
            }
            None => tx.execute(
                "UPDATE agent_commands SET status = ?1, error_message = ?2, next_retry_at = ?3
                 WHERE command_id = ?4 AND status = ?5",
                params![
                    new.as_str(),
                    error_message,
                    next_retry_at.map(now_str),
                    command_id,
                    expected.as_str()
                ],
            )?,
        };
        if changed == 0 {
            let current = tx
                .query_row(
                    "SELECT status FROM agent_commands WHERE command_id = ?1",
                    params![command_id],
                    |r| r.get::<_, String>(0),
                )
                .optional()?;
            return Err(match current {
                Some(s) => StoreError::StaleWrite(format!(
                    "command {command_id} expected {}, found {s}",
                    expected.as_str()
                )),
                None => StoreError::NotFound(format!("command {command_id}")),
            });
        }
        tx.commit()?;
        self.get_command_by_command_id(command_id)?
            .ok_or_else(|| StoreError::NotFound(format!("command {command_id}")))
    }

    pub fn get_command_by_command_id(
        &self,
        command_id: &str,
    ) -> Result<Option<AgentCommand>, StoreError> {
        self.conn
            .query_row(
                "SELECT id, command_id, agent_id, session_id, action, payload, status,
                 error_message, attempts, created_at, sent_at, acknowledged_at, completed_at,
                 next_retry_at FROM agent_commands WHERE command_id = ?1",
                params![command_id],
                row_to_command,
            )
            .optional()?
            .transpose()
    }

    pub fn list_non_terminal_commands_for_session(
        &self,
        session_id: &str,
    ) -> Result<Vec<AgentCommand>, StoreError> {
        let mut stmt = self.conn.prepare(
            "SELECT id, command_id, agent_id, session_id, action, payload, status,
             error_message, attempts, created_at, sent_at, acknowledged_at, completed_at,
             next_retry_at FROM agent_commands WHERE session_id = ?1
             AND status NOT IN ('completed', 'failed')",
        )?;
        let rows = stmt.query_map(params![session_id], row_to_command)?;
        rows.collect::<Result<Vec<_>, _>>()?.into_iter().collect()
    }

    /// Commands in `{sent, ack}` for an agent — the reconnect-replay set
    /// (§4.4 "Reconnect replay").
    pub fn list_in_flight_commands_for_agent(
        &self,
        agent_id: &str,
    ) -> Result<Vec<AgentCommand>, StoreError> {
        let mut stmt = self.conn.prepare(
            "SELECT id, command_id, agent_id, session_id, action, payload, status,
             error_message, attempts, created_at, sent_at, acknowledged_at, completed_at,
             next_retry_at FROM agent_commands WHERE agent_id = ?1 AND status IN ('sent', 'ack')
             ORDER BY created_at ASC",
        )?;
        let rows = stmt.query_map(params![agent_id], row_to_command)?;
        rows.collect::<Result<Vec<_>, _>>()?.into_iter().collect()
    }

    /// Commands stuck in `sent` older than `older_than` — candidates for the
    /// Reconciler's command-recovery pass (§4.6.1).
    pub fn list_stale_sent_commands(
        &self,
        older_than: DateTime<Utc>,
    ) -> Result<Vec<AgentCommand>, StoreError> {
        let mut stmt = self.conn.prepare(
            "SELECT id, command_id, agent_id, session_id, action, payload, status,
             error_message, attempts, created_at, sent_at, acknowledged_at, completed_at,
             next_retry_at FROM agent_commands WHERE status = 'sent' AND sent_at < ?1",
        )?;
        let rows = stmt.query_map(params![now_str(older_than)], row_to_command)?;
        rows.collect::<Result<Vec<_>, _>>()?.into_iter().collect()
    }

    pub fn gc_terminal_commands_older_than(
        &self,
        older_than: DateTime<Utc>,
    ) -> Result<u64, StoreError> {
        let n = self.conn.execute(
            "DELETE FROM agent_commands WHERE status IN ('completed', 'failed')
             AND created_at < ?1",
            params![now_str(older_than)],
        )?;
        Ok(n as u64)
    }

    /// Orphan GC for terminated sessions past retention (§4.6.3). Commands
    /// referencing the session are left to `gc_terminal_commands_older_than`
    /// — both sweeps run off the same retention horizon in practice.
    pub fn gc_terminated_sessions_older_than(
        &self,
        older_than: DateTime<Utc>,
    ) -> Result<u64, StoreError> {
        let n = self.conn.execute(
            "DELETE FROM sessions WHERE observed_state = 'terminated' AND updated_at < ?1",
            params![now_str(older_than)],
        )?;
        Ok(n as u64)
    }

    // ── Connections ─────────────────────────────────────────────────

    pub fn insert_connection(
        &self,
        session_id: &str,
        user_id: &str,
        client_fingerprint: &str,
        now: DateTime<Utc>,
    ) -> Result<ConnectionRow, StoreError> {
        let id = Uuid::new_v4().to_string();
        let now_s = now_str(now);
        self.conn.execute(
            "INSERT INTO connections (id, session_id, user_id, client_fingerprint,
             connected_at, last_heartbeat) VALUES (?1, ?2, ?3, ?4, ?5, ?5)",
            params![id, session_id, user_id, client_fingerprint, now_s],
        )?;
        Ok(ConnectionRow {
            id,
            session_id: session_id.to_string(),
            user_id: user_id.to_string(),
            client_fingerprint: client_fingerprint.to_string(),
            connected_at: now,
            last_heartbeat: now,
        })
    }

    pub fn update_connection_heartbeat(
        &self,
        connection_id: &str,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let changed = self.conn.execute(
            "UPDATE connections SET last_heartbeat = ?1 WHERE id = ?2",
            params![now_str(now), connection_id],
        )?;
        if changed == 0 {
            return Err(StoreError::NotFound(format!("connection {connection_id}")));
        }
        Ok(())
    }

    pub fn delete_connection(&self, connection_id: &str) -> Result<Option<ConnectionRow>, StoreError> {
        let row = self.get_connection(connection_id)?;
        self.conn.execute(
            "DELETE FROM connections WHERE id = ?1",
            params![connection_id],
        )?;
        Ok(row)
    }

    pub fn get_connection(&self, connection_id: &str) -> Result<Option<ConnectionRow>, StoreError> {
        self.conn
            .query_row(
                "SELECT id, session_id, user_id, client_fingerprint, connected_at, last_heartbeat
                 FROM connections WHERE id = ?1",
                params![connection_id],
                row_to_connection,
            )
            .optional()?
            .transpose()
    }

    pub fn count_live_connections_for_session(&self, session_id: &str) -> Result<u64, StoreError> {
        let n: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM connections WHERE session_id = ?1",
            params![session_id],
            |r| r.get(0),
        )?;
        Ok(n as u64)
    }

    /// Connections whose `last_heartbeat` predates `threshold` (§4.5
    /// staleness sweep).
    pub fn list_stale_connections(
        &self,
        threshold: DateTime<Utc>,
    ) -> Result<Vec<ConnectionRow>, StoreError> {
        let mut stmt = self.conn.prepare(
            "SELECT id, session_id, user_id, client_fingerprint, connected_at, last_heartbeat
             FROM connections WHERE last_heartbeat < ?1",
        )?;
        let rows = stmt.query_map(params![now_str(threshold)], row_to_connection)?;
        rows.collect::<Result<Vec<_>, _>>()?.into_iter().collect()
    }
}

fn row_to_agent(row: &Row) -> rusqlite::Result<Result<Agent, StoreError>> {
    Ok((|| {
        let platform_s: String = row.get(2)?;
        let status_s: String = row.get(4)?;
        let capacity_s: String = row.get(5)?;
        let last_heartbeat: Option<String> = row.get(6)?;
        let api_key_created_at: Option<String> = row.get(10)?;
        let api_key_last_used_at: Option<String> = row.get(11)?;
        let created_at: String = row.get(12)?;
        let updated_at: String = row.get(13)?;
        let metadata: Option<String> = row.get(8)?;

        Ok(Agent {
            id: row.get(0)?,
            agent_id: row.get(1)?,
            platform: Platform::parse(&platform_s)
                .ok_or_else(|| StoreError::CorruptRow(format!("bad platform {platform_s:?}")))?,
            region: row.get(3)?,
            status: AgentStatus::parse(&status_s)
                .ok_or_else(|| StoreError::CorruptRow(format!("bad status {status_s:?}")))?,
            capacity: serde_json::from_str(&capacity_s)?,
            last_heartbeat: parse_opt_dt(last_heartbeat)?,
            websocket_id: row.get(7)?,
            metadata: metadata.map(|m| serde_json::from_str(&m)).transpose()?,
            api_key_hash: row.get(9)?,
            api_key_created_at: parse_opt_dt(api_key_created_at)?,
            api_key_last_used_at: parse_opt_dt(api_key_last_used_at)?,
            created_at: parse_dt(&created_at)?,
            updated_at: parse_dt(&updated_at)?,
        })
    })())
}

fn row_to_session(row: &Row) -> rusqlite::Result<Result<Session, StoreError>> {
    Ok((|| {
        let platform_s: String = row.get(3)?;
        let desired_s: String = row.get(4)?;
        let observed_s: String = row.get(5)?;
        let resources_s: String = row.get(7)?;
        let last_activity: String = row.get(11)?;
        let created_at: String = row.get(13)?;
        let updated_at: String = row.get(14)?;

        Ok(Session {
            id: row.get(0)?,
            user_id: row.get(1)?,
            template_id: row.get(2)?,
            platform: Platform::parse(&platform_s)
                .ok_or_else(|| StoreError::CorruptRow(format!("bad platform {platform_s:?}")))?,
            desired_state: DesiredState::parse(&desired_s).ok_or_else(|| {
                StoreError::CorruptRow(format!("bad desired_state {desired_s:?}"))
            })?,
            observed_state: ObservedState::parse(&observed_s).ok_or_else(|| {
                StoreError::CorruptRow(format!("bad observed_state {observed_s:?}"))
            })?,
            assigned_agent_id: row.get(6)?,
            resources: serde_json::from_str(&resources_s)?,
            persistent_home: row.get::<_, i64>(8)? != 0,
            idle_timeout: row.get(9)?,
            max_duration: row.get(10)?,
            last_activity: parse_dt(&last_activity)?,
            url: row.get(12)?,
            created_at: parse_dt(&created_at)?,
            updated_at: parse_dt(&updated_at)?,
        })
    })())
}

/// Scans one `agent_commands` row. `error_message` (index 7) is read as
/// `Option<String>` — the one line in this module that, if changed to
/// default a missing value to `""`, reintroduces the outage described in
/// §9 ("Ambiguous source behavior").
fn row_to_command(row: &Row) -> rusqlite::Result<Result<AgentCommand, StoreError>> {
    Ok((|| {
        let action_s: String = row.get(4)?;
        let payload_s: Option<String> = row.get(5)?;
        let status_s: String = row.get(6)?;
        let error_message: Option<String> = row.get(7)?;
        let created_at: String = row.get(9)?;
        let sent_at: Option<String> = row.get(10)?;
        let acknowledged_at: Option<String> = row.get(11)?;
        let completed_at: Option<String> = row.get(12)?;
        let next_retry_at: Option<String> = row.get(13)?;

        Ok(AgentCommand {
            id: row.get(0)?,
            command_id: row.get(1)?,
            agent_id: row.get(2)?,
            session_id: row.get(3)?,
            action: Action::parse(&action_s)
                .ok_or_else(|| StoreError::CorruptRow(format!("bad action {action_s:?}")))?,
            payload: payload_s.map(|p| serde_json::from_str(&p)).transpose()?,
            status: CommandStatus::parse(&status_s)
                .ok_or_else(|| StoreError::CorruptRow(format!("bad status {status_s:?}")))?,
            error_message,
            attempts: row.get(8)?,
            created_at: parse_dt(&created_at)?,
            sent_at: parse_opt_dt(sent_at)?,
            acknowledged_at: parse_opt_dt(acknowledged_at)?,
            completed_at: parse_opt_dt(completed_at)?,
            next_retry_at: parse_opt_dt(next_retry_at)?,
        })
    })())
}

fn row_to_connection(row: &Row) -> rusqlite::Result<Result<ConnectionRow, StoreError>> {
    Ok((|| {
        let connected_at: String = row.get(4)?;
        let last_heartbeat: String = row.get(5)?;
        Ok(ConnectionRow {
            id: row.get(0)?,
            session_id: row.get(1)?,
            user_id: row.get(2)?,
            client_fingerprint: row.get(3)?,
            connected_at: parse_dt(&connected_at)?,
            last_heartbeat: parse_dt(&last_heartbeat)?,
        })
    })())
}

#[cfg(test)]
mod tests {
    use super::*;
    use sp_protocol::ResourceSpec;

    fn capacity() -> Capacity {
        Capacity { max_sessions: 10, cpu: Some("8".into()), memory: Some("32Gi".into()) }
    }

    #[test]
    fn register_then_fetch_agent() {
        let store = SqliteStore::open_memory().unwrap();
        let now = Utc::now();
        let agent = store
            .upsert_agent("k8s-a", Platform::Kubernetes, Some("us-east"), &capacity(), "hash1", now)
            .unwrap();
        assert_eq!(agent.agent_id, "k8s-a");
        assert_eq!(agent.status, AgentStatus::Offline);
        assert!(agent.websocket_id.is_none());
    }

    #[test]
    fn re_registration_rotates_key() {
        let store = SqliteStore::open_memory().unwrap();
        let now = Utc::now();
        store
            .upsert_agent("k8s-a", Platform::Kubernetes, None, &capacity(), "hash1", now)
            .unwrap();
        let agent = store
            .upsert_agent("k8s-a", Platform::Kubernetes, None, &capacity(), "hash2", now)
            .unwrap();
        assert_eq!(agent.api_key_hash.as_deref(), Some("hash2"));
    }

    #[test]
    fn bind_websocket_returns_prior_binding() {
        let store = SqliteStore::open_memory().unwrap();
        let now = Utc::now();
        store
            .upsert_agent("k8s-a", Platform::Kubernetes, None, &capacity(), "hash1", now)
            .unwrap();
        let prior = store.bind_agent_websocket("k8s-a", "ws-1", now).unwrap();
        assert!(prior.is_none());
        let prior2 = store.bind_agent_websocket("k8s-a", "ws-2", now).unwrap();
        assert_eq!(prior2.as_deref(), Some("ws-1"));
    }

    #[test]
    fn claim_pending_command_with_null_error_message_is_returned_exactly_once() {
        // Regression guard for §4.4's nullability pitfall / §8 property 4.
        let store = SqliteStore::open_memory().unwrap();
        let now = Utc::now();
        store
            .upsert_agent("k8s-a", Platform::Kubernetes, None, &capacity(), "hash1", now)
            .unwrap();
        let cmd = store
            .create_command_with_session_transition(
                "k8s-a",
                None,
                Action::StartSession,
                None,
                None,
                now,
            )
            .unwrap();
        assert!(cmd.error_message.is_none());

        let claimed = store.claim_pending_commands("k8s-a", 10, now).unwrap();
        assert_eq!(claimed.len(), 1);
        assert_eq!(claimed[0].command_id, cmd.command_id);
        assert!(claimed[0].error_message.is_none());

        // A second claim attempt must not return it again.
        let claimed_again = store.claim_pending_commands("k8s-a", 10, now).unwrap();
        assert!(claimed_again.is_empty());
    }

    #[test]
    fn cas_command_status_rejects_unexpected_current_state() {
        let store = SqliteStore::open_memory().unwrap();
        let now = Utc::now();
        store
            .upsert_agent("k8s-a", Platform::Kubernetes, None, &capacity(), "hash1", now)
            .unwrap();
        let cmd = store
            .create_command_with_session_transition(
                "k8s-a",
                None,
                Action::StartSession,
                None,
                None,
                now,
            )
            .unwrap();
        let err = store
            .cas_command_status(
                &cmd.command_id,
                CommandStatus::Sent,
                CommandStatus::Ack,
                None,
                None,
                now,
            )
            .unwrap_err();
        assert!(matches!(err, StoreError::StaleWrite(_)));
    }

    #[test]
    fn cas_command_status_sent_to_ack_round_trip() {
        let store = SqliteStore::open_memory().unwrap();
        let now = Utc::now();
        store
            .upsert_agent("k8s-a", Platform::Kubernetes, None, &capacity(), "hash1", now)
            .unwrap();
        let cmd = store
            .create_command_with_session_transition(
                "k8s-a",
                None,
                Action::StartSession,
                None,
                None,
                now,
            )
            .unwrap();
        store.claim_pending_commands("k8s-a", 10, now).unwrap();
        let acked = store
            .cas_command_status(
                &cmd.command_id,
                CommandStatus::Sent,
                CommandStatus::Ack,
                None,
                None,
                now,
            )
            .unwrap();
        assert_eq!(acked.status, CommandStatus::Ack);
    }

    #[test]
    fn failed_command_carries_error_message() {
        let store = SqliteStore::open_memory().unwrap();
        let now = Utc::now();
        store
            .upsert_agent("k8s-a", Platform::Kubernetes, None, &capacity(), "hash1", now)
            .unwrap();
        let cmd = store
            .create_command_with_session_transition(
                "k8s-a",
                None,
                Action::StartSession,
                None,
                None,
                now,
            )
            .unwrap();
        store.claim_pending_commands("k8s-a", 10, now).unwrap();
        let failed = store
            .cas_command_status(
                &cmd.command_id,
                CommandStatus::Sent,
                CommandStatus::Failed,
                Some("image pull failed"),
                None,
                now,
            )
            .unwrap();
        assert_eq!(failed.error_message.as_deref(), Some("image pull failed"));
    }

    #[test]
    fn session_round_trip_with_resources() {
        let store = SqliteStore::open_memory().unwrap();
        let now = Utc::now();
        let resources = ResourceSpec {
            cpu: Some("1000m".into()),
            memory: Some("2Gi".into()),
            storage: None,
        };
        let session = store
            .create_session("alice", "firefox", Platform::Kubernetes, &resources, false, "60s", None, now)
            .unwrap();
        let fetched = store.get_session(&session.id).unwrap().unwrap();
        assert_eq!(fetched.observed_state, ObservedState::Pending);
        assert_eq!(fetched.resources.cpu.as_deref(), Some("1000m"));
    }

    #[test]
    fn non_terminal_commands_for_session_excludes_completed() {
        let store = SqliteStore::open_memory().unwrap();
        let now = Utc::now();
        store
            .upsert_agent("k8s-a", Platform::Kubernetes, None, &capacity(), "hash1", now)
            .unwrap();
        let resources = ResourceSpec::default();
        let session = store
            .create_session("alice", "firefox", Platform::Kubernetes, &resources, false, "60s", None, now)
            .unwrap();
        let cmd = store
            .create_command_with_session_transition(
                "k8s-a",
                Some(&session.id),
                Action::StartSession,
                None,
                None,
                now,
            )
            .unwrap();
        assert_eq!(store.list_non_terminal_commands_for_session(&session.id).unwrap().len(), 1);
        store.claim_pending_commands("k8s-a", 10, now).unwrap();
        store
            .cas_command_status(&cmd.command_id, CommandStatus::Sent, CommandStatus::Ack, None, None, now)
            .unwrap();
        store
            .cas_command_status(&cmd.command_id, CommandStatus::Ack, CommandStatus::Completed, None, None, now)
            .unwrap();
        assert!(store.list_non_terminal_commands_for_session(&session.id).unwrap().is_empty());
    }

    #[test]
    fn gc_terminated_sessions_respects_retention() {
        let store = SqliteStore::open_memory().unwrap();
        let now = Utc::now();
        let resources = ResourceSpec::default();
        let old = store
            .create_session("alice", "firefox", Platform::Kubernetes, &resources, false, "60s", None, now)
            .unwrap();
        store.set_session_observed_state(&old.id, ObservedState::Terminated, now).unwrap();
        let fresh = store
            .create_session("bob", "firefox", Platform::Kubernetes, &resources, false, "60s", None, now)
            .unwrap();
        store
            .set_session_observed_state(&fresh.id, ObservedState::Terminated, now + chrono::Duration::seconds(10))
            .unwrap();

        let removed = store
            .gc_terminated_sessions_older_than(now + chrono::Duration::seconds(5))
            .unwrap();
        assert_eq!(removed, 1);
        assert!(store.get_session(&old.id).unwrap().is_none());
        assert!(store.get_session(&fresh.id).unwrap().is_some());
    }

    #[test]
    fn connection_lifecycle() {
        let store = SqliteStore::open_memory().unwrap();
        let now = Utc::now();
        let resources = ResourceSpec::default();
        let session = store
            .create_session("alice", "firefox", Platform::Kubernetes, &resources, false, "60s", None, now)
            .unwrap();
        let conn = store.insert_connection(&session.id, "alice", "fp-1", now).unwrap();
        assert_eq!(store.count_live_connections_for_session(&session.id).unwrap(), 1);
        store.delete_connection(&conn.id).unwrap();
        assert_eq!(store.count_live_connections_for_session(&session.id).unwrap(), 0);
    }
}
