use std::sync::Arc;

use tracing::info;

use sp_common::events::{ReconcilerRepairEvent, ReconcilerRepairKind};
use sp_common::{Clock, ControlPlaneConfig, EventBus};
use sp_connections::ConnectionTracker;
use sp_dispatcher::dispatcher::has_non_terminal_action;
use sp_dispatcher::CommandDispatcher;
use sp_protocol::{Action, AgentObservedState};
use sp_sessions::SessionStateMachine;
use sp_store::model::{DesiredState, ObservedState};
use sp_store::SqliteStore;

use crate::error::ReconcileError;

/// Runs the §4.6 passes, on startup and then on `reconciler_interval_seconds`
/// cadence. Every pass is read-mostly against the Store and idempotent —
/// running it twice in a row does no additional harm, which is what makes it
/// safe to also run once eagerly at startup before the first timer tick.
pub struct Reconciler {
    store: Arc<SqliteStore>,
    sessions: Arc<SessionStateMachine>,
    dispatcher: Arc<CommandDispatcher>,
    connections: Arc<ConnectionTracker>,
    events: Arc<EventBus>,
    clock: Arc<dyn Clock>,
    config: Arc<ControlPlaneConfig>,
}

/// Tally of repairs made in one pass, logged and returned for tests.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ReconcileReport {
    pub commands_recovered: usize,
    pub sessions_marked_failed: usize,
    pub stale_connections_removed: usize,
    pub sessions_gced: u64,
    pub commands_gced: u64,
    pub drift_stops_emitted: usize,
}

impl Reconciler {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<SqliteStore>,
        sessions: Arc<SessionStateMachine>,
        dispatcher: Arc<CommandDispatcher>,
        connections: Arc<ConnectionTracker>,
        events: Arc<EventBus>,
        clock: Arc<dyn Clock>,
        config: Arc<ControlPlaneConfig>,
    ) -> Self {
        Self { store, sessions, dispatcher, connections, events, clock, config }
    }

    pub fn run_once(&self) -> Result<ReconcileReport, ReconcileError> {
        let commands_recovered = self.recover_stale_commands()?;
        let sessions_marked_failed = self.resync_offline_agents()?;
        let stale_connections_removed = self.remove_orphan_connections()?;
        let (sessions_gced, commands_gced) = self.garbage_collect()?;
        let drift_stops_emitted = self.close_drift()?;

        let report = ReconcileReport {
            commands_recovered,
            sessions_marked_failed,
            stale_connections_removed,
            sessions_gced,
            commands_gced,
            drift_stops_emitted,
        };
        info!(?report, "reconciler pass complete");
        Ok(report)
    }

    /// §4.6.1 command recovery.
    fn recover_stale_commands(&self) -> Result<usize, ReconcileError> {
        let visibility_timeout =
            chrono::Duration::seconds(self.config.send_visibility_timeout_seconds as i64);
        let n = self.dispatcher.recover_stale_sent_commands(visibility_timeout)?;
        if n > 0 {
            let _ = self.events.reconciler_repair.send(ReconcilerRepairEvent {
                kind: ReconcilerRepairKind::CommandRequeued,
                subject_id: "batch".to_string(),
                detail: format!("{n} stale sent command(s) requeued"),
            });
        }
        Ok(n)
    }

    /// §4.6.2 state resynchronisation: sessions whose assigned agent has
    /// been unreachable past `agent_offline_grace` are marked `failed`
    /// outright — the state machine emits no command, user intent (a
    /// subsequent `set_desired_state(terminated)`) drives recovery from there.
    fn resync_offline_agents(&self) -> Result<usize, ReconcileError> {
        let grace = chrono::Duration::seconds(self.config.agent_offline_grace_seconds as i64);
        let now = self.clock.now();
        let mut marked = 0;

        for session in self.store.list_non_terminal_sessions()? {
            if session.observed_state.is_terminal() {
                continue;
            }
            let Some(agent_id) = &session.assigned_agent_id else {
                continue;
            };
            let Some(agent) = self.store.get_agent_by_agent_id(agent_id)? else {
                continue;
            };
            let overdue = match agent.last_heartbeat {
                Some(hb) => now - hb >= grace,
                None => now - agent.created_at >= grace,
            };
            if !overdue {
                continue;
            }
            if self
                .sessions
                .apply_agent_observed_state(&session.id, AgentObservedState::Failed)?
                .is_some()
            {
                marked += 1;
                let _ = self.events.reconciler_repair.send(ReconcilerRepairEvent {
                    kind: ReconcilerRepairKind::SessionMarkedFailed,
                    subject_id: session.id.clone(),
                    detail: format!("assigned agent {agent_id} offline past grace"),
                });
            }
        }
        Ok(marked)
    }

    /// §4.6.3 orphan GC: stale connections (delegated to the Connection
    /// Tracker, which owns that sweep) plus terminated sessions and terminal
    /// commands past retention.
    fn remove_orphan_connections(&self) -> Result<usize, ReconcileError> {
        let threshold = self.clock.now() - self.config.connection_staleness_threshold();
        let removed = self.connections.sweep_stale_connections(threshold)?;
        if removed > 0 {
            let _ = self.events.reconciler_repair.send(ReconcilerRepairEvent {
                kind: ReconcilerRepairKind::OrphanConnectionRemoved,
                subject_id: "batch".to_string(),
                detail: format!("{removed} stale connection(s) removed"),
            });
        }
        Ok(removed)
    }

    fn garbage_collect(&self) -> Result<(u64, u64), ReconcileError> {
        let now = self.clock.now();
        let session_horizon = now - chrono::Duration::seconds(self.config.session_retention_seconds as i64);
        let command_horizon = now - chrono::Duration::seconds(self.config.command_retention_seconds as i64);

        let sessions_gced = self.store.gc_terminated_sessions_older_than(session_horizon)?;
        let commands_gced = self.store.gc_terminal_commands_older_than(command_horizon)?;
        if sessions_gced > 0 || commands_gced > 0 {
            let _ = self.events.reconciler_repair.send(ReconcilerRepairEvent {
                kind: ReconcilerRepairKind::StaleCommandGarbageCollected,
                subject_id: "batch".to_string(),
                detail: format!("{sessions_gced} session(s), {commands_gced} command(s) gc'd"),
            });
        }
        Ok((sessions_gced, commands_gced))
    }

    /// §4.6.4 desired-vs-observed drift: a session wants to be terminated
    /// but nothing has started closing it out yet.
    fn close_drift(&self) -> Result<usize, ReconcileError> {
        let mut emitted = 0;
        for session in self.store.list_non_terminal_sessions()? {
            if session.desired_state != DesiredState::Terminated {
                continue;
            }
            if matches!(session.observed_state, ObservedState::Terminating | ObservedState::Terminated) {
                continue;
            }
            let in_flight = self.store.list_non_terminal_commands_for_session(&session.id)?;
            if has_non_terminal_action(&in_flight, Action::StopSession) {
                continue;
            }
            self.sessions.request_drift_terminate(&session.id)?;
            emitted += 1;
            let _ = self.events.reconciler_repair.send(ReconcilerRepairEvent {
                kind: ReconcilerRepairKind::DriftStopEmitted,
                subject_id: session.id.clone(),
                detail: "desired=terminated but no stop_session in flight".to_string(),
            });
        }
        Ok(emitted)
    }
}
