use std::sync::Arc;

use tracing::{info, warn};

use sp_common::Clock;
use sp_store::model::{Connection, ObservedState};
use sp_store::SqliteStore;
use sp_sessions::SessionStateMachine;

use crate::duration;
use crate::error::ConnectionError;

/// Connection Tracker (§4.5). Live connections are durable rows, not
/// in-memory state — a control-plane restart doesn't lose track of who was
/// connected, only the staleness sweep has to rediscover who's gone quiet.
pub struct ConnectionTracker {
    store: Arc<SqliteStore>,
    sessions: Arc<SessionStateMachine>,
    clock: Arc<dyn Clock>,
}

impl ConnectionTracker {
    pub fn new(store: Arc<SqliteStore>, sessions: Arc<SessionStateMachine>, clock: Arc<dyn Clock>) -> Self {
        Self { store, sessions, clock }
    }

    /// §4.5 `on_connect`. Auto-wakes a hibernated session.
    pub fn on_connect(
        &self,
        session_id: &str,
        user_id: &str,
        client_fp: &str,
    ) -> Result<Connection, ConnectionError> {
        let now = self.clock.now();
        let connection = self.store.insert_connection(session_id, user_id, client_fp, now)?;
        self.sessions.on_connection_arrived(session_id)?;
        info!(session_id, connection_id = %connection.id, "connection opened");
        Ok(connection)
    }

    pub fn on_heartbeat(&self, connection_id: &str) -> Result<(), ConnectionError> {
        let now = self.clock.now();
        let connection = self
            .store
            .get_connection(connection_id)?
            .ok_or_else(|| ConnectionError::NotFound(connection_id.to_string()))?;
        self.store.update_connection_heartbeat(connection_id, now)?;
        self.store.touch_last_activity(&connection.session_id, now)?;
        Ok(())
    }

    /// §4.5 `on_disconnect`. Removes the row, then checks whether this
    /// session is now both connection-less and past its idle timeout —
    /// the common case is it isn't yet, and the periodic sweep picks it up
    /// once it is.
    pub fn on_disconnect(&self, connection_id: &str) -> Result<(), ConnectionError> {
        let connection = self
            .store
            .delete_connection(connection_id)?
            .ok_or_else(|| ConnectionError::NotFound(connection_id.to_string()))?;
        info!(connection_id, session_id = %connection.session_id, "connection closed");
        self.maybe_hibernate_idle(&connection.session_id)?;
        Ok(())
    }

    fn maybe_hibernate_idle(&self, session_id: &str) -> Result<(), ConnectionError> {
        if self.store.count_live_connections_for_session(session_id)? > 0 {
            return Ok(());
        }
        let session = self.sessions.get_session(session_id)?;
        if session.observed_state != ObservedState::Running {
            return Ok(());
        }
        let Some(timeout) = duration::parse(&session.idle_timeout) else {
            warn!(session_id, idle_timeout = %session.idle_timeout, "unparseable idle_timeout, skipping");
            return Ok(());
        };
        if self.clock.now() - session.last_activity >= timeout {
            self.sessions.request_idle_hibernate(session_id)?;
        }
        Ok(())
    }

    /// Periodic staleness sweep (§4.5, default every 30s): drops connections
    /// whose `last_heartbeat` predates `threshold`, then re-checks each
    /// affected session for idle hibernation.
    pub fn sweep_stale_connections(&self, threshold: chrono::DateTime<chrono::Utc>) -> Result<usize, ConnectionError> {
        let stale = self.store.list_stale_connections(threshold)?;
        let mut removed = 0;
        for connection in stale {
            self.store.delete_connection(&connection.id)?;
            warn!(connection_id = %connection.id, session_id = %connection.session_id, "dropped stale connection");
            removed += 1;
            self.maybe_hibernate_idle(&connection.session_id)?;
        }
        Ok(removed)
    }

    /// Idle hibernation pass run at the same cadence as the staleness sweep:
    /// every `running` session with zero live connections and an elapsed
    /// `idle_timeout` transitions to `hibernating`.
    pub fn sweep_idle_sessions(&self) -> Result<Vec<String>, ConnectionError> {
        let mut hibernated = Vec::new();
        for session in self.store.list_running_sessions_with_last_activity()? {
            if self.store.count_live_connections_for_session(&session.id)? > 0 {
                continue;
            }
            let Some(timeout) = duration::parse(&session.idle_timeout) else {
                continue;
            };
            if self.clock.now() - session.last_activity >= timeout {
                self.sessions.request_idle_hibernate(&session.id)?;
                hibernated.push(session.id);
            }
        }
        Ok(hibernated)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sp_common::clock::ManualClock;
    use sp_common::EventBus;
    use sp_protocol::{AgentObservedState, Capacity, ResourceSpec, TemplateManifest};
    use sp_registry::AgentRegistry;
    use sp_store::model::Platform;

    fn setup() -> (ConnectionTracker, Arc<SqliteStore>, Arc<SessionStateMachine>, Arc<ManualClock>) {
        let store = Arc::new(SqliteStore::open_memory().unwrap());
        let events = Arc::new(EventBus::new());
        let clock = ManualClock::new(chrono::Utc::now());
        let registry = Arc::new(AgentRegistry::new(store.clone(), events, clock.clone()));
        registry
            .register_agent("k8s-a", Platform::Kubernetes, None, Capacity { max_sessions: 10, cpu: None, memory: None })
            .unwrap();
        store.bind_agent_websocket("k8s-a", "ws-1", clock.now()).unwrap();
        let sessions = Arc::new(SessionStateMachine::new(store.clone(), registry, clock.clone()));
        let tracker = ConnectionTracker::new(store.clone(), sessions.clone(), clock.clone());
        (tracker, store, sessions, clock)
    }

    fn manifest() -> TemplateManifest {
        TemplateManifest {
            image: "firefox:latest".into(),
            vnc_port: 5900,
            env: Default::default(),
            volume_mounts: vec![],
            resources: ResourceSpec { cpu: None, memory: None, storage: None },
            persistent_home: false,
        }
    }

    fn running_session(sessions: &SessionStateMachine) -> sp_store::model::Session {
        let session = sessions
            .create_session("alice", "firefox", Platform::Kubernetes, &manifest(), "60s", None)
            .unwrap();
        sessions.on_command_sent(&session.id).unwrap();
        sessions
            .apply_agent_observed_state(&session.id, AgentObservedState::Running)
            .unwrap()
            .unwrap()
    }

    #[test]
    fn on_connect_wakes_hibernated_session() {
        let (tracker, store, sessions, clock) = setup();
        let session = running_session(&sessions);
        sessions.set_desired_state(&session.id, sp_sessions::DesiredStateRequest::Hibernated).unwrap();
        store.set_session_observed_state(&session.id, ObservedState::Hibernated, clock.now()).unwrap();

        tracker.on_connect(&session.id, "alice", "fp-1").unwrap();
        let session = sessions.get_session(&session.id).unwrap();
        assert_eq!(session.observed_state, ObservedState::Waking);
    }

    #[test]
    fn on_connect_on_running_session_is_a_no_op_transition() {
        let (tracker, _store, sessions, _clock) = setup();
        let session = running_session(&sessions);
        tracker.on_connect(&session.id, "alice", "fp-1").unwrap();
        let session = sessions.get_session(&session.id).unwrap();
        assert_eq!(session.observed_state, ObservedState::Running);
    }

    #[test]
    fn disconnect_past_idle_timeout_hibernates() {
        let (tracker, store, sessions, clock) = setup();
        let session = running_session(&sessions);
        let connection = tracker.on_connect(&session.id, "alice", "fp-1").unwrap();
        clock.advance(chrono::Duration::seconds(120));
        store.touch_last_activity(&session.id, clock.now() - chrono::Duration::seconds(120)).unwrap();

        tracker.on_disconnect(&connection.id).unwrap();
        let session = sessions.get_session(&session.id).unwrap();
        assert_eq!(session.observed_state, ObservedState::Hibernating);
    }

    #[test]
    fn disconnect_within_idle_timeout_stays_running() {
        let (tracker, _store, sessions, _clock) = setup();
        let session = running_session(&sessions);
        let connection = tracker.on_connect(&session.id, "alice", "fp-1").unwrap();
        tracker.on_disconnect(&connection.id).unwrap();
        let session = sessions.get_session(&session.id).unwrap();
        assert_eq!(session.observed_state, ObservedState::Running);
    }

    #[test]
    fn sweep_stale_connections_removes_and_hibernates() {
        let (tracker, store, sessions, clock) = setup();
        let session = running_session(&sessions);
        tracker.on_connect(&session.id, "alice", "fp-1").unwrap();
        store.touch_last_activity(&session.id, clock.now() - chrono::Duration::seconds(120)).unwrap();
        clock.advance(chrono::Duration::seconds(120));

        let removed = tracker.sweep_stale_connections(clock.now() - chrono::Duration::seconds(60)).unwrap();
        assert_eq!(removed, 1);
        let session = sessions.get_session(&session.id).unwrap();
        assert_eq!(session.observed_state, ObservedState::Hibernating);
    }

    #[test]
    fn sweep_idle_sessions_hibernates_connectionless_running_sessions() {
        let (tracker, store, sessions, clock) = setup();
        let session = running_session(&sessions);
        store.touch_last_activity(&session.id, clock.now() - chrono::Duration::seconds(120)).unwrap();

        let hibernated = tracker.sweep_idle_sessions().unwrap();
        assert_eq!(hibernated, vec![session.id.clone()]);
    }
}
