use std::sync::Arc;

use tracing::{info, warn};

use sp_common::{Clock, ControlPlaneConfig, EventBus};
use sp_common::events::CommandStatusEvent;
use sp_protocol::{Action, AgentObservedState, ControlMessage};
use sp_registry::{AgentRegistry, SendOutcome};
use sp_sessions::SessionStateMachine;
use sp_store::model::{AgentCommand, CommandStatus, ObservedState};
use sp_store::SqliteStore;

use crate::backoff;
use crate::error::DispatchError;

/// The Command Dispatcher (§4.4). Guarantees at-least-once delivery with
/// bounded retries and survives control-plane restarts and agent
/// reconnects by reconstructing all in-flight state from the Store — it
/// holds no queue of its own.
pub struct CommandDispatcher {
    store: Arc<SqliteStore>,
    registry: Arc<AgentRegistry>,
    sessions: Arc<SessionStateMachine>,
    events: Arc<EventBus>,
    clock: Arc<dyn Clock>,
    config: Arc<ControlPlaneConfig>,
}

impl CommandDispatcher {
    pub fn new(
        store: Arc<SqliteStore>,
        registry: Arc<AgentRegistry>,
        sessions: Arc<SessionStateMachine>,
        events: Arc<EventBus>,
        clock: Arc<dyn Clock>,
        config: Arc<ControlPlaneConfig>,
    ) -> Self {
        Self { store, registry, sessions, events, clock, config }
    }

    /// One pass of claim-and-send for a single agent (§4.4 steps 2-3). A
    /// worker task calls this in a loop, one per registered agent, or a
    /// shared pool calls it round-robin across agents — either way this
    /// method is the whole unit of work and is safe to call concurrently
    /// for *different* agents, since claiming is scoped per `agent_id`.
    pub async fn dispatch_agent_once(&self, agent_id: &str) -> Result<usize, DispatchError> {
        let now = self.clock.now();
        let in_flight = self.store.list_in_flight_commands_for_agent(agent_id)?.len() as u32;
        let cap = self.config.dispatcher_max_in_flight_per_agent;
        if in_flight >= cap {
            return Ok(0);
        }
        let limit = cap - in_flight;

        // Claim marks the rows `sent` *before* we've attempted to write to
        // the socket — a crash here leaves a command `sent` with no wire
        // evidence; the Reconciler's command-recovery pass repairs it
        // (§4.4 step 2, §4.6.1).
        let claimed = self.store.claim_pending_commands(agent_id, limit, now)?;
        let count = claimed.len();

        for command in claimed {
            self.transmit(agent_id, command).await?;
        }
        Ok(count)
    }

    async fn transmit(&self, agent_id: &str, command: AgentCommand) -> Result<(), DispatchError> {
        let now = self.clock.now();
        let message = ControlMessage::command(
            command.command_id.clone(),
            command.action,
            command.session_id.clone(),
            command.payload.clone().unwrap_or(serde_json::Value::Null),
        );

        match self.registry.send(agent_id, message).await {
            SendOutcome::Delivered => {
                if command.action == Action::StartSession {
                    if let Some(session_id) = &command.session_id {
                        if let Err(e) = self.sessions.on_command_sent(session_id) {
                            warn!(session_id, "on_command_sent failed: {e}");
                        }
                    }
                }
                let _ = self.events.command_status.send(CommandStatusEvent {
                    command_id: command.command_id.clone(),
                    agent_id: agent_id.to_string(),
                    session_id: command.session_id.clone(),
                    action: command.action.as_str().to_string(),
                    status: "sent".to_string(),
                    error_message: None,
                });
                Ok(())
            }
            SendOutcome::NoLiveConnection => {
                self.requeue_or_fail(&command, now).await
            }
        }
    }

    /// No live connection to deliver over (§4.4 step 3). CAS `sent ->
    /// pending` with a backoff-computed `next_retry_at`, unless attempts
    /// are exhausted, in which case the command fails terminally and the
    /// session receives a synthetic failure event (§4.4 "Retry policy").
    async fn requeue_or_fail(
        &self,
        command: &AgentCommand,
        now: chrono::DateTime<chrono::Utc>,
    ) -> Result<(), DispatchError> {
        if command.attempts >= self.config.command_max_attempts as i64 {
            self.fail_command_exhausted(command, now).await
        } else {
            let delay = backoff::compute(
                command.attempts as u32,
                self.config.command_backoff_base_seconds,
                self.config.command_backoff_cap_seconds,
            );
            let next_retry_at = now + delay;
            match self.store.cas_command_status(
                &command.command_id,
                CommandStatus::Sent,
                CommandStatus::Pending,
                None,
                Some(next_retry_at),
                now,
            ) {
                Ok(_) => Ok(()),
                Err(sp_store::StoreError::StaleWrite(msg)) => {
                    warn!(command_id = %command.command_id, "{msg}");
                    Ok(())
                }
                Err(e) => Err(DispatchError::Store(e)),
            }
        }
    }

    async fn fail_command_exhausted(
        &self,
        command: &AgentCommand,
        now: chrono::DateTime<chrono::Utc>,
    ) -> Result<(), DispatchError> {
        let updated = self.store.cas_command_status(
            &command.command_id,
            CommandStatus::Sent,
            CommandStatus::Failed,
            Some("max attempts exhausted"),
            None,
            now,
        );
        match updated {
            Ok(_) | Err(sp_store::StoreError::StaleWrite(_)) => {
                info!(command_id = %command.command_id, "command failed: max attempts exhausted");
                if let Some(session_id) = &command.session_id {
                    if let Err(e) =
                        self.sessions.apply_agent_observed_state(session_id, AgentObservedState::Failed)
                    {
                        warn!(session_id, "failed to apply synthetic failure event: {e}");
                    }
                }
                let _ = self.events.command_status.send(CommandStatusEvent {
                    command_id: command.command_id.clone(),
                    agent_id: command.agent_id.clone(),
                    session_id: command.session_id.clone(),
                    action: command.action.as_str().to_string(),
                    status: "failed".to_string(),
                    error_message: Some("max attempts exhausted".to_string()),
                });
                Ok(())
            }
            Err(e) => Err(DispatchError::Store(e)),
        }
    }

    /// Inbound `command_ack` (§4.4 step 4). A duplicate ack for an
    /// already-acked or already-terminal command is a no-op, not an error
    /// (§8 property 3 idempotence).
    pub fn handle_ack(&self, command_id: &str) -> Result<(), DispatchError> {
        let command = self
            .store
            .get_command_by_command_id(command_id)?
            .ok_or_else(|| DispatchError::CommandNotFound(command_id.to_string()))?;
        if command.status != CommandStatus::Sent {
            return Ok(());
        }
        match self.store.cas_command_status(
            command_id,
            CommandStatus::Sent,
            CommandStatus::Ack,
            None,
            None,
            self.clock.now(),
        ) {
            Ok(_) => Ok(()),
            Err(sp_store::StoreError::StaleWrite(_)) => Ok(()),
            Err(e) => Err(DispatchError::Store(e)),
        }
    }

    /// Inbound `command_result` (§4.4 step 5, §8 property 6 reconnect
    /// replay / idempotence). Terminal for the command either way; on
    /// failure the owning session is driven straight to `failed` (§8
    /// scenario S5) rather than waiting for a `session_status` frame.
    pub fn handle_result(
        &self,
        command_id: &str,
        success: bool,
        error: Option<&str>,
    ) -> Result<(), DispatchError> {
        let command = self
            .store
            .get_command_by_command_id(command_id)?
            .ok_or_else(|| DispatchError::CommandNotFound(command_id.to_string()))?;
        if command.status.is_terminal() {
            // Replayed result for a command we've already resolved — the
            // agent is allowed to resend it (§4.7 idempotency contract).
            return Ok(());
        }

        let (expected, new, msg) = if success {
            (command.status, CommandStatus::Completed, None)
        } else {
            (command.status, CommandStatus::Failed, error)
        };

        match self.store.cas_command_status(command_id, expected, new, msg, None, self.clock.now()) {
            Ok(_) => {}
            Err(sp_store::StoreError::StaleWrite(_)) => return Ok(()),
            Err(e) => return Err(DispatchError::Store(e)),
        }

        let _ = self.events.command_status.send(CommandStatusEvent {
            command_id: command_id.to_string(),
            agent_id: command.agent_id.clone(),
            session_id: command.session_id.clone(),
            action: command.action.as_str().to_string(),
            status: new.as_str().to_string(),
            error_message: msg.map(str::to_string),
        });

        if !success {
            if let Some(session_id) = &command.session_id {
                if let Err(e) =
                    self.sessions.apply_agent_observed_state(session_id, AgentObservedState::Failed)
                {
                    warn!(session_id, "failed to apply agent failure to session: {e}");
                }
            }
        }
        Ok(())
    }

    /// Reconnect replay (§4.4 "Reconnect replay", §8 property 6): resend
    /// everything still `sent`/`ack` for this agent. The agent deduplicates
    /// by `command_id`.
    pub async fn replay_in_flight(&self, agent_id: &str) -> Result<usize, DispatchError> {
        let commands = self.store.list_in_flight_commands_for_agent(agent_id)?;
        let count = commands.len();
        for command in commands {
            let message = ControlMessage::command(
                command.command_id.clone(),
                command.action,
                command.session_id.clone(),
                command.payload.clone().unwrap_or(serde_json::Value::Null),
            );
            let _ = self.registry.send(agent_id, message).await;
        }
        Ok(count)
    }

    /// Reconciler hook (§4.6.1 command recovery): commands stuck `sent`
    /// past the visibility timeout with no live connection, or whose
    /// `next_retry_at` has already passed, go back to `pending`.
    pub fn recover_stale_sent_commands(
        &self,
        visibility_timeout: chrono::Duration,
    ) -> Result<usize, DispatchError> {
        let now = self.clock.now();
        let threshold = now - visibility_timeout;
        let stale = self.store.list_stale_sent_commands(threshold)?;
        let mut recovered = 0;
        for command in stale {
            // Re-checking liveness here would require an async call into
            // the registry; `dispatch_agent_once`'s next pass will no-op
            // on an agent that's actually still connected via `send`'s
            // own Delivered/NoLiveConnection distinction, so recovering
            // unconditionally here is safe — worst case is one redundant
            // claim-and-send cycle.
            match self.store.cas_command_status(
                &command.command_id,
                CommandStatus::Sent,
                CommandStatus::Pending,
                None,
                None,
                now,
            ) {
                Ok(_) => recovered += 1,
                Err(sp_store::StoreError::StaleWrite(_)) => {}
                Err(e) => return Err(DispatchError::Store(e)),
            }
        }
        Ok(recovered)
    }
}

/// Used by the reconciler's drift pass to decide whether a stop command is
/// still missing for a terminating-desired session (§4.6.4).
pub fn has_non_terminal_action(
    commands: &[AgentCommand],
    action: Action,
) -> bool {
    commands.iter().any(|c| c.action == action && !c.status.is_terminal())
}

pub fn session_needs_stop(observed: ObservedState) -> bool {
    !matches!(observed, ObservedState::Terminating | ObservedState::Terminated)
}

#[cfg(test)]
mod tests {
    use super::*;
    use sp_common::clock::ManualClock;
    use sp_protocol::{Capacity, ResourceSpec, TemplateManifest};
    use sp_store::model::Platform;
    use tokio::sync::mpsc;

    fn setup() -> (CommandDispatcher, Arc<SqliteStore>, Arc<AgentRegistry>, Arc<SessionStateMachine>, Arc<ManualClock>) {
        let store = Arc::new(SqliteStore::open_memory().unwrap());
        let events = Arc::new(EventBus::new());
        let clock = ManualClock::new(chrono::Utc::now());
        let registry = Arc::new(AgentRegistry::new(store.clone(), events.clone(), clock.clone()));
        let sessions = Arc::new(SessionStateMachine::new(store.clone(), registry.clone(), clock.clone()));
        let config = Arc::new(ControlPlaneConfig::default());
        let dispatcher = CommandDispatcher::new(
            store.clone(),
            registry.clone(),
            sessions.clone(),
            events,
            clock.clone(),
            config,
        );
        (dispatcher, store, registry, sessions, clock)
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

    #[tokio::test]
    async fn dispatch_with_no_live_connection_requeues_with_backoff() {
        let (dispatcher, store, registry, sessions, clock) = setup();
        registry
            .register_agent("k8s-a", Platform::Kubernetes, None, Capacity { max_sessions: 5, cpu: None, memory: None })
            .unwrap();
        store.bind_agent_websocket("k8s-a", "ws-1", clock.now()).unwrap();
        let session = sessions
            .create_session("alice", "firefox", Platform::Kubernetes, &manifest(), "60s", None)
            .unwrap();

        // No tx registered via on_agent_connected, so send() always reports NoLiveConnection.
        let n = dispatcher.dispatch_agent_once("k8s-a").await.unwrap();
        assert_eq!(n, 1);

        let commands = store.list_non_terminal_commands_for_session(&session.id).unwrap();
        assert_eq!(commands.len(), 1);
        assert_eq!(commands[0].status, CommandStatus::Pending);
        assert!(commands[0].next_retry_at.is_some());
        assert_eq!(commands[0].attempts, 1);
    }

    #[tokio::test]
    async fn dispatch_delivers_when_connected_and_advances_session() {
        let (dispatcher, store, registry, sessions, clock) = setup();
        registry
            .register_agent("k8s-a", Platform::Kubernetes, None, Capacity { max_sessions: 5, cpu: None, memory: None })
            .unwrap();
        store.bind_agent_websocket("k8s-a", "ws-1", clock.now()).unwrap();
        let (tx, mut rx) = mpsc::channel(8);
        registry.on_agent_connected("k8s-a", tx).await.unwrap();

        let session = sessions
            .create_session("alice", "firefox", Platform::Kubernetes, &manifest(), "60s", None)
            .unwrap();

        let n = dispatcher.dispatch_agent_once("k8s-a").await.unwrap();
        assert_eq!(n, 1);
        assert!(rx.try_recv().is_ok());

        let updated = sessions.get_session(&session.id).unwrap();
        assert_eq!(updated.observed_state, ObservedState::Creating);

        let commands = store.list_non_terminal_commands_for_session(&session.id).unwrap();
        assert_eq!(commands[0].status, CommandStatus::Sent);
    }

    #[tokio::test]
    async fn command_result_failure_marks_session_failed() {
        let (dispatcher, store, registry, sessions, clock) = setup();
        registry
            .register_agent("k8s-a", Platform::Kubernetes, None, Capacity { max_sessions: 5, cpu: None, memory: None })
            .unwrap();
        store.bind_agent_websocket("k8s-a", "ws-1", clock.now()).unwrap();
        let (tx, _rx) = mpsc::channel(8);
        registry.on_agent_connected("k8s-a", tx).await.unwrap();

        let session = sessions
            .create_session("alice", "firefox", Platform::Kubernetes, &manifest(), "60s", None)
            .unwrap();
        dispatcher.dispatch_agent_once("k8s-a").await.unwrap();

        let command_id = store
            .list_non_terminal_commands_for_session(&session.id)
            .unwrap()[0]
            .command_id
            .clone();
        dispatcher.handle_ack(&command_id).unwrap();
        dispatcher.handle_result(&command_id, false, Some("image pull failed")).unwrap();

        let cmd = store.get_command_by_command_id(&command_id).unwrap().unwrap();
        assert_eq!(cmd.status, CommandStatus::Failed);
        assert_eq!(cmd.error_message.as_deref(), Some("image pull failed"));

        let session = sessions.get_session(&session.id).unwrap();
        assert_eq!(session.observed_state, ObservedState::Failed);
    }

    #[tokio::test]
    async fn duplicate_result_is_idempotent() {
        let (dispatcher, store, registry, sessions, clock) = setup();
        registry
            .register_agent("k8s-a", Platform::Kubernetes, None, Capacity { max_sessions: 5, cpu: None, memory: None })
            .unwrap();
        store.bind_agent_websocket("k8s-a", "ws-1", clock.now()).unwrap();
        let (tx, _rx) = mpsc::channel(8);
        registry.on_agent_connected("k8s-a", tx).await.unwrap();
        let session = sessions
            .create_session("alice", "firefox", Platform::Kubernetes, &manifest(), "60s", None)
            .unwrap();
        dispatcher.dispatch_agent_once("k8s-a").await.unwrap();
        let command_id = store
            .list_non_terminal_commands_for_session(&session.id)
            .unwrap()[0]
            .command_id
            .clone();
        dispatcher.handle_ack(&command_id).unwrap();
        dispatcher.handle_result(&command_id, true, None).unwrap();
        // Replayed result must not error or change anything.
        dispatcher.handle_result(&command_id, true, None).unwrap();
        let cmd = store.get_command_by_command_id(&command_id).unwrap().unwrap();
        assert_eq!(cmd.status, CommandStatus::Completed);
    }

    #[tokio::test]
    async fn reconnect_replay_resends_in_flight_commands() {
        let (dispatcher, store, registry, sessions, clock) = setup();
        registry
            .register_agent("k8s-a", Platform::Kubernetes, None, Capacity { max_sessions: 5, cpu: None, memory: None })
            .unwrap();
        store.bind_agent_websocket("k8s-a", "ws-1", clock.now()).unwrap();
        let (tx, mut rx) = mpsc::channel(8);
        registry.on_agent_connected("k8s-a", tx).await.unwrap();
        sessions
            .create_session("alice", "firefox", Platform::Kubernetes, &manifest(), "60s", None)
            .unwrap();
        dispatcher.dispatch_agent_once("k8s-a").await.unwrap();
        let _ = rx.try_recv();

        let n = dispatcher.replay_in_flight("k8s-a").await.unwrap();
        assert_eq!(n, 1);
        assert!(rx.try_recv().is_ok());
    }
}
