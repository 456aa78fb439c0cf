use std::sync::Arc;

use sp_common::{AppError, Clock};
use sp_protocol::{Action, AgentObservedState, ResourceSpec, TemplateManifest};
use sp_registry::AgentRegistry;
use sp_store::model::{DesiredState, ObservedState, Platform, Session};
use sp_store::SqliteStore;

use crate::error::TransitionError;
use crate::transitions::{self, Event};

/// Drives sessions through the §4.3 lifecycle. Holds handles to the Store
/// and the Agent Registry — never to another component's in-memory
/// structs (§9 "Cyclic references").
pub struct SessionStateMachine {
    store: Arc<SqliteStore>,
    registry: Arc<AgentRegistry>,
    clock: Arc<dyn Clock>,
}

/// What a user wants a session to become, translated at the §6 boundary
/// from `set_desired_state(session_id, state)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DesiredStateRequest {
    Running,
    Hibernated,
    Terminated,
}

impl SessionStateMachine {
    pub fn new(store: Arc<SqliteStore>, registry: Arc<AgentRegistry>, clock: Arc<dyn Clock>) -> Self {
        Self { store, registry, clock }
    }

    #[allow(clippy::too_many_arguments)]
    pub fn create_session(
        &self,
        user_id: &str,
        template_id: &str,
        platform: Platform,
        manifest: &TemplateManifest,
        idle_timeout: &str,
        max_duration: Option<&str>,
    ) -> Result<Session, TransitionError> {
        let now = self.clock.now();
        let resources = ResourceSpec {
            cpu: manifest.resources.cpu.clone(),
            memory: manifest.resources.memory.clone(),
            storage: manifest.resources.storage.clone(),
        };
        let session = self.store.create_session(
            user_id,
            template_id,
            platform,
            &resources,
            manifest.persistent_home,
            idle_timeout,
            max_duration,
            now,
        )?;

        let (_, emits) = transitions::initial_state(Event::Create)
            .expect("Event::Create always yields a transition");
        let action = emits.expect("session creation always emits start_session");

        let agent = self
            .registry
            .select_agent(platform, None)
            .map_err(|e| TransitionError::Store(sp_store::StoreError::NotFound(e.to_string())))?
            .ok_or(TransitionError::NoEligibleAgent(platform))?;

        self.store
            .set_session_assigned_agent(&session.id, &agent.agent_id, now)?;

        let payload = serde_json::to_value(manifest)
            .map_err(|e| TransitionError::Store(sp_store::StoreError::Serialization(e)))?;
        self.store.create_command_with_session_transition(
            &agent.agent_id,
            Some(&session.id),
            action,
            Some(&payload),
            None,
            now,
        )?;

        self.store
            .get_session(&session.id)?
            .ok_or_else(|| TransitionError::NotFound(session.id.clone()))
    }

    /// Called by the Dispatcher once a `start_session` (or any first
    /// command) has actually been handed to the Gateway (§4.3 `pending ->
    /// creating` on `command_sent`).
    pub fn on_command_sent(&self, session_id: &str) -> Result<(), TransitionError> {
        self.apply_event(session_id, Event::CommandSent).map(|_| ())
    }

    pub fn get_session(&self, session_id: &str) -> Result<Session, TransitionError> {
        self.store
            .get_session(session_id)?
            .ok_or_else(|| TransitionError::NotFound(session_id.to_string()))
    }

    pub fn list_sessions_for_user(&self, user_id: &str) -> Result<Vec<Session>, TransitionError> {
        Ok(self.store.list_sessions_for_user(user_id)?)
    }

    /// §6 `set_desired_state(session_id, state)`. Translates the desired
    /// value into the matching user-intent event given the session's
    /// current `observed_state`; a combination with no defined transition
    /// (e.g. requesting `running` on a session still `creating`) just
    /// updates `desired_state` without an observed-state change — the
    /// Reconciler's drift pass will act on it later if needed.
    pub fn set_desired_state(
        &self,
        session_id: &str,
        desired: DesiredStateRequest,
    ) -> Result<Session, TransitionError> {
        let now = self.clock.now();
        let session = self.get_session(session_id)?;

        let desired_state = match desired {
            DesiredStateRequest::Running => DesiredState::Running,
            DesiredStateRequest::Hibernated => DesiredState::Hibernated,
            DesiredStateRequest::Terminated => DesiredState::Terminated,
        };
        self.store.set_session_desired_state(session_id, desired_state, now)?;

        let event = match (desired, session.observed_state) {
            (DesiredStateRequest::Hibernated, ObservedState::Running) => {
                Some(Event::UserIntentHibernate)
            }
            (DesiredStateRequest::Running, ObservedState::Hibernated) => Some(Event::UserIntentWake),
            (DesiredStateRequest::Terminated, s) if !s.is_terminal() => Some(Event::UserIntentTerminate),
            _ => None,
        };

        match event {
            Some(event) => self.apply_event(session_id, event),
            None => Ok(session),
        }
    }

    /// Connection Tracker hook: a user connected to a hibernated session
    /// (§4.5 `on_connect`, §8 property 7 "auto-wake on connect").
    pub fn on_connection_arrived(&self, session_id: &str) -> Result<Session, TransitionError> {
        let session = self.get_session(session_id)?;
        if session.observed_state == ObservedState::Hibernated {
            self.apply_event(session_id, Event::ConnectionArrived)
        } else {
            Ok(session)
        }
    }

    /// Connection Tracker hook: idle timeout elapsed with zero live
    /// connections (§4.5, §8 property 8).
    pub fn request_idle_hibernate(&self, session_id: &str) -> Result<Session, TransitionError> {
        self.apply_event(session_id, Event::UserIntentHibernate)
    }

    /// Reconciler hook: close a desired-vs-observed drift toward
    /// `terminated` (§4.6.4) without going through `set_desired_state`
    /// again (desired is already `terminated`).
    pub fn request_drift_terminate(&self, session_id: &str) -> Result<Session, TransitionError> {
        self.apply_event(session_id, Event::UserIntentTerminate)
    }

    /// Agent Protocol hook: an unsolicited `session_status` frame (§4.7)
    /// drives the state machine independently of any in-flight command.
    /// Returns `Ok(None)` for a report that doesn't match any transition
    /// from the session's current state — out-of-order or stale reports
    /// are tolerated, not errors (§5).
    pub fn apply_agent_observed_state(
        &self,
        session_id: &str,
        reported: AgentObservedState,
    ) -> Result<Option<Session>, TransitionError> {
        let event = match reported {
            AgentObservedState::Running => Event::AgentReachedRunning,
            AgentObservedState::Hibernated => Event::AgentReachedHibernated,
            AgentObservedState::Terminated => Event::AgentReachedTerminated,
            AgentObservedState::Failed => Event::AgentReachedFailed,
            // Creating/Hibernating/Waking/Terminating are intermediate reports
            // with no corresponding transition of their own — they confirm
            // the control plane's own prior transition, nothing more.
            AgentObservedState::Creating
            | AgentObservedState::Hibernating
            | AgentObservedState::Waking
            | AgentObservedState::Terminating => return Ok(None),
        };

        let current = self.get_session(session_id)?.observed_state;
        if transitions::lookup(current, event).is_none() {
            return Ok(None);
        }
        self.apply_event(session_id, event).map(Some)
    }

    /// Reconciler hook: an assigned agent has been unreachable past its
    /// offline grace period while this session is terminating (§4.6.2 is
    /// the *failed*-marking path; this is the narrower §4.3 terminating ->
    /// terminated edge for "agent missing").
    pub fn agent_missing_past_grace(&self, session_id: &str) -> Result<Option<Session>, TransitionError> {
        let current = self.get_session(session_id)?.observed_state;
        if transitions::lookup(current, Event::AgentMissingPastGrace).is_none() {
            return Ok(None);
        }
        self.apply_event(session_id, Event::AgentMissingPastGrace).map(Some)
    }

    fn apply_event(&self, session_id: &str, event: Event) -> Result<Session, TransitionError> {
        let now = self.clock.now();
        let session = self.get_session(session_id)?;
        let (next, emits) = transitions::lookup(session.observed_state, event).ok_or_else(|| {
            TransitionError::InvalidTransition {
                current: session.observed_state,
                event: format!("{event:?}"),
            }
        })?;

        if let Some(action) = emits {
            self.reject_if_conflicting_command_in_flight(session_id, action)?;
            let agent_id = session
                .assigned_agent_id
                .clone()
                .ok_or_else(|| TransitionError::NoEligibleAgent(session.platform))?;
            self.store.create_command_with_session_transition(
                &agent_id,
                Some(session_id),
                action,
                None,
                Some((session_id, next)),
                now,
            )?;
        } else {
            self.store.set_session_observed_state(session_id, next, now)?;
        }

        self.get_session(session_id)
    }

    fn reject_if_conflicting_command_in_flight(
        &self,
        session_id: &str,
        action: Action,
    ) -> Result<(), TransitionError> {
        let in_flight = self.store.list_non_terminal_commands_for_session(session_id)?;
        if in_flight.iter().any(|c| c.action == action) {
            return Err(TransitionError::CommandInFlight(session_id.to_string()));
        }
        Ok(())
    }
}
