//! The §4.3 transition table as a pure function, isolated from Store/Agent
//! I/O so property 1 ("transition safety") can be checked exhaustively
//! without spinning up a database.

use sp_protocol::Action;
use sp_store::model::ObservedState;

/// An event that may advance a session's `observed_state`. Distinct from
/// `sp_protocol::AgentObservedState` — that's what an agent reports on the
/// wire, this is what the state machine consumes after interpreting it
/// (e.g. `ConnectionArrived` has no wire counterpart at all).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event {
    Create,
    CommandSent,
    AgentReachedRunning,
    AgentReachedHibernated,
    AgentReachedTerminated,
    AgentReachedFailed,
    AgentMissingPastGrace,
    UserIntentHibernate,
    UserIntentWake,
    ConnectionArrived,
    UserIntentTerminate,
}

/// Looks up the §4.3 table. Returns `Some((next, emits))` if `(current,
/// event)` is a permitted transition; `emits` is the command action created
/// alongside it, if any.
pub fn lookup(current: ObservedState, event: Event) -> Option<(ObservedState, Option<Action>)> {
    use Event::*;
    use ObservedState::*;

    match (current, event) {
        (Pending, CommandSent) => Some((Creating, None)),
        (Creating, AgentReachedRunning) => Some((Running, None)),
        (Running, UserIntentHibernate) => Some((Hibernating, Some(Action::HibernateSession))),
        (Hibernating, AgentReachedHibernated) => Some((Hibernated, None)),
        (Hibernated, UserIntentWake) | (Hibernated, ConnectionArrived) => {
            Some((Waking, Some(Action::WakeSession)))
        }
        (Waking, AgentReachedRunning) => Some((Running, None)),
        (Terminating, AgentReachedTerminated) | (Terminating, AgentMissingPastGrace) => {
            Some((Terminated, None))
        }
        (Failed, UserIntentTerminate) => Some((Terminating, Some(Action::StopSession))),
        // "any non-terminal ... terminate" / "any ... failed" apply across every
        // remaining non-terminal current state.
        (c, UserIntentTerminate) if !c.is_terminal() && c != Failed => {
            Some((Terminating, Some(Action::StopSession)))
        }
        (c, AgentReachedFailed) if !c.is_terminal() && c != Failed => Some((Failed, None)),
        _ => None,
    }
}

/// The one transition with no prior `current` state — session creation.
pub fn initial_state(event: Event) -> Option<(ObservedState, Option<Action>)> {
    match event {
        Event::Create => Some((ObservedState::Pending, Some(Action::StartSession))),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ObservedState::*;

    #[test]
    fn full_lifecycle_walk() {
        let (s, a) = initial_state(Event::Create).unwrap();
        assert_eq!(s, Pending);
        assert_eq!(a, Some(Action::StartSession));

        let (s, _) = lookup(s, Event::CommandSent).unwrap();
        assert_eq!(s, Creating);
        let (s, _) = lookup(s, Event::AgentReachedRunning).unwrap();
        assert_eq!(s, Running);
        let (s, a) = lookup(s, Event::UserIntentHibernate).unwrap();
        assert_eq!(s, Hibernating);
        assert_eq!(a, Some(Action::HibernateSession));
        let (s, _) = lookup(s, Event::AgentReachedHibernated).unwrap();
        assert_eq!(s, Hibernated);
        let (s, a) = lookup(s, Event::ConnectionArrived).unwrap();
        assert_eq!(s, Waking);
        assert_eq!(a, Some(Action::WakeSession));
        let (s, _) = lookup(s, Event::AgentReachedRunning).unwrap();
        assert_eq!(s, Running);
        let (s, a) = lookup(s, Event::UserIntentTerminate).unwrap();
        assert_eq!(s, Terminating);
        assert_eq!(a, Some(Action::StopSession));
        let (s, _) = lookup(s, Event::AgentReachedTerminated).unwrap();
        assert_eq!(s, Terminated);
    }

    #[test]
    fn failed_from_any_nonterminal_state() {
        for s in [Pending, Creating, Running, Hibernating, Hibernated, Waking, Terminating] {
            let (next, emits) = lookup(s, Event::AgentReachedFailed).unwrap();
            assert_eq!(next, Failed);
            assert_eq!(emits, None);
        }
    }

    #[test]
    fn failed_session_can_only_be_terminated() {
        let (s, a) = lookup(Failed, Event::UserIntentTerminate).unwrap();
        assert_eq!(s, Terminating);
        assert_eq!(a, Some(Action::StopSession));
        assert!(lookup(Failed, Event::AgentReachedRunning).is_none());
        assert!(lookup(Failed, Event::AgentReachedFailed).is_none());
    }

    #[test]
    fn terminal_state_has_no_outgoing_transitions() {
        for event in [
            Event::CommandSent,
            Event::AgentReachedRunning,
            Event::AgentReachedHibernated,
            Event::AgentReachedTerminated,
            Event::AgentReachedFailed,
            Event::AgentMissingPastGrace,
            Event::UserIntentHibernate,
            Event::UserIntentWake,
            Event::ConnectionArrived,
            Event::UserIntentTerminate,
        ] {
            assert!(lookup(Terminated, event).is_none());
        }
    }

    #[test]
    fn disallowed_jump_is_rejected() {
        // Can't go straight from pending to running without creating.
        assert!(lookup(Pending, Event::AgentReachedRunning).is_none());
        // Can't hibernate a session that was never running.
        assert!(lookup(Creating, Event::UserIntentHibernate).is_none());
    }
}
