pub mod error;
pub mod machine;
pub mod transitions;

pub use error::TransitionError;
pub use machine::{DesiredStateRequest, SessionStateMachine};
pub use transitions::Event;
