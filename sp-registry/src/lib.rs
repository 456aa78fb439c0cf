pub mod state;
pub mod types;

pub use state::AgentRegistry;
pub use types::{ConnectOutcome, RegisteredAgent, SendOutcome};
