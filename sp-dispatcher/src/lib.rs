pub mod backoff;
pub mod dispatcher;
pub mod error;

pub use dispatcher::CommandDispatcher;
pub use error::DispatchError;
