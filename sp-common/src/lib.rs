pub mod clock;
pub mod config;
pub mod error;
pub mod events;

pub use clock::{Clock, SystemClock};
pub use config::ControlPlaneConfig;
pub use error::AppError;
pub use events::EventBus;
