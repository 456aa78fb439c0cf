pub mod duration;
pub mod error;
pub mod tracker;

pub use error::ConnectionError;
pub use tracker::ConnectionTracker;
