pub mod error;
pub mod model;
pub mod schema;
pub mod sqlite;

pub use error::StoreError;
pub use sqlite::SqliteStore;
