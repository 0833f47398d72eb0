pub mod models;
pub mod queries;
pub mod sqlite;

pub use queries::ForeignKey;
pub use sqlite::Database;
