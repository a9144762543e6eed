//! Persistence layer: libSQL-backed storage for queue records and settings.

#[cfg(test)]
pub mod faulty;
pub mod libsql_backend;
pub mod migrations;
pub mod traits;

pub use libsql_backend::LibSqlBackend;
pub use traits::Database;
