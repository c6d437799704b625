//! Persistence layer: libSQL-backed storage for messages, audit trails,
//! scoring history, the research cache, and poll cursors.

pub mod libsql_backend;
pub mod migrations;
pub mod traits;

pub use libsql_backend::LibSqlBackend;
pub use traits::*;
