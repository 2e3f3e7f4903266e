//! Persistence layer — libSQL-backed async storage kernel.

pub mod libsql_backend;
pub mod migrations;
pub mod traits;

pub use libsql_backend::LibSqlBackend;
pub use traits::{AskWithAnswer, JobFilter, Storage};
