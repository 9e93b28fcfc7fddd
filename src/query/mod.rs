//! Native statement builders.
//!
//! Pure string and document builders for the query languages behind each
//! backend: SQL (SQL Server and `SQLite` dialects), Couchbase N1QL and
//! `MongoDB` commands. Drivers use them to talk to the server; the in-memory
//! driver uses them to log the statement a real server would receive.

pub mod mongo;
pub mod n1ql;
pub mod sql;

pub use sql::SqlDialect;
