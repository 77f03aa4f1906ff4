//! Database module for PostgreSQL connection and operations
//!
//! The agent talks to the database through the `Database`/`Connection` traits so
//! the executor and schema loader can be exercised without a live server.

pub mod connection;
pub mod row;

pub use connection::{Connection, Database, PgDatabase};
pub use row::Row;
