//! Database access layer.

pub mod postgres;

pub use postgres::{PostgresConfig, PostgresStore};
