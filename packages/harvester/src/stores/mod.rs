//! Storage implementations.

pub mod sqlite;

pub use sqlite::{BatchOutcome, Holder, SqliteStore};
