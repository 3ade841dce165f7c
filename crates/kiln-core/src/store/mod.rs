//! Durable task store backends.
//!
//! One backend exists today: sqlite via `sqlx`. The store owns every task
//! row; the queue only mirrors the pending subset.

pub mod sqlite;

pub use sqlite::SqliteTaskStore;
