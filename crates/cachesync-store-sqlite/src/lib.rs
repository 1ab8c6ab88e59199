//! SQLite backend for the cachesync key-value store.
//!
//! Wraps [`tokio_rusqlite`] so all database access runs on a dedicated thread
//! without blocking the async runtime. Plain keys and sets live in two
//! tables; every trait method is a single statement, so each call is atomic
//! on its own.

mod schema;
mod store;

pub mod error;

pub use error::{Error, Result};
pub use store::SqliteBackend;

#[cfg(test)]
mod tests;
