//! Core types and trait definitions for the cachesync engine.
//!
//! No runtime, HTTP or database dependencies live here. The crate owns the
//! data model (entity keys, change events, notifications), the relationship
//! registry and change normalization, plus the traits that cache backends,
//! change feeds and the system of record implement.

pub mod backend;
pub mod error;
pub mod event;
pub mod feed;
pub mod ingest;
pub mod key;
pub mod record;
pub mod registry;
pub mod source;

pub use error::{Error, Result};
