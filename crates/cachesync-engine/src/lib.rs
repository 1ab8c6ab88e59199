//! The cachesync engine: applies normalized change events to the entity
//! cache and its relationship indexes, computes cascades, and fans
//! notifications out to observers.
//!
//! ```text
//! feed ─► ingest lane ─► worker lane (by key) ─► cache + indexes
//!                                              └► cascade ─► event bus ─► observers
//! ```

pub mod bus;
pub mod cache;
pub mod cascade;
pub mod config;
pub mod engine;
pub mod error;
pub mod feed;
pub mod index;
pub mod retry;

pub use bus::{EventBus, Message, Observer, Scope};
pub use cache::{CacheStore, EntitySnapshot};
pub use config::EngineConfig;
pub use engine::{Engine, EngineHandle, EngineStats, Processed, ResyncReport};
pub use error::{Error, Result};
pub use feed::ChannelFeed;
