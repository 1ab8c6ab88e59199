//! Error types for `cachesync-engine`.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
  #[error("core error: {0}")]
  Core(#[from] cachesync_core::Error),

  /// Every attempt at a backend call failed or timed out.
  #[error("backend {op} failed after {attempts} attempt(s): {reason}")]
  BackendUnavailable {
    op:       &'static str,
    attempts: u32,
    reason:   String,
  },

  #[error("corrupt cache entry at {key}: {source}")]
  Decode {
    key:    String,
    #[source]
    source: serde_json::Error,
  },

  #[error("{0} change carries no row data")]
  MissingData(String),

  #[error("failed to subscribe to {table:?}: {reason}")]
  FeedSubscribe { table: String, reason: String },

  #[error("table {0:?} is not tracked")]
  UntrackedTable(String),

  #[error("source of record error: {0}")]
  Source(#[source] Box<dyn std::error::Error + Send + Sync>),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
