//! Error types for `cachesync-core`.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
  /// A raw change notification could not be normalized into a change event.
  #[error("malformed change on {table:?}: {reason}")]
  MalformedEvent { table: String, reason: String },

  /// The registry description is internally inconsistent.
  #[error("invalid registry: {0}")]
  InvalidRegistry(String),

  /// The registry references tables or columns the live schema lacks.
  #[error("registry diverges from live schema: {}", .0.join("; "))]
  SchemaDivergence(Vec<String>),

  #[error("registry parse error: {0}")]
  RegistryParse(#[from] toml::de::Error),

  #[error("serialization error: {0}")]
  Serialization(#[from] serde_json::Error),
}

impl Error {
  pub(crate) fn malformed(table: &str, reason: impl Into<String>) -> Self {
    Self::MalformedEvent {
      table:  table.to_owned(),
      reason: reason.into(),
    }
  }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
