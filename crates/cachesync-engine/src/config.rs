//! Engine tuning, deserialised from the `[engine]` table of the server
//! configuration. Every field has a default so partial files work.

use std::time::Duration;

use cachesync_core::ingest::IngestDefaults;
use chrono::TimeDelta;
use serde::Deserialize;

use crate::retry::RetryPolicy;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
  /// Key namespace, unless the registry declares its own.
  pub namespace:                String,
  pub id_column:                String,
  /// Soft-delete marker column; empty disables soft-delete handling.
  pub soft_delete_column:       String,
  /// Worker lanes; every event for one key runs on the same lane.
  pub lanes:                    usize,
  pub lane_capacity:            usize,
  pub max_cascade_depth:        usize,
  /// Per-observer backlog before notifications are dropped.
  pub observer_capacity:        usize,
  pub backend_timeout_ms:       u64,
  /// How long a delete stays guarded against late updates; 0 keeps
  /// tombstones forever.
  pub tombstone_retention_secs: u64,
  /// Period of the background tombstone sweep; 0 disables it.
  pub tombstone_sweep_secs:     u64,
  pub retry:                    RetryConfig,
  pub reconnect:                ReconnectConfig,
}

impl Default for EngineConfig {
  fn default() -> Self {
    Self {
      namespace:                "app".into(),
      id_column:                "id".into(),
      soft_delete_column:       "deleted_at".into(),
      lanes:                    4,
      lane_capacity:            1024,
      max_cascade_depth:        8,
      observer_capacity:        256,
      backend_timeout_ms:       2_000,
      tombstone_retention_secs: 86_400,
      tombstone_sweep_secs:     3_600,
      retry:                    RetryConfig::default(),
      reconnect:                ReconnectConfig::default(),
    }
  }
}

impl EngineConfig {
  pub fn ingest_defaults(&self) -> IngestDefaults {
    IngestDefaults {
      namespace:          self.namespace.clone(),
      id_column:          self.id_column.clone(),
      soft_delete_column: self.soft_delete_column.clone(),
    }
  }

  /// How long tombstones are kept; `None` keeps them forever.
  pub fn tombstone_retention(&self) -> Option<TimeDelta> {
    if self.tombstone_retention_secs == 0 {
      return None;
    }
    i64::try_from(self.tombstone_retention_secs)
      .ok()
      .and_then(TimeDelta::try_seconds)
  }

  pub fn retry_policy(&self) -> RetryPolicy {
    RetryPolicy {
      timeout:         Duration::from_millis(self.backend_timeout_ms),
      max_attempts:    self.retry.max_attempts.max(1),
      initial_backoff: Duration::from_millis(self.retry.initial_backoff_ms),
      max_backoff:     Duration::from_millis(self.retry.max_backoff_ms),
    }
  }
}

/// Bounded retry for backend calls on the mutation path.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
  pub max_attempts:       u32,
  pub initial_backoff_ms: u64,
  pub max_backoff_ms:     u64,
}

impl Default for RetryConfig {
  fn default() -> Self {
    Self {
      max_attempts:       5,
      initial_backoff_ms: 50,
      max_backoff_ms:     2_000,
    }
  }
}

/// Backoff between feed reconnect attempts.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ReconnectConfig {
  pub initial_ms: u64,
  pub max_ms:     u64,
  pub multiplier: f64,
  pub jitter_ms:  u64,
}

impl Default for ReconnectConfig {
  fn default() -> Self {
    Self {
      initial_ms: 250,
      max_ms:     30_000,
      multiplier: 2.0,
      jitter_ms:  100,
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn partial_config_keeps_defaults() {
    let config: EngineConfig = serde_json::from_value(serde_json::json!({
      "lanes": 2,
      "retry": { "max_attempts": 3 }
    }))
    .unwrap();
    assert_eq!(config.lanes, 2);
    assert_eq!(config.retry.max_attempts, 3);
    assert_eq!(config.retry.initial_backoff_ms, 50);
    assert_eq!(config.max_cascade_depth, 8);
    assert_eq!(config.soft_delete_column, "deleted_at");
  }

  #[test]
  fn retry_policy_never_has_zero_attempts() {
    let config = EngineConfig {
      retry: RetryConfig { max_attempts: 0, ..RetryConfig::default() },
      ..EngineConfig::default()
    };
    assert_eq!(config.retry_policy().max_attempts, 1);
  }

  #[test]
  fn zero_retention_keeps_tombstones() {
    let config = EngineConfig {
      tombstone_retention_secs: 0,
      ..EngineConfig::default()
    };
    assert_eq!(config.tombstone_retention(), None);
    assert_eq!(
      EngineConfig::default().tombstone_retention(),
      Some(TimeDelta::days(1))
    );
  }
}
