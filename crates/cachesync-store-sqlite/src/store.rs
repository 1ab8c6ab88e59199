//! [`SqliteBackend`]: the SQLite implementation of [`CacheBackend`].

use std::path::Path;

use cachesync_core::backend::CacheBackend;
use rusqlite::OptionalExtension as _;

use crate::{
  Error, Result,
  schema::{SCHEMA, SCHEMA_VERSION},
};

// ─── Backend ─────────────────────────────────────────────────────────────────

/// A cachesync key-value store backed by a single SQLite file.
///
/// Cloning is cheap: the inner connection is reference-counted.
#[derive(Clone)]
pub struct SqliteBackend {
  conn: tokio_rusqlite::Connection,
}

impl SqliteBackend {
  /// Open (or create) a backend at `path` and run schema initialisation.
  pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
    let conn = tokio_rusqlite::Connection::open(path).await?;
    let backend = Self { conn };
    backend.init_schema().await?;
    Ok(backend)
  }

  /// Open an in-memory backend: useful for testing.
  pub async fn open_in_memory() -> Result<Self> {
    let conn = tokio_rusqlite::Connection::open_in_memory().await?;
    let backend = Self { conn };
    backend.init_schema().await?;
    Ok(backend)
  }

  async fn init_schema(&self) -> Result<()> {
    let found: i64 = self
      .conn
      .call(|conn| {
        let version = conn.query_row("PRAGMA user_version", [], |r| r.get(0))?;
        Ok(version)
      })
      .await?;

    if found > SCHEMA_VERSION {
      return Err(Error::SchemaVersion {
        found,
        supported: SCHEMA_VERSION,
      });
    }

    self
      .conn
      .call(|conn| {
        conn.execute_batch(SCHEMA)?;
        Ok(())
      })
      .await?;
    Ok(())
  }

  /// Number of plain keys stored. Diagnostic only.
  pub async fn key_count(&self) -> Result<u64> {
    let count: i64 = self
      .conn
      .call(|conn| {
        let n = conn.query_row("SELECT COUNT(*) FROM kv", [], |r| r.get(0))?;
        Ok(n)
      })
      .await?;
    Ok(count.max(0) as u64)
  }
}

// ─── CacheBackend impl ───────────────────────────────────────────────────────

impl CacheBackend for SqliteBackend {
  type Error = Error;

  // ── Plain keys ────────────────────────────────────────────────────────────

  async fn get(&self, key: &str) -> Result<Option<String>> {
    let key = key.to_owned();
    let value = self
      .conn
      .call(move |conn| {
        let value = conn
          .query_row(
            "SELECT value FROM kv WHERE key = ?1",
            rusqlite::params![key],
            |r| r.get(0),
          )
          .optional()?;
        Ok(value)
      })
      .await?;
    Ok(value)
  }

  async fn set(&self, key: &str, value: String) -> Result<()> {
    let key = key.to_owned();
    self
      .conn
      .call(move |conn| {
        conn.execute(
          "INSERT INTO kv (key, value) VALUES (?1, ?2)
           ON CONFLICT (key) DO UPDATE SET value = excluded.value",
          rusqlite::params![key, value],
        )?;
        Ok(())
      })
      .await?;
    Ok(())
  }

  async fn delete(&self, key: &str) -> Result<()> {
    let key = key.to_owned();
    self
      .conn
      .call(move |conn| {
        conn.execute("DELETE FROM kv WHERE key = ?1", rusqlite::params![key])?;
        Ok(())
      })
      .await?;
    Ok(())
  }

  // ── Sets ──────────────────────────────────────────────────────────────────

  async fn set_add(&self, set_key: &str, member: &str) -> Result<()> {
    let set_key = set_key.to_owned();
    let member = member.to_owned();
    self
      .conn
      .call(move |conn| {
        conn.execute(
          "INSERT OR IGNORE INTO set_members (set_key, member) VALUES (?1, ?2)",
          rusqlite::params![set_key, member],
        )?;
        Ok(())
      })
      .await?;
    Ok(())
  }

  async fn set_remove(&self, set_key: &str, member: &str) -> Result<()> {
    let set_key = set_key.to_owned();
    let member = member.to_owned();
    self
      .conn
      .call(move |conn| {
        conn.execute(
          "DELETE FROM set_members WHERE set_key = ?1 AND member = ?2",
          rusqlite::params![set_key, member],
        )?;
        Ok(())
      })
      .await?;
    Ok(())
  }

  async fn set_members(&self, set_key: &str) -> Result<Vec<String>> {
    let set_key = set_key.to_owned();
    let members = self
      .conn
      .call(move |conn| {
        let mut stmt = conn.prepare(
          "SELECT member FROM set_members WHERE set_key = ?1 ORDER BY member",
        )?;
        let rows = stmt
          .query_map(rusqlite::params![set_key], |r| r.get::<_, String>(0))?
          .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
      })
      .await?;
    Ok(members)
  }
}
