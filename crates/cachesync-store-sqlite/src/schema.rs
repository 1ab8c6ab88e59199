//! SQL schema for the cachesync SQLite backend.
//!
//! Executed once at connection startup. The version lives in
//! `PRAGMA user_version`; future migrations will be gated on it.

/// Highest schema version this build understands.
pub const SCHEMA_VERSION: i64 = 1;

/// Full schema DDL; idempotent thanks to `CREATE TABLE IF NOT EXISTS`.
pub const SCHEMA: &str = "
PRAGMA journal_mode = WAL;

-- Snapshots and tombstones, keyed by their structured key string.
CREATE TABLE IF NOT EXISTS kv (
    key   TEXT PRIMARY KEY,
    value TEXT NOT NULL
) WITHOUT ROWID;

-- Index sets and table membership sets.
CREATE TABLE IF NOT EXISTS set_members (
    set_key TEXT NOT NULL,
    member  TEXT NOT NULL,
    PRIMARY KEY (set_key, member)
) WITHOUT ROWID;

PRAGMA user_version = 1;
";
