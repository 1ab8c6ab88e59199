//! The `CacheBackend` trait: the remote key-value store the engine keeps
//! its snapshots and index sets in.
//!
//! The trait is implemented by storage backends (e.g.
//! `cachesync-store-sqlite`). The engine depends on this abstraction, not on
//! any concrete backend, and wraps every call in its own timeout and retry.

use std::future::Future;

/// Abstraction over a key-value store with string values and string sets.
///
/// Set operations are individually atomic; nothing spans more than one key.
/// All methods return `Send` futures so the trait can be used from
/// multi-threaded runtimes.
pub trait CacheBackend: Send + Sync {
  type Error: std::error::Error + Send + Sync + 'static;

  // ── Plain keys ────────────────────────────────────────────────────────

  /// Read the value stored at `key`. Returns `None` if absent.
  fn get<'a>(
    &'a self,
    key: &'a str,
  ) -> impl Future<Output = Result<Option<String>, Self::Error>> + Send + 'a;

  /// Store `value` at `key`, replacing any previous value.
  fn set<'a>(
    &'a self,
    key: &'a str,
    value: String,
  ) -> impl Future<Output = Result<(), Self::Error>> + Send + 'a;

  /// Remove `key`. Removing an absent key is not an error.
  fn delete<'a>(
    &'a self,
    key: &'a str,
  ) -> impl Future<Output = Result<(), Self::Error>> + Send + 'a;

  // ── Sets ──────────────────────────────────────────────────────────────

  /// Add `member` to the set at `set_key`; adding twice is a no-op.
  fn set_add<'a>(
    &'a self,
    set_key: &'a str,
    member: &'a str,
  ) -> impl Future<Output = Result<(), Self::Error>> + Send + 'a;

  /// Remove `member` from the set at `set_key`; removing an absent member is
  /// a no-op.
  fn set_remove<'a>(
    &'a self,
    set_key: &'a str,
    member: &'a str,
  ) -> impl Future<Output = Result<(), Self::Error>> + Send + 'a;

  /// All members of the set at `set_key`, in no particular order.
  fn set_members<'a>(
    &'a self,
    set_key: &'a str,
  ) -> impl Future<Output = Result<Vec<String>, Self::Error>> + Send + 'a;
}
