//! Integration tests for `SqliteBackend` against an in-memory database.

use cachesync_core::backend::CacheBackend;

use crate::SqliteBackend;

async fn backend() -> SqliteBackend {
  SqliteBackend::open_in_memory()
    .await
    .expect("in-memory backend")
}

// ─── Plain keys ──────────────────────────────────────────────────────────────

#[tokio::test]
async fn get_missing_key_returns_none() {
  let b = backend().await;
  assert_eq!(b.get("ent:app:item:1").await.unwrap(), None);
}

#[tokio::test]
async fn set_then_get_round_trips() {
  let b = backend().await;
  b.set("ent:app:item:1", r#"{"id":"1"}"#.into()).await.unwrap();
  assert_eq!(
    b.get("ent:app:item:1").await.unwrap().as_deref(),
    Some(r#"{"id":"1"}"#)
  );
}

#[tokio::test]
async fn set_overwrites_previous_value() {
  let b = backend().await;
  b.set("k", "one".into()).await.unwrap();
  b.set("k", "two".into()).await.unwrap();
  assert_eq!(b.get("k").await.unwrap().as_deref(), Some("two"));
  assert_eq!(b.key_count().await.unwrap(), 1);
}

#[tokio::test]
async fn delete_removes_key_and_tolerates_absence() {
  let b = backend().await;
  b.set("k", "v".into()).await.unwrap();
  b.delete("k").await.unwrap();
  b.delete("k").await.unwrap();
  assert_eq!(b.get("k").await.unwrap(), None);
}

// ─── Sets ────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn set_add_is_idempotent() {
  let b = backend().await;
  b.set_add("fk:app:item:I1:lot:item_id", "L1").await.unwrap();
  b.set_add("fk:app:item:I1:lot:item_id", "L1").await.unwrap();
  b.set_add("fk:app:item:I1:lot:item_id", "L2").await.unwrap();

  let members = b.set_members("fk:app:item:I1:lot:item_id").await.unwrap();
  assert_eq!(members, vec!["L1".to_string(), "L2".to_string()]);
}

#[tokio::test]
async fn set_remove_only_touches_named_member() {
  let b = backend().await;
  b.set_add("s", "a").await.unwrap();
  b.set_add("s", "b").await.unwrap();
  b.set_add("other", "a").await.unwrap();

  b.set_remove("s", "a").await.unwrap();
  b.set_remove("s", "missing").await.unwrap();

  assert_eq!(b.set_members("s").await.unwrap(), vec!["b".to_string()]);
  assert_eq!(b.set_members("other").await.unwrap(), vec!["a".to_string()]);
}

#[tokio::test]
async fn empty_set_has_no_members() {
  let b = backend().await;
  assert!(b.set_members("nothing").await.unwrap().is_empty());
}

#[tokio::test]
async fn sets_and_keys_do_not_collide() {
  let b = backend().await;
  b.set("shared", "value".into()).await.unwrap();
  b.set_add("shared", "member").await.unwrap();
  b.delete("shared").await.unwrap();
  assert_eq!(b.set_members("shared").await.unwrap(), vec!["member".to_string()]);
}

#[tokio::test]
async fn reopening_file_backend_keeps_data() {
  let dir = std::env::temp_dir().join(format!(
    "cachesync-sqlite-test-{}",
    std::process::id()
  ));
  std::fs::create_dir_all(&dir).unwrap();
  let path = dir.join("cache.db");
  let _ = std::fs::remove_file(&path);

  {
    let b = SqliteBackend::open(&path).await.unwrap();
    b.set("k", "v".into()).await.unwrap();
    b.set_add("s", "m").await.unwrap();
  }

  let b = SqliteBackend::open(&path).await.unwrap();
  assert_eq!(b.get("k").await.unwrap().as_deref(), Some("v"));
  assert_eq!(b.set_members("s").await.unwrap(), vec!["m".to_string()]);
  let _ = std::fs::remove_dir_all(&dir);
}
