//! Change records in their three shapes: raw notifications from the feed,
//! normalized change events, and the notifications pushed to observers.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{key::EntityKey, record::Record};

// ─── Raw feed input ──────────────────────────────────────────────────────────

/// Row operation as reported by the change feed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum RawOperation {
  Insert,
  Update,
  Delete,
}

/// One committed row mutation as delivered by the change feed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawChange {
  pub table:       String,
  pub operation:   RawOperation,
  #[serde(default)]
  pub before:      Option<Record>,
  #[serde(default)]
  pub after:       Option<Record>,
  /// Commit time at the producer; the engine's conflict-resolution clock.
  pub commit_time: DateTime<Utc>,
}

// ─── Normalized events ───────────────────────────────────────────────────────

/// Lifecycle kind of a normalized change, after soft-delete remapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeKind {
  Insert,
  Update,
  Delete,
}

impl ChangeKind {
  pub fn is_delete(self) -> bool { matches!(self, Self::Delete) }
}

/// The canonical representation of one database change.
///
/// `data` is the full new row for inserts and updates and `None` for deletes.
/// `previous_data` is the row as it was before the change, when the feed
/// supplies it.
#[derive(Debug, Clone, PartialEq)]
pub struct ChangeEvent {
  pub key:           EntityKey,
  pub kind:          ChangeKind,
  pub data:          Option<Record>,
  pub previous_data: Option<Record>,
  pub observed_at:   DateTime<Utc>,
}

// ─── Observer output ─────────────────────────────────────────────────────────

/// What a notification reports about its entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
  Insert,
  Update,
  Delete,
  /// The entity itself is unchanged, but something it depends on changed.
  RelatedChanged,
}

impl From<ChangeKind> for Operation {
  fn from(kind: ChangeKind) -> Self {
    match kind {
      ChangeKind::Insert => Self::Insert,
      ChangeKind::Update => Self::Update,
      ChangeKind::Delete => Self::Delete,
    }
  }
}

/// A change notification as delivered to observers.
///
/// Payloads always carry `table` and `id` so an observer that missed
/// notifications can refetch authoritative state; `data` is a convenience.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notification {
  pub table:     String,
  pub id:        String,
  pub operation: Operation,
  pub data:      Option<Record>,
  pub timestamp: DateTime<Utc>,
}

impl Notification {
  /// The entity's own change.
  pub fn own(event: &ChangeEvent) -> Self {
    Self {
      table:     event.key.table.clone(),
      id:        event.key.id.clone(),
      operation: event.kind.into(),
      data:      event.data.clone(),
      timestamp: event.observed_at,
    }
  }

  /// A cascaded notice to an ancestor of the changed entity.
  pub fn related(ancestor: &EntityKey, timestamp: DateTime<Utc>) -> Self {
    Self {
      table: ancestor.table.clone(),
      id: ancestor.id.clone(),
      operation: Operation::RelatedChanged,
      data: None,
      timestamp,
    }
  }
}

#[cfg(test)]
mod tests {
  use serde_json::json;

  use super::*;

  #[test]
  fn raw_change_decodes_feed_payload() {
    let raw: RawChange = serde_json::from_value(json!({
      "table": "inventory_item_lot",
      "operation": "UPDATE",
      "before": { "id": "L1", "item_id": "I1" },
      "after": { "id": "L1", "item_id": "I2" },
      "commit_time": "2024-06-01T12:00:00Z"
    }))
    .unwrap();
    assert_eq!(raw.operation, RawOperation::Update);
    assert_eq!(raw.after.unwrap()["item_id"], json!("I2"));
  }

  #[test]
  fn raw_change_tolerates_missing_images() {
    let raw: RawChange = serde_json::from_value(json!({
      "table": "inventory_item",
      "operation": "DELETE",
      "commit_time": "2024-06-01T12:00:00Z"
    }))
    .unwrap();
    assert!(raw.before.is_none());
    assert!(raw.after.is_none());
  }

  #[test]
  fn related_notifications_serialize_with_synthetic_operation() {
    let key = EntityKey::new("app", "inventory_item", "I1");
    let ts = DateTime::parse_from_rfc3339("2024-06-01T12:00:00Z")
      .unwrap()
      .with_timezone(&Utc);
    let value = serde_json::to_value(Notification::related(&key, ts)).unwrap();
    assert_eq!(value["operation"], json!("related_changed"));
    assert_eq!(value["table"], json!("inventory_item"));
    assert_eq!(value["id"], json!("I1"));
  }
}
