//! Normalization of raw feed notifications into [`ChangeEvent`]s.
//!
//! Soft deletes are folded into the lifecycle here: for a table whose rows
//! carry the marker column, an update that sets the marker is a delete and
//! one that clears it is an insert. A row that stays marked is still a
//! delete, so it never re-enters the cache.

use std::sync::Arc;

use crate::{
  Error, Result,
  event::{ChangeEvent, ChangeKind, RawChange, RawOperation},
  key::EntityKey,
  record::{Record, column_id, has_column, is_marked},
  registry::Registry,
};

/// Engine-wide defaults applied where the registry has no per-table
/// override.
#[derive(Debug, Clone)]
pub struct IngestDefaults {
  pub namespace:          String,
  pub id_column:          String,
  pub soft_delete_column: String,
}

impl Default for IngestDefaults {
  fn default() -> Self {
    Self {
      namespace:          "app".into(),
      id_column:          "id".into(),
      soft_delete_column: "deleted_at".into(),
    }
  }
}

/// Turns raw notifications into canonical change events.
#[derive(Debug, Clone)]
pub struct Ingestor {
  registry: Arc<Registry>,
  defaults: IngestDefaults,
}

impl Ingestor {
  pub fn new(registry: Arc<Registry>, mut defaults: IngestDefaults) -> Self {
    if let Some(namespace) = registry.namespace() {
      defaults.namespace = namespace.to_owned();
    }
    Self { registry, defaults }
  }

  pub fn namespace(&self) -> &str { &self.defaults.namespace }

  /// Primary-key column of `table`.
  pub fn id_column<'a>(&'a self, table: &str) -> &'a str {
    self
      .registry
      .table(table)
      .and_then(|spec| spec.id_column.as_deref())
      .unwrap_or(&self.defaults.id_column)
  }

  /// Soft-delete marker column of `table`, if the table uses one.
  fn marker_column<'a>(&'a self, table: &str) -> Option<&'a str> {
    let column = self
      .registry
      .table(table)
      .and_then(|spec| spec.soft_delete_column.as_deref())
      .unwrap_or(&self.defaults.soft_delete_column);
    (!column.is_empty()).then_some(column)
  }

  /// Normalize one raw notification.
  ///
  /// Returns `Ok(None)` for tables outside the registry; those are dropped
  /// without comment. A tracked table with an unusable payload yields
  /// [`Error::MalformedEvent`].
  pub fn normalize(&self, raw: RawChange) -> Result<Option<ChangeEvent>> {
    if raw.table.is_empty() {
      return Err(Error::malformed("", "missing table name"));
    }
    if !self.registry.is_tracked(&raw.table) {
      return Ok(None);
    }

    let RawChange { table, operation, before, after, commit_time } = raw;
    let id_column = self.id_column(&table);

    let (kind, data, previous_data) = match operation {
      RawOperation::Insert => {
        let after = after
          .ok_or_else(|| Error::malformed(&table, "insert without row image"))?;
        self.classify_insert(&table, after, before)
      }
      RawOperation::Update => {
        let after = after
          .ok_or_else(|| Error::malformed(&table, "update without row image"))?;
        self.classify_update(&table, before, after)
      }
      RawOperation::Delete => (ChangeKind::Delete, None, before),
    };

    let id = data
      .as_ref()
      .and_then(|row| column_id(row, id_column))
      .or_else(|| previous_data.as_ref().and_then(|row| column_id(row, id_column)))
      .ok_or_else(|| {
        Error::malformed(&table, format!("row has no usable {id_column:?}"))
      })?;

    Ok(Some(ChangeEvent {
      key: EntityKey::new(self.defaults.namespace.clone(), table, id),
      kind,
      data,
      previous_data,
      observed_at: commit_time,
    }))
  }

  fn classify_insert(
    &self,
    table: &str,
    after: Record,
    before: Option<Record>,
  ) -> (ChangeKind, Option<Record>, Option<Record>) {
    match self.marker_column(table) {
      Some(marker) if is_marked(&after, marker) => {
        (ChangeKind::Delete, None, Some(after))
      }
      _ => (ChangeKind::Insert, Some(after), before),
    }
  }

  fn classify_update(
    &self,
    table: &str,
    before: Option<Record>,
    after: Record,
  ) -> (ChangeKind, Option<Record>, Option<Record>) {
    let Some(marker) = self
      .marker_column(table)
      .filter(|marker| has_column(&after, marker))
    else {
      return (ChangeKind::Update, Some(after), before);
    };

    let was_deleted = before.as_ref().is_some_and(|row| is_marked(row, marker));
    let is_deleted = is_marked(&after, marker);

    match (was_deleted, is_deleted) {
      (_, true) => {
        let previous = before.unwrap_or(after);
        (ChangeKind::Delete, None, Some(previous))
      }
      (true, false) => (ChangeKind::Insert, Some(after), before),
      (false, false) => (ChangeKind::Update, Some(after), before),
    }
  }
}
