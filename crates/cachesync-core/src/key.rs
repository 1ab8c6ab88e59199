//! Entity identity and the string layout of backend keys.
//!
//! | Purpose | Layout |
//! |---------|--------|
//! | snapshot | `ent:{ns}:{table}:{id}` |
//! | tombstone | `tomb:{ns}:{table}:{id}` |
//! | table membership | `tbl:{ns}:{table}` |
//! | tombstoned ids | `tombs:{ns}:{table}` |
//! | index set | `fk:{ns}:{parent_table}:{parent_id}:{child_table}:{via}` |
//!
//! Keys are only ever built, never parsed back.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::registry::Edge;

/// Globally unique identity of a trackable record.
#[derive(
  Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct EntityKey {
  pub namespace: String,
  pub table:     String,
  pub id:        String,
}

impl EntityKey {
  pub fn new(
    namespace: impl Into<String>,
    table: impl Into<String>,
    id: impl Into<String>,
  ) -> Self {
    Self {
      namespace: namespace.into(),
      table:     table.into(),
      id:        id.into(),
    }
  }

  /// A key for another record in the same namespace.
  pub fn sibling(&self, table: &str, id: impl Into<String>) -> Self {
    Self::new(self.namespace.clone(), table, id)
  }

  /// Backend key of this entity's snapshot.
  pub fn snapshot_key(&self) -> String {
    format!("ent:{}:{}:{}", self.namespace, self.table, self.id)
  }

  /// Backend key recording the source time of this entity's deletion.
  pub fn tombstone_key(&self) -> String {
    format!("tomb:{}:{}:{}", self.namespace, self.table, self.id)
  }

  /// Backend set holding this entity's children via `edge`.
  pub fn index_key(&self, edge: &Edge) -> String {
    format!(
      "fk:{}:{}:{}:{}:{}",
      self.namespace,
      self.table,
      self.id,
      edge.child_table,
      edge.via.label()
    )
  }
}

impl fmt::Display for EntityKey {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{}:{}:{}", self.namespace, self.table, self.id)
  }
}

/// Backend set of every cached id in `table`.
pub fn table_set_key(namespace: &str, table: &str) -> String {
  format!("tbl:{namespace}:{table}")
}

/// Backend set of every tombstoned id in `table`.
pub fn tombstone_set_key(namespace: &str, table: &str) -> String {
  format!("tombs:{namespace}:{table}")
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::registry::{Cardinality, Via};

  #[test]
  fn layouts_encode_namespace_table_and_id() {
    let key = EntityKey::new("app", "inventory_item", "I1");
    assert_eq!(key.snapshot_key(), "ent:app:inventory_item:I1");
    assert_eq!(key.tombstone_key(), "tomb:app:inventory_item:I1");
    assert_eq!(table_set_key("app", "inventory_item"), "tbl:app:inventory_item");
    assert_eq!(tombstone_set_key("app", "inventory_item"), "tombs:app:inventory_item");
    assert_eq!(key.to_string(), "app:inventory_item:I1");
  }

  #[test]
  fn index_keys_distinguish_edges_between_the_same_tables() {
    let parent = EntityKey::new("app", "user", "u1");
    let created_by = Edge {
      child_table:  "order".into(),
      parent_table: "user".into(),
      via:          Via::Column("created_by".into()),
      cardinality:  Cardinality::ManyToOne,
    };
    let assigned_to = Edge {
      via: Via::Column("assigned_to".into()),
      ..created_by.clone()
    };

    assert_eq!(parent.index_key(&created_by), "fk:app:user:u1:order:created_by");
    assert_ne!(parent.index_key(&created_by), parent.index_key(&assigned_to));
  }
}
