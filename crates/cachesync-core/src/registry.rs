//! The relationship registry: every tracked table and every foreign-key
//! edge the engine maintains indexes for and cascades along.
//!
//! The registry is loaded once at startup from a versioned TOML description
//! and is read-only afterwards. Polymorphic `(type, id)` references are
//! resolved through the same [`Edge::parent_id`] lookup as plain columns, so
//! nothing downstream needs to know which kind of edge it is walking.

use std::collections::{BTreeMap, HashMap, HashSet};

use serde::{Deserialize, Serialize};

use crate::{
  Error, Result,
  key::EntityKey,
  record::{Record, column_id},
};

// ─── Edges ───────────────────────────────────────────────────────────────────

/// How many children may point at one parent through an edge.
#[derive(
  Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum Cardinality {
  #[default]
  ManyToOne,
  OneToOne,
}

/// The columns on the child that reference the parent.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Via {
  /// A literal foreign-key column holding the parent id.
  Column(String),
  /// A `(type, id)` pair that references the parent only when the type
  /// column equals `type_value`.
  Polymorphic {
    type_column: String,
    id_column:   String,
    type_value:  String,
  },
}

impl Via {
  /// Stable label used in index keys and diagnostics.
  pub fn label(&self) -> String {
    match self {
      Self::Column(column) => column.clone(),
      Self::Polymorphic { type_column, id_column, .. } => {
        format!("{type_column}/{id_column}")
      }
    }
  }

  /// Every child column this reference reads.
  pub fn columns(&self) -> Vec<&str> {
    match self {
      Self::Column(column) => vec![column.as_str()],
      Self::Polymorphic { type_column, id_column, .. } => {
        vec![type_column.as_str(), id_column.as_str()]
      }
    }
  }
}

/// A declared reference from a child table to a parent table.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Edge {
  pub child_table:  String,
  pub parent_table: String,
  pub via:          Via,
  pub cardinality:  Cardinality,
}

impl Edge {
  /// The parent id `record` references through this edge, if any.
  ///
  /// A polymorphic edge yields nothing unless the record's discriminator
  /// names this edge's parent.
  pub fn parent_id(&self, record: &Record) -> Option<String> {
    match &self.via {
      Via::Column(column) => column_id(record, column),
      Via::Polymorphic { type_column, id_column, type_value } => {
        let discriminator = record.get(type_column)?.as_str()?;
        if discriminator != type_value {
          return None;
        }
        column_id(record, id_column)
      }
    }
  }

  /// The parent entity `record` (a row keyed by `child`) references.
  pub fn parent_key(&self, child: &EntityKey, record: &Record) -> Option<EntityKey> {
    self
      .parent_id(record)
      .map(|id| child.sibling(&self.parent_table, id))
  }
}

// ─── Tables ──────────────────────────────────────────────────────────────────

/// Per-table overrides. Tables without relationships are tracked by
/// declaring them here alone.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableSpec {
  pub name:               String,
  /// Primary-key column; falls back to the engine default.
  #[serde(default)]
  pub id_column:          Option<String>,
  /// Soft-delete marker column; falls back to the engine default. An empty
  /// string disables soft-delete handling for the table.
  #[serde(default)]
  pub soft_delete_column: Option<String>,
}

impl TableSpec {
  pub fn new(name: impl Into<String>) -> Self {
    Self {
      name:               name.into(),
      id_column:          None,
      soft_delete_column: None,
    }
  }
}

// ─── File format ─────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct RegistryFile {
  version:   String,
  #[serde(default)]
  namespace: Option<String>,
  #[serde(default)]
  tables:    Vec<TableSpec>,
  #[serde(default)]
  edges:     Vec<EdgeFile>,
}

#[derive(Debug, Deserialize)]
struct EdgeFile {
  child:       String,
  parent:      String,
  #[serde(default)]
  column:      Option<String>,
  #[serde(default)]
  type_column: Option<String>,
  #[serde(default)]
  id_column:   Option<String>,
  #[serde(default)]
  type_value:  Option<String>,
  #[serde(default)]
  cardinality: Cardinality,
}

impl EdgeFile {
  fn into_edge(self) -> Result<Edge> {
    let via = match (self.column, self.type_column, self.id_column) {
      (Some(column), None, None) => Via::Column(column),
      (None, Some(type_column), Some(id_column)) => Via::Polymorphic {
        type_column,
        id_column,
        type_value: self.type_value.unwrap_or_else(|| self.parent.clone()),
      },
      _ => {
        return Err(Error::InvalidRegistry(format!(
          "edge {} -> {} must name either `column` or both `type_column` and `id_column`",
          self.child, self.parent
        )));
      }
    };
    Ok(Edge {
      child_table: self.child,
      parent_table: self.parent,
      via,
      cardinality: self.cardinality,
    })
  }
}

// ─── Registry ────────────────────────────────────────────────────────────────

/// The complete, static set of tracked tables and edges.
#[derive(Debug, Clone)]
pub struct Registry {
  version:   String,
  namespace: Option<String>,
  tables:    BTreeMap<String, TableSpec>,
  edges:     Vec<Edge>,
  by_child:  HashMap<String, Vec<Edge>>,
  by_parent: HashMap<String, Vec<Edge>>,
}

impl Registry {
  /// Build and validate a registry.
  ///
  /// Every edge endpoint must be a declared table, and no two edges may share
  /// child, parent and referencing columns.
  pub fn new(
    version: impl Into<String>,
    namespace: Option<String>,
    tables: Vec<TableSpec>,
    edges: Vec<Edge>,
  ) -> Result<Self> {
    let version = version.into();
    if version.trim().is_empty() {
      return Err(Error::InvalidRegistry("version must not be empty".into()));
    }

    let mut by_name = BTreeMap::new();
    for table in tables {
      if table.name.is_empty() {
        return Err(Error::InvalidRegistry("table name must not be empty".into()));
      }
      let name = table.name.clone();
      if by_name.insert(name.clone(), table).is_some() {
        return Err(Error::InvalidRegistry(format!("table {name:?} declared twice")));
      }
    }

    let mut seen = HashSet::new();
    let mut by_child: HashMap<String, Vec<Edge>> = HashMap::new();
    let mut by_parent: HashMap<String, Vec<Edge>> = HashMap::new();
    for edge in &edges {
      for table in [&edge.child_table, &edge.parent_table] {
        if !by_name.contains_key(table) {
          return Err(Error::InvalidRegistry(format!(
            "edge {} -> {} references undeclared table {table:?}",
            edge.child_table, edge.parent_table
          )));
        }
      }
      let identity = (
        edge.child_table.clone(),
        edge.parent_table.clone(),
        edge.via.label(),
      );
      if !seen.insert(identity) {
        return Err(Error::InvalidRegistry(format!(
          "duplicate edge {} -> {} via {}",
          edge.child_table,
          edge.parent_table,
          edge.via.label()
        )));
      }
      by_child
        .entry(edge.child_table.clone())
        .or_default()
        .push(edge.clone());
      by_parent
        .entry(edge.parent_table.clone())
        .or_default()
        .push(edge.clone());
    }

    Ok(Self {
      version,
      namespace,
      tables: by_name,
      edges,
      by_child,
      by_parent,
    })
  }

  /// Parse and validate a TOML registry description.
  pub fn from_toml(source: &str) -> Result<Self> {
    let file: RegistryFile = toml::from_str(source)?;
    let edges = file
      .edges
      .into_iter()
      .map(EdgeFile::into_edge)
      .collect::<Result<Vec<_>>>()?;
    Self::new(file.version, file.namespace, file.tables, edges)
  }

  pub fn version(&self) -> &str { &self.version }

  /// Namespace declared by the description, if it overrides the engine's.
  pub fn namespace(&self) -> Option<&str> { self.namespace.as_deref() }

  /// Every tracked table name, sorted.
  pub fn tables(&self) -> impl Iterator<Item = &str> {
    self.tables.keys().map(String::as_str)
  }

  pub fn table(&self, name: &str) -> Option<&TableSpec> { self.tables.get(name) }

  pub fn is_tracked(&self, table: &str) -> bool { self.tables.contains_key(table) }

  pub fn edges(&self) -> &[Edge] { &self.edges }

  /// Edges on which `table` is the child: the parents a change cascades to.
  pub fn edges_where_child(&self, table: &str) -> &[Edge] {
    self.by_child.get(table).map(Vec::as_slice).unwrap_or(&[])
  }

  /// Edges on which `table` is the parent: the index sets it owns.
  pub fn edges_where_parent(&self, table: &str) -> &[Edge] {
    self.by_parent.get(table).map(Vec::as_slice).unwrap_or(&[])
  }

  /// Check the registry against the live schema (`table -> columns`).
  ///
  /// Every tracked table must exist and every column an edge or id lookup
  /// reads must exist on it; anything else would leave index sets that can
  /// never be maintained.
  pub fn verify_schema(
    &self,
    live: &HashMap<String, HashSet<String>>,
    default_id_column: &str,
  ) -> Result<()> {
    let mut problems = Vec::new();

    for spec in self.tables.values() {
      let Some(columns) = live.get(&spec.name) else {
        problems.push(format!("table {:?} is missing", spec.name));
        continue;
      };
      let id_column = spec.id_column.as_deref().unwrap_or(default_id_column);
      if !columns.contains(id_column) {
        problems.push(format!("{}.{id_column} is missing", spec.name));
      }
    }

    for edge in &self.edges {
      let Some(columns) = live.get(&edge.child_table) else { continue };
      for column in edge.via.columns() {
        if !columns.contains(column) {
          problems.push(format!(
            "{}.{column} (edge to {}) is missing",
            edge.child_table, edge.parent_table
          ));
        }
      }
    }

    if problems.is_empty() {
      Ok(())
    } else {
      Err(Error::SchemaDivergence(problems))
    }
  }
}

#[cfg(test)]
mod tests {
  use serde_json::json;

  use super::*;

  const INVENTORY: &str = r#"
    version = "2024-06-01"

    [[tables]]
    name = "inventory_item"

    [[tables]]
    name = "inventory_item_lot"

    [[tables]]
    name = "lot_instance"

    [[tables]]
    name = "attachment"

    [[tables]]
    name      = "audit_log"
    id_column = "log_id"

    [[edges]]
    child  = "inventory_item_lot"
    parent = "inventory_item"
    column = "item_id"

    [[edges]]
    child  = "lot_instance"
    parent = "inventory_item_lot"
    column = "lot_id"

    [[edges]]
    child       = "attachment"
    parent      = "inventory_item"
    type_column = "entity_type"
    id_column   = "entity_id"

    [[edges]]
    child       = "attachment"
    parent      = "inventory_item_lot"
    type_column = "entity_type"
    id_column   = "entity_id"
    type_value  = "lot"
  "#;

  fn record(value: serde_json::Value) -> Record {
    value.as_object().cloned().expect("object")
  }

  #[test]
  fn loads_tables_and_edges() {
    let registry = Registry::from_toml(INVENTORY).unwrap();
    assert_eq!(registry.version(), "2024-06-01");
    assert_eq!(registry.tables().count(), 5);
    assert!(registry.is_tracked("audit_log"));
    assert!(!registry.is_tracked("sessions"));
    assert_eq!(registry.edges_where_child("attachment").len(), 2);
    assert_eq!(registry.edges_where_parent("inventory_item").len(), 2);
    assert!(registry.edges_where_child("audit_log").is_empty());
    assert_eq!(
      registry.table("audit_log").unwrap().id_column.as_deref(),
      Some("log_id")
    );
  }

  #[test]
  fn polymorphic_edges_match_only_their_discriminator() {
    let registry = Registry::from_toml(INVENTORY).unwrap();
    let edges = registry.edges_where_child("attachment");
    let to_item = edges.iter().find(|e| e.parent_table == "inventory_item").unwrap();
    let to_lot = edges.iter().find(|e| e.parent_table == "inventory_item_lot").unwrap();

    let on_item = record(json!({ "id": "a1", "entity_type": "inventory_item", "entity_id": "I1" }));
    let on_lot = record(json!({ "id": "a2", "entity_type": "lot", "entity_id": 7 }));

    assert_eq!(to_item.parent_id(&on_item), Some("I1".into()));
    assert_eq!(to_lot.parent_id(&on_item), None);
    assert_eq!(to_item.parent_id(&on_lot), None);
    assert_eq!(to_lot.parent_id(&on_lot), Some("7".into()));
  }

  #[test]
  fn rejects_edges_to_undeclared_tables() {
    let err = Registry::from_toml(
      r#"
        version = "1"
        [[tables]]
        name = "lot"
        [[edges]]
        child  = "lot"
        parent = "item"
        column = "item_id"
      "#,
    )
    .unwrap_err();
    assert!(matches!(err, Error::InvalidRegistry(_)), "{err}");
  }

  #[test]
  fn rejects_duplicate_edges() {
    let err = Registry::from_toml(
      r#"
        version = "1"
        [[tables]]
        name = "item"
        [[tables]]
        name = "lot"
        [[edges]]
        child  = "lot"
        parent = "item"
        column = "item_id"
        [[edges]]
        child  = "lot"
        parent = "item"
        column = "item_id"
      "#,
    )
    .unwrap_err();
    assert!(matches!(err, Error::InvalidRegistry(_)), "{err}");
  }

  #[test]
  fn rejects_edges_with_mixed_references() {
    let err = Registry::from_toml(
      r#"
        version = "1"
        [[tables]]
        name = "item"
        [[tables]]
        name = "note"
        [[edges]]
        child       = "note"
        parent      = "item"
        column      = "item_id"
        type_column = "entity_type"
      "#,
    )
    .unwrap_err();
    assert!(matches!(err, Error::InvalidRegistry(_)), "{err}");
  }

  #[test]
  fn allows_two_edges_between_the_same_tables() {
    let registry = Registry::from_toml(
      r#"
        version = "1"
        [[tables]]
        name = "user"
        [[tables]]
        name = "order"
        [[edges]]
        child  = "order"
        parent = "user"
        column = "created_by"
        [[edges]]
        child  = "order"
        parent = "user"
        column = "approved_by"
      "#,
    )
    .unwrap();
    assert_eq!(registry.edges_where_child("order").len(), 2);
  }

  #[test]
  fn verify_schema_reports_missing_columns() {
    let registry = Registry::from_toml(INVENTORY).unwrap();
    let columns = |names: &[&str]| names.iter().map(|n| n.to_string()).collect::<HashSet<_>>();

    let mut live = HashMap::new();
    live.insert("inventory_item".to_string(), columns(&["id", "name"]));
    live.insert("inventory_item_lot".to_string(), columns(&["id", "item_id"]));
    live.insert("lot_instance".to_string(), columns(&["id", "lot_id"]));
    live.insert("attachment".to_string(), columns(&["id", "entity_type", "entity_id"]));
    live.insert("audit_log".to_string(), columns(&["log_id"]));
    registry.verify_schema(&live, "id").unwrap();

    live.insert("lot_instance".to_string(), columns(&["id"]));
    live.remove("audit_log");
    let Err(Error::SchemaDivergence(problems)) = registry.verify_schema(&live, "id") else {
      panic!("expected divergence");
    };
    assert_eq!(problems.len(), 2, "{problems:?}");
  }
}
