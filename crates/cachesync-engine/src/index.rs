//! Relationship index maintenance planning.
//!
//! An [`IndexPlan`] lists, for one change, which parent index sets the child
//! id must join and which it must leave. Planning is pure; the cache store
//! executes the plan around its snapshot write.

use cachesync_core::{
  key::EntityKey,
  record::{Record, has_column},
  registry::{Edge, Registry},
};

/// One index set membership change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexChange {
  pub set_key: String,
  pub parent:  EntityKey,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IndexPlan {
  pub add:        Vec<IndexChange>,
  pub remove:     Vec<IndexChange>,
  /// `table.via` labels of edges whose columns the row does not carry.
  pub unresolved: Vec<String>,
}

impl IndexPlan {
  /// Plan for an insert or update of `child` to `data`.
  ///
  /// `previous` holds every earlier image of the row that may still be
  /// indexed (the feed's before-image, the cached snapshot). A parent any of
  /// them references that differs from the current one is unlinked.
  pub fn for_write(
    registry: &Registry,
    child: &EntityKey,
    data: &Record,
    previous: &[&Record],
  ) -> Self {
    let mut plan = Self::default();
    for edge in registry.edges_where_child(&child.table) {
      if edge.via.columns().iter().any(|column| !has_column(data, column)) {
        plan
          .unresolved
          .push(format!("{}.{}", child.table, edge.via.label()));
      }
      let current = edge.parent_key(child, data);
      if let Some(parent) = &current {
        plan.push_add(edge, parent.clone());
      }
      plan.unlink_previous(edge, child, previous, current.as_ref());
    }
    plan
  }

  /// Plan for a delete of `child`: leave every set any earlier image joined.
  pub fn for_delete(registry: &Registry, child: &EntityKey, previous: &[&Record]) -> Self {
    let mut plan = Self::default();
    for edge in registry.edges_where_child(&child.table) {
      plan.unlink_previous(edge, child, previous, None);
    }
    plan
  }

  fn unlink_previous(
    &mut self,
    edge: &Edge,
    child: &EntityKey,
    previous: &[&Record],
    current: Option<&EntityKey>,
  ) {
    for record in previous {
      if let Some(parent) = edge.parent_key(child, record)
        && current != Some(&parent)
      {
        self.push_remove(edge, parent);
      }
    }
  }

  fn push_add(&mut self, edge: &Edge, parent: EntityKey) {
    let set_key = parent.index_key(edge);
    if !self.add.iter().any(|c| c.set_key == set_key) {
      self.add.push(IndexChange { set_key, parent });
    }
  }

  fn push_remove(&mut self, edge: &Edge, parent: EntityKey) {
    let set_key = parent.index_key(edge);
    if !self.remove.iter().any(|c| c.set_key == set_key) {
      self.remove.push(IndexChange { set_key, parent });
    }
  }

  /// Parents the child now references, deduplicated across edges.
  pub fn linked_parents(&self) -> Vec<EntityKey> { distinct_parents(&self.add) }

  /// Parents the child stopped referencing, deduplicated across edges.
  pub fn unlinked_parents(&self) -> Vec<EntityKey> { distinct_parents(&self.remove) }
}

fn distinct_parents(changes: &[IndexChange]) -> Vec<EntityKey> {
  let mut parents: Vec<EntityKey> = Vec::with_capacity(changes.len());
  for change in changes {
    if !parents.contains(&change.parent) {
      parents.push(change.parent.clone());
    }
  }
  parents
}
