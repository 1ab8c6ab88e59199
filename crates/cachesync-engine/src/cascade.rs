//! Upward cascade over the relationship graph.
//!
//! Breadth-first from the changed entity's direct parents, following
//! child→parent edges through cached snapshots. A key is marked visited when
//! it is enqueued, so diamonds and cycles yield each ancestor once and the
//! walk always terminates. `max_depth` additionally caps fan-out on deep or
//! misconfigured schemas. The walk only reads.

use std::{
  collections::{HashSet, VecDeque},
  sync::Arc,
};

use cachesync_core::{backend::CacheBackend, key::EntityKey, registry::Registry};
use tracing::debug;

use crate::{Result, cache::CacheStore};

pub struct CascadePropagator<B> {
  store:     Arc<CacheStore<B>>,
  registry:  Arc<Registry>,
  max_depth: usize,
}

impl<B: CacheBackend> CascadePropagator<B> {
  pub fn new(store: Arc<CacheStore<B>>, registry: Arc<Registry>, max_depth: usize) -> Self {
    Self { store, registry, max_depth }
  }

  /// Ancestors of `root` to notify, in breadth-first order.
  ///
  /// `seeds` are the root's direct parents as resolved while applying the
  /// change (including parents it just left); deeper levels are resolved
  /// from the cache. `root` itself is never part of the result.
  pub async fn ancestors(&self, root: &EntityKey, seeds: &[EntityKey]) -> Result<Vec<EntityKey>> {
    let mut ordered = Vec::new();
    if self.max_depth == 0 {
      return Ok(ordered);
    }

    let mut visited = HashSet::from([root.clone()]);
    let mut queue = VecDeque::new();
    for seed in seeds {
      if visited.insert(seed.clone()) {
        queue.push_back((seed.clone(), 1));
      }
    }

    while let Some((key, depth)) = queue.pop_front() {
      ordered.push(key.clone());

      let edges = self.registry.edges_where_child(&key.table);
      if edges.is_empty() {
        continue;
      }
      if depth >= self.max_depth {
        debug!(root = %root, at = %key, depth, "cascade depth limit reached");
        continue;
      }
      let Some(snapshot) = self.store.snapshot(&key).await? else {
        continue;
      };
      for edge in edges {
        if let Some(parent) = edge.parent_key(&key, &snapshot.data)
          && visited.insert(parent.clone())
        {
          queue.push_back((parent, depth + 1));
        }
      }
    }

    Ok(ordered)
  }
}
