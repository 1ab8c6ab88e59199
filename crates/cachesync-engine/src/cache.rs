//! The entity cache store and index maintainer.
//!
//! [`CacheStore::apply`] is the one place snapshots and index sets change.
//! The backend has no multi-key transactions, so each change runs in a fixed
//! order that keeps readers safe:
//!
//! 1. join the new parent index sets,
//! 2. write (or delete) the snapshot and its tombstone,
//! 3. leave the old parent index sets.
//!
//! A concurrent reader may briefly see a child under both its old and new
//! parent, never under neither. Per-key serialization is the caller's job.
//!
//! Forced writes never move a key's guard time forward: they keep the stored
//! `observed_at` when it is earlier than the event's, so the feed's commit
//! times stay the only clock the guard compares against.

use std::sync::Arc;

use cachesync_core::{
  backend::CacheBackend,
  event::{ChangeEvent, ChangeKind},
  key::{EntityKey, table_set_key, tombstone_set_key},
  record::Record,
  registry::{Edge, Registry},
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{Error, Result, index::IndexPlan, retry::RetryPolicy};

// ─── Types ───────────────────────────────────────────────────────────────────

/// The last accepted full row for one entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntitySnapshot {
  pub observed_at: DateTime<Utc>,
  pub data:        Record,
}

/// Whether the stale-write guard applies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyMode {
  Guarded,
  /// Resynchronization from the source of record; always wins.
  Forced,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
  /// Cache and indexes now reflect the event.
  Applied,
  /// The event matched what was already stored; nothing to announce.
  Unchanged,
  /// Older than the stored state; nothing was touched.
  Stale,
}

/// Result of applying one event.
#[derive(Debug, Clone)]
pub struct Applied {
  pub outcome:    Outcome,
  /// Parents the entity references after the change.
  pub linked:     Vec<EntityKey>,
  /// Parents the entity no longer references.
  pub unlinked:   Vec<EntityKey>,
  /// Edges the row could not be resolved against.
  pub unresolved: Vec<String>,
}

impl Applied {
  fn stale() -> Self {
    Self {
      outcome:    Outcome::Stale,
      linked:     Vec::new(),
      unlinked:   Vec::new(),
      unresolved: Vec::new(),
    }
  }

  fn from_plan(outcome: Outcome, plan: IndexPlan) -> Self {
    Self {
      outcome,
      linked: plan.linked_parents(),
      unlinked: plan.unlinked_parents(),
      unresolved: plan.unresolved,
    }
  }

  /// Direct parents a cascade starts from: current ones first, then the
  /// ones just left.
  pub fn cascade_seeds(&self) -> Vec<EntityKey> {
    let mut seeds = self.linked.clone();
    for parent in &self.unlinked {
      if !seeds.contains(parent) {
        seeds.push(parent.clone());
      }
    }
    seeds
  }
}

// ─── Store ───────────────────────────────────────────────────────────────────

pub struct CacheStore<B> {
  backend:  Arc<B>,
  registry: Arc<Registry>,
  retry:    RetryPolicy,
}

impl<B: CacheBackend> CacheStore<B> {
  pub fn new(backend: Arc<B>, registry: Arc<Registry>, retry: RetryPolicy) -> Self {
    Self { backend, registry, retry }
  }

  // ── Reads ─────────────────────────────────────────────────────────────

  /// The cached snapshot of `key`, if any.
  pub async fn snapshot(&self, key: &EntityKey) -> Result<Option<EntitySnapshot>> {
    let storage_key = key.snapshot_key();
    let Some(raw) = self.get(&storage_key).await? else {
      return Ok(None);
    };
    serde_json::from_str(&raw)
      .map(Some)
      .map_err(|source| Error::Decode { key: storage_key, source })
  }

  /// Source time at which `key` was last deleted, if it is tombstoned.
  pub async fn tombstone(&self, key: &EntityKey) -> Result<Option<DateTime<Utc>>> {
    let storage_key = key.tombstone_key();
    let Some(raw) = self.get(&storage_key).await? else {
      return Ok(None);
    };
    serde_json::from_str(&raw)
      .map(Some)
      .map_err(|source| Error::Decode { key: storage_key, source })
  }

  /// Ids of `parent`'s children through `edge`.
  pub async fn children(&self, parent: &EntityKey, edge: &Edge) -> Result<Vec<String>> {
    let set_key = parent.index_key(edge);
    let backend = &*self.backend;
    let set_key = set_key.as_str();
    self
      .retry
      .run("set_members", move || backend.set_members(set_key))
      .await
  }

  /// Ids of every cached entity in `table`.
  pub async fn cached_ids(&self, namespace: &str, table: &str) -> Result<Vec<String>> {
    self.members(&table_set_key(namespace, table)).await
  }

  /// Ids of every tombstoned entity in `table`.
  pub async fn tombstoned_ids(&self, namespace: &str, table: &str) -> Result<Vec<String>> {
    self.members(&tombstone_set_key(namespace, table)).await
  }

  /// Drop the tombstone of `key` if it was written before `horizon`.
  ///
  /// Returns whether a tombstone was removed.
  pub async fn purge_tombstone(&self, key: &EntityKey, horizon: DateTime<Utc>) -> Result<bool> {
    let graves = tombstone_set_key(&key.namespace, &key.table);
    match self.tombstone(key).await? {
      Some(deleted_at) if deleted_at >= horizon => Ok(false),
      Some(_) => {
        self.delete(&key.tombstone_key()).await?;
        self.set_remove(&graves, &key.id).await?;
        Ok(true)
      }
      None => {
        // Membership without a tombstone is left over from a failed write.
        self.set_remove(&graves, &key.id).await?;
        Ok(false)
      }
    }
  }

  // ── Apply ─────────────────────────────────────────────────────────────

  /// Apply one change to the snapshot and every affected index set.
  ///
  /// Replaying an event that was already applied leaves the state unchanged
  /// and reports [`Outcome::Unchanged`].
  pub async fn apply(&self, event: &ChangeEvent, mode: ApplyMode) -> Result<Applied> {
    let current = self.snapshot(&event.key).await?;
    let tombstoned_at = match current {
      Some(_) => None,
      None => self.tombstone(&event.key).await?,
    };
    let stored_at = current
      .as_ref()
      .map(|snapshot| snapshot.observed_at)
      .or(tombstoned_at);

    if mode == ApplyMode::Guarded
      && stored_at.is_some_and(|at| event.observed_at < at)
    {
      return Ok(Applied::stale());
    }
    let observed_at = match (mode, stored_at) {
      (ApplyMode::Forced, Some(at)) => at.min(event.observed_at),
      _ => event.observed_at,
    };

    let mut previous: Vec<&Record> = Vec::with_capacity(2);
    if let Some(record) = &event.previous_data {
      previous.push(record);
    }
    if let Some(snapshot) = &current {
      previous.push(&snapshot.data);
    }

    match event.kind {
      ChangeKind::Insert | ChangeKind::Update => {
        let data = event
          .data
          .as_ref()
          .ok_or_else(|| Error::MissingData(event.key.to_string()))?;
        let plan = IndexPlan::for_write(&self.registry, &event.key, data, &previous);
        self
          .write(event, observed_at, data, current.as_ref(), tombstoned_at, plan)
          .await
      }
      ChangeKind::Delete => {
        let plan = IndexPlan::for_delete(&self.registry, &event.key, &previous);
        self
          .remove(event, observed_at, current.is_some(), tombstoned_at, plan)
          .await
      }
    }
  }

  async fn write(
    &self,
    event: &ChangeEvent,
    observed_at: DateTime<Utc>,
    data: &Record,
    current: Option<&EntitySnapshot>,
    tombstoned_at: Option<DateTime<Utc>>,
    plan: IndexPlan,
  ) -> Result<Applied> {
    let key = &event.key;
    let unchanged = current.is_some_and(|snapshot| snapshot.data == *data);
    // An unchanged row still advances the guard time.
    let rewrite =
      !unchanged || current.is_some_and(|snapshot| observed_at > snapshot.observed_at);

    for change in &plan.add {
      self.set_add(&change.set_key, &key.id).await?;
    }

    if rewrite {
      let snapshot = EntitySnapshot {
        observed_at,
        data: data.clone(),
      };
      let encoded = serde_json::to_string(&snapshot)
        .map_err(cachesync_core::Error::Serialization)?;
      self.set(&key.snapshot_key(), encoded).await?;
    }
    self
      .set_add(&table_set_key(&key.namespace, &key.table), &key.id)
      .await?;
    if tombstoned_at.is_some() {
      self.delete(&key.tombstone_key()).await?;
      self
        .set_remove(&tombstone_set_key(&key.namespace, &key.table), &key.id)
        .await?;
    }

    for change in &plan.remove {
      self.set_remove(&change.set_key, &key.id).await?;
    }

    let outcome = if unchanged { Outcome::Unchanged } else { Outcome::Applied };
    Ok(Applied::from_plan(outcome, plan))
  }

  /// A delete only announces anything when the entity was live in the
  /// cache; deleting an unknown or already deleted key is `Unchanged`.
  async fn remove(
    &self,
    event: &ChangeEvent,
    observed_at: DateTime<Utc>,
    was_cached: bool,
    tombstoned_at: Option<DateTime<Utc>>,
    plan: IndexPlan,
  ) -> Result<Applied> {
    let key = &event.key;

    if was_cached {
      self.delete(&key.snapshot_key()).await?;
    }
    let deleted_at = tombstoned_at.map_or(observed_at, |at| at.max(observed_at));
    if tombstoned_at != Some(deleted_at) {
      let encoded = serde_json::to_string(&deleted_at)
        .map_err(cachesync_core::Error::Serialization)?;
      self.set(&key.tombstone_key(), encoded).await?;
    }
    self
      .set_add(&tombstone_set_key(&key.namespace, &key.table), &key.id)
      .await?;
    self
      .set_remove(&table_set_key(&key.namespace, &key.table), &key.id)
      .await?;

    for change in &plan.remove {
      self.set_remove(&change.set_key, &key.id).await?;
    }

    let outcome = if was_cached { Outcome::Applied } else { Outcome::Unchanged };
    Ok(Applied::from_plan(outcome, plan))
  }

  // ── Backend calls ─────────────────────────────────────────────────────

  async fn members(&self, set_key: &str) -> Result<Vec<String>> {
    let backend = &*self.backend;
    self
      .retry
      .run("set_members", move || backend.set_members(set_key))
      .await
  }

  async fn get(&self, key: &str) -> Result<Option<String>> {
    let backend = &*self.backend;
    self.retry.run("get", move || backend.get(key)).await
  }

  async fn set(&self, key: &str, value: String) -> Result<()> {
    let backend = &*self.backend;
    self
      .retry
      .run("set", move || backend.set(key, value.clone()))
      .await
  }

  async fn delete(&self, key: &str) -> Result<()> {
    let backend = &*self.backend;
    self.retry.run("delete", move || backend.delete(key)).await
  }

  async fn set_add(&self, set_key: &str, member: &str) -> Result<()> {
    let backend = &*self.backend;
    self
      .retry
      .run("set_add", move || backend.set_add(set_key, member))
      .await
  }

  async fn set_remove(&self, set_key: &str, member: &str) -> Result<()> {
    let backend = &*self.backend;
    self
      .retry
      .run("set_remove", move || backend.set_remove(set_key, member))
      .await
  }
}
