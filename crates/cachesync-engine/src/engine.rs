//! The long-running synchronization engine.
//!
//! One ingest task reads every table subscription in feed order, normalizes
//! each change and routes it to a worker lane chosen by hashing the entity
//! key. A lane applies its events one at a time, so every change to a given
//! key is serialized while unrelated keys proceed concurrently. After a
//! change is applied the lane computes the cascade and publishes
//! notifications, strictly after the mutation it describes.
//!
//! Work that does not come through a lane (resync, inline [`Engine::ingest`],
//! the tombstone sweep) takes the same per-key lock the lanes take. Locks
//! are striped by the lane hash, so lanes never contend with each other.

use std::{
  collections::HashSet,
  hash::{DefaultHasher, Hash, Hasher},
  pin::Pin,
  sync::{
    Arc,
    atomic::{AtomicU64, Ordering},
  },
  time::{Duration, SystemTime, UNIX_EPOCH},
};

use cachesync_core::{
  backend::CacheBackend,
  event::{ChangeEvent, ChangeKind, Notification, RawChange, RawOperation},
  feed::ChangeFeed,
  ingest::Ingestor,
  key::EntityKey,
  record::Record,
  registry::Registry,
  source::SourceOfRecord,
};
use chrono::{DateTime, Utc};
use futures::{
  Stream, StreamExt as _,
  stream::{self, SelectAll},
};
use serde::Serialize;
use serde_json::Value;
use tokio::{
  sync::{Mutex, mpsc, watch},
  task::JoinHandle,
  time::MissedTickBehavior,
};
use tracing::{debug, error, info, trace, warn};

use crate::{
  Error, Result,
  bus::EventBus,
  cache::{ApplyMode, CacheStore, Outcome},
  cascade::CascadePropagator,
  config::EngineConfig,
};

// ─── Reporting ───────────────────────────────────────────────────────────────

/// What happened to one event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum Processed {
  Applied { notified: usize },
  Unchanged,
  Stale,
  /// The backend could not be reached; the cache entry may now be stale.
  Failed,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct EngineStats {
  pub received:   u64,
  pub applied:    u64,
  pub unchanged:  u64,
  pub stale:      u64,
  pub malformed:  u64,
  pub failed:     u64,
  pub reconnects: u64,
}

#[derive(Default)]
struct Counters {
  received:   AtomicU64,
  applied:    AtomicU64,
  unchanged:  AtomicU64,
  stale:      AtomicU64,
  malformed:  AtomicU64,
  failed:     AtomicU64,
  reconnects: AtomicU64,
}

fn bump(counter: &AtomicU64) { counter.fetch_add(1, Ordering::Relaxed); }

/// Summary of a forced table resynchronization.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ResyncReport {
  pub table:     String,
  pub refreshed: usize,
  pub unchanged: usize,
  pub removed:   usize,
  pub failed:    usize,
  /// Expired tombstones dropped after the refresh.
  pub purged:    usize,
}

// ─── Engine ──────────────────────────────────────────────────────────────────

struct Shared<B> {
  config:    EngineConfig,
  registry:  Arc<Registry>,
  ingestor:  Ingestor,
  store:     Arc<CacheStore<B>>,
  cascade:   CascadePropagator<B>,
  bus:       EventBus,
  stats:     Counters,
  /// One per lane, indexed by [`lane_for`].
  key_locks: Vec<Mutex<()>>,
}

/// Cheap to clone; all clones drive the same cache and bus.
pub struct Engine<B> {
  shared: Arc<Shared<B>>,
}

impl<B> Clone for Engine<B> {
  fn clone(&self) -> Self {
    Self {
      shared: Arc::clone(&self.shared),
    }
  }
}

impl<B: CacheBackend + 'static> Engine<B> {
  pub fn new(config: EngineConfig, registry: Arc<Registry>, backend: Arc<B>) -> Self {
    let ingestor = Ingestor::new(Arc::clone(&registry), config.ingest_defaults());
    let store = Arc::new(CacheStore::new(
      backend,
      Arc::clone(&registry),
      config.retry_policy(),
    ));
    let cascade = CascadePropagator::new(
      Arc::clone(&store),
      Arc::clone(&registry),
      config.max_cascade_depth,
    );
    let bus = EventBus::new(config.observer_capacity);
    let key_locks = (0..config.lanes.max(1)).map(|_| Mutex::new(())).collect();

    Self {
      shared: Arc::new(Shared {
        config,
        registry,
        ingestor,
        store,
        cascade,
        bus,
        stats: Counters::default(),
        key_locks,
      }),
    }
  }

  pub fn registry(&self) -> &Registry { &self.shared.registry }

  pub fn bus(&self) -> &EventBus { &self.shared.bus }

  pub fn store(&self) -> &CacheStore<B> { &self.shared.store }

  /// Effective key namespace.
  pub fn namespace(&self) -> &str { self.shared.ingestor.namespace() }

  pub fn id_column(&self, table: &str) -> &str { self.shared.ingestor.id_column(table) }

  pub fn key(&self, table: &str, id: &str) -> EntityKey {
    EntityKey::new(self.namespace(), table, id)
  }

  pub fn stats(&self) -> EngineStats {
    let c = &self.shared.stats;
    EngineStats {
      received:   c.received.load(Ordering::Relaxed),
      applied:    c.applied.load(Ordering::Relaxed),
      unchanged:  c.unchanged.load(Ordering::Relaxed),
      stale:      c.stale.load(Ordering::Relaxed),
      malformed:  c.malformed.load(Ordering::Relaxed),
      failed:     c.failed.load(Ordering::Relaxed),
      reconnects: c.reconnects.load(Ordering::Relaxed),
    }
  }

  // ── Event path ────────────────────────────────────────────────────────

  /// Normalize and process one raw change inline, bypassing the lanes.
  ///
  /// Returns `None` when the change was dropped by the ingestor.
  pub async fn ingest(&self, raw: RawChange) -> Option<Processed> {
    bump(&self.shared.stats.received);
    let event = self.normalize(raw)?;
    Some(self.process(event).await)
  }

  /// Apply one event, cascade, and notify observers.
  pub async fn process(&self, event: ChangeEvent) -> Processed {
    self.process_with(event, ApplyMode::Guarded).await
  }

  fn normalize(&self, raw: RawChange) -> Option<ChangeEvent> {
    let table = raw.table.clone();
    match self.shared.ingestor.normalize(raw) {
      Ok(Some(event)) => Some(event),
      Ok(None) => {
        trace!(table = %table, "ignoring change on untracked table");
        None
      }
      Err(e) => {
        bump(&self.shared.stats.malformed);
        warn!(table = %table, error = %e, "dropping malformed change");
        None
      }
    }
  }

  fn key_lock(&self, key: &EntityKey) -> &Mutex<()> {
    let locks = &self.shared.key_locks;
    &locks[lane_for(key, locks.len())]
  }

  async fn process_with(&self, event: ChangeEvent, mode: ApplyMode) -> Processed {
    let shared = &self.shared;
    let _guard = self.key_lock(&event.key).lock().await;
    let applied = match shared.store.apply(&event, mode).await {
      Ok(applied) => applied,
      Err(e) => {
        bump(&shared.stats.failed);
        error!(key = %event.key, kind = ?event.kind, error = %e, "failed to apply change");
        return Processed::Failed;
      }
    };

    if !applied.unresolved.is_empty() {
      warn!(
        key = %event.key,
        edges = ?applied.unresolved,
        "registry mismatch: row lacks relationship columns"
      );
    }

    match applied.outcome {
      Outcome::Stale => {
        bump(&shared.stats.stale);
        debug!(key = %event.key, observed_at = %event.observed_at, "stale write rejected");
        return Processed::Stale;
      }
      Outcome::Unchanged => {
        bump(&shared.stats.unchanged);
        debug!(key = %event.key, "change already reflected in cache");
        return Processed::Unchanged;
      }
      Outcome::Applied => bump(&shared.stats.applied),
    }

    let seeds = applied.cascade_seeds();
    let ancestors = match shared.cascade.ancestors(&event.key, &seeds).await {
      Ok(ancestors) => ancestors,
      Err(e) => {
        warn!(key = %event.key, error = %e, "cascade incomplete, notifying direct parents only");
        seeds.into_iter().filter(|k| *k != event.key).collect()
      }
    };

    let mut notes = Vec::with_capacity(ancestors.len() + 1);
    notes.push(Notification::own(&event));
    notes.extend(
      ancestors
        .iter()
        .map(|ancestor| Notification::related(ancestor, event.observed_at)),
    );
    shared.bus.publish(&notes);

    trace!(key = %event.key, notified = notes.len(), "change processed");
    Processed::Applied {
      notified: notes.len(),
    }
  }

  // ── Feed loop ─────────────────────────────────────────────────────────

  /// Subscribe every tracked table and start processing in the background.
  ///
  /// Failing to open the initial subscriptions is fatal; later disconnects
  /// are retried with backoff for as long as the engine runs.
  pub async fn start<F: ChangeFeed>(&self, feed: Arc<F>) -> Result<EngineHandle> {
    let tables: Vec<String> = self.shared.registry.tables().map(str::to_owned).collect();
    let merged = open_streams(&*feed, &tables).await?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let lane_count = self.shared.key_locks.len();
    let mut lanes = Vec::with_capacity(lane_count);
    let mut workers = Vec::with_capacity(lane_count);
    for lane in 0..lane_count {
      let (tx, rx) = mpsc::channel(self.shared.config.lane_capacity.max(1));
      lanes.push(tx);
      let engine = self.clone();
      workers.push(tokio::spawn(async move { engine.run_lane(lane, rx).await }));
    }

    let sweeper = match (
      self.shared.config.tombstone_sweep_secs,
      self.shared.config.tombstone_retention(),
    ) {
      (0, _) | (_, None) => None,
      (secs, Some(_)) => {
        let engine = self.clone();
        let period = Duration::from_secs(secs);
        Some(tokio::spawn(engine.run_sweeper(period, shutdown_rx.clone())))
      }
    };

    info!(
      tables = tables.len(),
      lanes = lane_count,
      registry = self.shared.registry.version(),
      "engine started"
    );

    let engine = self.clone();
    let task = tokio::spawn(async move {
      engine
        .run_feed(feed, tables, merged, lanes, shutdown_rx)
        .await;
      for worker in workers {
        if let Err(e) = worker.await {
          error!(error = %e, "worker lane panicked");
        }
      }
      if let Some(sweeper) = sweeper
        && let Err(e) = sweeper.await
      {
        error!(error = %e, "tombstone sweeper panicked");
      }
    });

    Ok(EngineHandle {
      shutdown: shutdown_tx,
      task,
      bus: self.shared.bus.clone(),
    })
  }

  async fn run_lane(self, lane: usize, mut rx: mpsc::Receiver<ChangeEvent>) {
    debug!(lane, "worker lane started");
    while let Some(event) = rx.recv().await {
      self.process(event).await;
    }
    debug!(lane, "worker lane drained");
  }

  async fn run_feed<F: ChangeFeed>(
    self,
    feed: Arc<F>,
    tables: Vec<String>,
    mut merged: Merged,
    lanes: Vec<mpsc::Sender<ChangeEvent>>,
    mut shutdown: watch::Receiver<bool>,
  ) {
    loop {
      let item = tokio::select! {
        _ = shutdown.changed() => break,
        item = merged.next() => item,
      };

      match item {
        Some(FeedItem::Change(raw)) => self.route(raw, &lanes).await,
        Some(FeedItem::Lost { table, reason }) => {
          warn!(table = %table, reason = %reason, "change feed disconnected");
          match self.reconnect(&*feed, &tables, &mut shutdown).await {
            Some(reopened) => merged = reopened,
            None => break,
          }
        }
        None => {
          // Nothing is subscribed; idle until told to stop.
          let _ = shutdown.changed().await;
          break;
        }
      }
    }
    info!("change feed loop stopped, draining lanes");
  }

  async fn run_sweeper(self, period: Duration, mut shutdown: watch::Receiver<bool>) {
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    // The first tick completes immediately.
    ticker.tick().await;
    loop {
      tokio::select! {
        _ = shutdown.changed() => break,
        _ = ticker.tick() => {
          if let Err(e) = self.sweep_tombstones().await {
            warn!(error = %e, "tombstone sweep failed");
          }
        }
      }
    }
  }

  async fn route(&self, raw: RawChange, lanes: &[mpsc::Sender<ChangeEvent>]) {
    bump(&self.shared.stats.received);
    let Some(event) = self.normalize(raw) else {
      return;
    };
    let lane = lane_for(&event.key, lanes.len());
    if lanes[lane].send(event).await.is_err() {
      error!(lane, "worker lane closed, change lost");
    }
  }

  async fn reconnect<F: ChangeFeed>(
    &self,
    feed: &F,
    tables: &[String],
    shutdown: &mut watch::Receiver<bool>,
  ) -> Option<Merged> {
    let policy = &self.shared.config.reconnect;
    let mut backoff = policy.initial_ms;
    let mut attempt = 1u32;
    loop {
      let delay = jittered_backoff(backoff, policy.jitter_ms);
      tokio::select! {
        _ = shutdown.changed() => return None,
        _ = tokio::time::sleep(Duration::from_millis(delay)) => {}
      }

      match open_streams(feed, tables).await {
        Ok(merged) => {
          bump(&self.shared.stats.reconnects);
          info!(attempt, "change feed reconnected");
          // Replayed changes are absorbed idempotently; anything missed
          // while disconnected is not, so observers must refetch.
          self.shared.bus.publish_stale("change feed reconnected");
          return Some(merged);
        }
        Err(e) => warn!(attempt, error = %e, "change feed reconnect failed"),
      }

      let next = (backoff as f64 * policy.multiplier) as u64;
      backoff = next.clamp(policy.initial_ms, policy.max_ms.max(policy.initial_ms));
      attempt += 1;
    }
  }

  // ── Resynchronization ─────────────────────────────────────────────────

  /// Overwrite one entity from the source of record, ignoring the
  /// stale-write guard. A row missing at the source is deleted.
  pub async fn resync_key<S: SourceOfRecord>(
    &self,
    source: &S,
    table: &str,
    id: &str,
  ) -> Result<Processed> {
    self.ensure_tracked(table)?;
    let id_column = self.id_column(table).to_owned();
    let row = source
      .fetch(table, &id_column, id)
      .await
      .map_err(|e| Error::Source(Box::new(e)))?;

    let raw = match row {
      Some(row) => RawChange {
        table:       table.to_owned(),
        operation:   RawOperation::Update,
        before:      None,
        after:       Some(row),
        commit_time: Utc::now(),
      },
      None => {
        let mut identity = Record::new();
        identity.insert(id_column, Value::String(id.to_owned()));
        RawChange {
          table:       table.to_owned(),
          operation:   RawOperation::Delete,
          before:      Some(identity),
          after:       None,
          commit_time: Utc::now(),
        }
      }
    };

    let event = self
      .shared
      .ingestor
      .normalize(raw)?
      .ok_or_else(|| Error::UntrackedTable(table.to_owned()))?;
    info!(key = %event.key, kind = ?event.kind, "resynchronizing entity");
    Ok(self.process_with(event, ApplyMode::Forced).await)
  }

  /// Overwrite every cached entity of `table` from the source of record and
  /// purge cached entities the source no longer has.
  pub async fn resync_table<S: SourceOfRecord>(
    &self,
    source: &S,
    table: &str,
  ) -> Result<ResyncReport> {
    self.ensure_tracked(table)?;
    let rows = source
      .fetch_table(table)
      .await
      .map_err(|e| Error::Source(Box::new(e)))?;

    let now = Utc::now();
    let mut report = ResyncReport {
      table: table.to_owned(),
      ..ResyncReport::default()
    };
    let mut live = HashSet::new();

    for row in rows {
      let raw = RawChange {
        table:       table.to_owned(),
        operation:   RawOperation::Update,
        before:      None,
        after:       Some(row),
        commit_time: now,
      };
      let event = match self.shared.ingestor.normalize(raw) {
        Ok(Some(event)) => event,
        Ok(None) => continue,
        Err(e) => {
          warn!(table, error = %e, "skipping unusable source row");
          report.failed += 1;
          continue;
        }
      };
      if event.kind != ChangeKind::Delete {
        live.insert(event.key.id.clone());
      }
      match self.process_with(event, ApplyMode::Forced).await {
        Processed::Applied { .. } => report.refreshed += 1,
        Processed::Failed => report.failed += 1,
        Processed::Unchanged | Processed::Stale => report.unchanged += 1,
      }
    }

    let cached = self.shared.store.cached_ids(self.namespace(), table).await?;
    for id in cached.into_iter().filter(|id| !live.contains(id)) {
      let event = ChangeEvent {
        key:           self.key(table, &id),
        kind:          ChangeKind::Delete,
        data:          None,
        previous_data: None,
        observed_at:   now,
      };
      match self.process_with(event, ApplyMode::Forced).await {
        Processed::Failed => report.failed += 1,
        _ => report.removed += 1,
      }
    }

    if let Some(horizon) = self.tombstone_horizon(now) {
      report.purged = self.sweep_table(table, horizon).await?;
    }

    info!(
      table,
      refreshed = report.refreshed,
      unchanged = report.unchanged,
      removed = report.removed,
      failed = report.failed,
      purged = report.purged,
      "table resynchronized"
    );
    Ok(report)
  }

  // ── Tombstones ────────────────────────────────────────────────────────

  /// Drop every tombstone older than the configured retention.
  ///
  /// Once a tombstone is gone a late update for that key is applied again,
  /// so the retention must exceed the feed's redelivery window.
  pub async fn sweep_tombstones(&self) -> Result<usize> {
    let Some(horizon) = self.tombstone_horizon(Utc::now()) else {
      return Ok(0);
    };
    let mut purged = 0;
    for table in self.shared.registry.tables() {
      purged += self.sweep_table(table, horizon).await?;
    }
    if purged > 0 {
      info!(purged, %horizon, "expired tombstones removed");
    }
    Ok(purged)
  }

  fn tombstone_horizon(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
    let retention = self.shared.config.tombstone_retention()?;
    now.checked_sub_signed(retention)
  }

  async fn sweep_table(&self, table: &str, horizon: DateTime<Utc>) -> Result<usize> {
    let store = &self.shared.store;
    let mut purged = 0;
    for id in store.tombstoned_ids(self.namespace(), table).await? {
      let key = self.key(table, &id);
      let _guard = self.key_lock(&key).lock().await;
      if store.purge_tombstone(&key, horizon).await? {
        purged += 1;
      }
    }
    Ok(purged)
  }

  fn ensure_tracked(&self, table: &str) -> Result<()> {
    if self.shared.registry.is_tracked(table) {
      Ok(())
    } else {
      Err(Error::UntrackedTable(table.to_owned()))
    }
  }
}

// ─── Handle ──────────────────────────────────────────────────────────────────

/// Controls a started engine. Dropping the handle also stops the feed loop.
pub struct EngineHandle {
  shutdown: watch::Sender<bool>,
  task:     JoinHandle<()>,
  bus:      EventBus,
}

impl EngineHandle {
  /// Stop reading the feed, let every lane finish its queued events, then
  /// shut the event bus so observers drain and end.
  pub async fn shutdown(self) {
    let _ = self.shutdown.send(true);
    if let Err(e) = self.task.await {
      error!(error = %e, "engine task panicked");
    }
    self.bus.shutdown();
  }
}

// ─── Feed plumbing ───────────────────────────────────────────────────────────

enum FeedItem {
  Change(RawChange),
  Lost { table: String, reason: String },
}

type Merged = SelectAll<Pin<Box<dyn Stream<Item = FeedItem> + Send>>>;

/// Subscribe every table and merge the subscriptions into one stream that
/// reports the loss of any of them.
async fn open_streams<F: ChangeFeed>(feed: &F, tables: &[String]) -> Result<Merged> {
  let mut streams = Vec::with_capacity(tables.len());
  for table in tables {
    let subscription = feed.subscribe(table).await.map_err(|e| Error::FeedSubscribe {
      table:  table.clone(),
      reason: e.to_string(),
    })?;

    let errored = table.clone();
    let ended = table.clone();
    let tagged = subscription
      .map(move |item| match item {
        Ok(change) => FeedItem::Change(change),
        Err(e) => FeedItem::Lost {
          table:  errored.clone(),
          reason: e.to_string(),
        },
      })
      .chain(stream::once(async move {
        FeedItem::Lost {
          table:  ended,
          reason: "subscription ended".into(),
        }
      }));
    streams.push(tagged.boxed());
  }
  Ok(stream::select_all(streams))
}

fn lane_for(key: &EntityKey, lanes: usize) -> usize {
  let mut hasher = DefaultHasher::new();
  key.hash(&mut hasher);
  (hasher.finish() % lanes.max(1) as u64) as usize
}

fn jittered_backoff(base_ms: u64, jitter_ms: u64) -> u64 {
  if jitter_ms == 0 {
    return base_ms;
  }
  let nanos = SystemTime::now()
    .duration_since(UNIX_EPOCH)
    .unwrap_or_default()
    .subsec_nanos() as u64;
  base_ms.saturating_add(nanos % jitter_ms)
}
