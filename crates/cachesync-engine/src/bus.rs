//! The subscription registry and notification fan-out.
//!
//! Every observer owns one bounded channel. Delivery uses `try_send`, so a
//! slow or vanished observer never holds up anyone else. When an observer's
//! backlog is full the newest notification is dropped and the observer is
//! flagged as lagged; as soon as it has room again it receives a
//! [`Message::Stale`] telling it to refetch instead of trusting its view.

use std::{
  collections::HashMap,
  pin::Pin,
  sync::{
    Arc, RwLock, RwLockReadGuard, RwLockWriteGuard, Weak,
    atomic::{AtomicBool, AtomicU64, Ordering},
  },
  task::{Context, Poll},
};

use cachesync_core::event::Notification;
use futures::Stream;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::{debug, info, warn};
use uuid::Uuid;

// ─── Types ───────────────────────────────────────────────────────────────────

/// What an observer is attached to.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "scope", rename_all = "snake_case")]
pub enum Scope {
  Entity { table: String, id: String },
  Table { table: String },
}

/// One delivery on an observer's channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Message {
  Change(Notification),
  /// Notifications may have been missed; refetch.
  Stale { reason: String },
}

/// Delivery counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BusStats {
  pub observers: usize,
  pub delivered: u64,
  pub dropped:   u64,
}

// ─── Internals ───────────────────────────────────────────────────────────────

struct Slot {
  id:     Uuid,
  tx:     mpsc::Sender<Message>,
  lagged: AtomicBool,
}

#[derive(Default)]
struct Subscribers {
  by_entity: HashMap<(String, String), Vec<Arc<Slot>>>,
  by_table:  HashMap<String, Vec<Arc<Slot>>>,
  scopes:    HashMap<Uuid, Scope>,
}

impl Subscribers {
  fn insert(&mut self, scope: Scope, slot: Arc<Slot>) {
    self.scopes.insert(slot.id, scope.clone());
    match scope {
      Scope::Entity { table, id } => {
        self.by_entity.entry((table, id)).or_default().push(slot)
      }
      Scope::Table { table } => self.by_table.entry(table).or_default().push(slot),
    }
  }

  fn remove(&mut self, id: Uuid) -> bool {
    let Some(scope) = self.scopes.remove(&id) else {
      return false;
    };
    match scope {
      Scope::Entity { table, id: entity_id } => {
        let key = (table, entity_id);
        if let Some(slots) = self.by_entity.get_mut(&key) {
          slots.retain(|slot| slot.id != id);
          if slots.is_empty() {
            self.by_entity.remove(&key);
          }
        }
      }
      Scope::Table { table } => {
        if let Some(slots) = self.by_table.get_mut(&table) {
          slots.retain(|slot| slot.id != id);
          if slots.is_empty() {
            self.by_table.remove(&table);
          }
        }
      }
    }
    true
  }

  fn matching<'a>(&'a self, note: &Notification) -> impl Iterator<Item = &'a Arc<Slot>> {
    let entity = self
      .by_entity
      .get(&(note.table.clone(), note.id.clone()))
      .into_iter()
      .flatten();
    let table = self.by_table.get(&note.table).into_iter().flatten();
    entity.chain(table)
  }

  fn all(&self) -> impl Iterator<Item = &Arc<Slot>> {
    self.by_entity.values().chain(self.by_table.values()).flatten()
  }
}

struct Inner {
  subscribers: RwLock<Subscribers>,
  capacity:    usize,
  closed:      AtomicBool,
  delivered:   AtomicU64,
  dropped:     AtomicU64,
}

impl Inner {
  fn read(&self) -> RwLockReadGuard<'_, Subscribers> {
    self.subscribers.read().unwrap_or_else(|e| e.into_inner())
  }

  fn write(&self) -> RwLockWriteGuard<'_, Subscribers> {
    self.subscribers.write().unwrap_or_else(|e| e.into_inner())
  }

  fn detach(&self, id: Uuid) {
    if self.write().remove(id) {
      debug!(observer = %id, "observer detached");
    }
  }
}

enum Delivery {
  Sent,
  Dropped,
  Gone,
}

// ─── Bus ─────────────────────────────────────────────────────────────────────

/// Process-scoped observer registry. Cloning shares the registry.
#[derive(Clone)]
pub struct EventBus {
  inner: Arc<Inner>,
}

impl EventBus {
  /// A bus whose observers each buffer up to `capacity` messages.
  pub fn new(capacity: usize) -> Self {
    Self {
      inner: Arc::new(Inner {
        subscribers: RwLock::new(Subscribers::default()),
        capacity:    capacity.max(1),
        closed:      AtomicBool::new(false),
        delivered:   AtomicU64::new(0),
        dropped:     AtomicU64::new(0),
      }),
    }
  }

  /// Attach a new observer. Dropping the returned [`Observer`] detaches it.
  ///
  /// After [`shutdown`](Self::shutdown) the observer's stream ends
  /// immediately.
  pub fn attach(&self, scope: Scope) -> Observer {
    let (tx, rx) = mpsc::channel(self.inner.capacity);
    let id = Uuid::new_v4();

    if !self.inner.closed.load(Ordering::Acquire) {
      let slot = Arc::new(Slot {
        id,
        tx,
        lagged: AtomicBool::new(false),
      });
      self.inner.write().insert(scope.clone(), slot);
      info!(observer = %id, ?scope, "observer attached");
    }

    Observer {
      id,
      scope,
      rx,
      bus: Arc::downgrade(&self.inner),
    }
  }

  /// Remove an observer. Messages already queued stay readable.
  pub fn detach(&self, id: Uuid) { self.inner.detach(id); }

  /// Fan `notes` out to every matching entity- and table-scoped observer.
  pub fn publish(&self, notes: &[Notification]) {
    let mut gone = Vec::new();
    {
      let subscribers = self.inner.read();
      for note in notes {
        for slot in subscribers.matching(note) {
          if let Delivery::Gone = self.deliver(slot, Message::Change(note.clone())) {
            gone.push(slot.id);
          }
        }
      }
    }
    self.reap(gone);
  }

  /// Tell every observer its view may be stale.
  pub fn publish_stale(&self, reason: &str) {
    let mut gone = Vec::new();
    {
      let subscribers = self.inner.read();
      for slot in subscribers.all() {
        let message = Message::Stale {
          reason: reason.to_owned(),
        };
        match slot.tx.try_send(message) {
          Ok(()) => {}
          Err(TrySendError::Full(_)) => slot.lagged.store(true, Ordering::Release),
          Err(TrySendError::Closed(_)) => gone.push(slot.id),
        }
      }
    }
    self.reap(gone);
  }

  fn deliver(&self, slot: &Slot, message: Message) -> Delivery {
    if slot.lagged.load(Ordering::Acquire) {
      let notice = Message::Stale {
        reason: "backlog overflow".into(),
      };
      match slot.tx.try_send(notice) {
        Ok(()) => slot.lagged.store(false, Ordering::Release),
        Err(TrySendError::Full(_)) => {
          self.inner.dropped.fetch_add(1, Ordering::Relaxed);
          return Delivery::Dropped;
        }
        Err(TrySendError::Closed(_)) => return Delivery::Gone,
      }
    }

    match slot.tx.try_send(message) {
      Ok(()) => {
        self.inner.delivered.fetch_add(1, Ordering::Relaxed);
        Delivery::Sent
      }
      Err(TrySendError::Full(_)) => {
        self.inner.dropped.fetch_add(1, Ordering::Relaxed);
        if !slot.lagged.swap(true, Ordering::AcqRel) {
          warn!(observer = %slot.id, "observer backlog full, dropping notifications");
        }
        Delivery::Dropped
      }
      Err(TrySendError::Closed(_)) => Delivery::Gone,
    }
  }

  fn reap(&self, gone: Vec<Uuid>) {
    if gone.is_empty() {
      return;
    }
    let mut subscribers = self.inner.write();
    for id in gone {
      if subscribers.remove(id) {
        debug!(observer = %id, "observer channel closed, detached");
      }
    }
  }

  /// Stop accepting observers and release every channel. Queued messages
  /// remain readable; each observer stream ends once drained.
  pub fn shutdown(&self) {
    self.inner.closed.store(true, Ordering::Release);
    let drained = std::mem::take(&mut *self.inner.write());
    info!(observers = drained.scopes.len(), "event bus shut down");
  }

  pub fn stats(&self) -> BusStats {
    BusStats {
      observers: self.inner.read().scopes.len(),
      delivered: self.inner.delivered.load(Ordering::Relaxed),
      dropped:   self.inner.dropped.load(Ordering::Relaxed),
    }
  }
}

// ─── Observer ────────────────────────────────────────────────────────────────

/// The receiving end of one subscription.
pub struct Observer {
  id:    Uuid,
  scope: Scope,
  rx:    mpsc::Receiver<Message>,
  bus:   Weak<Inner>,
}

impl Observer {
  pub fn id(&self) -> Uuid { self.id }

  pub fn scope(&self) -> &Scope { &self.scope }

  /// Next message, or `None` once detached and drained.
  pub async fn recv(&mut self) -> Option<Message> { self.rx.recv().await }

  /// A queued message, without waiting.
  pub fn try_recv(&mut self) -> Option<Message> { self.rx.try_recv().ok() }
}

impl Stream for Observer {
  type Item = Message;

  fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Message>> {
    self.rx.poll_recv(cx)
  }
}

impl Drop for Observer {
  fn drop(&mut self) {
    if let Some(inner) = self.bus.upgrade() {
      inner.detach(self.id);
    }
  }
}

#[cfg(test)]
mod tests {
  use chrono::Utc;
  use cachesync_core::event::Operation;

  use super::*;

  fn note(table: &str, id: &str, operation: Operation) -> Notification {
    Notification {
      table: table.into(),
      id: id.into(),
      operation,
      data: None,
      timestamp: Utc::now(),
    }
  }

  fn entity(table: &str, id: &str) -> Scope {
    Scope::Entity {
      table: table.into(),
      id:    id.into(),
    }
  }

  fn table(table: &str) -> Scope { Scope::Table { table: table.into() } }

  fn drain(observer: &mut Observer) -> Vec<Message> {
    std::iter::from_fn(|| observer.try_recv()).collect()
  }

  #[test]
  fn entity_observers_only_see_their_key() {
    let bus = EventBus::new(8);
    let mut i1 = bus.attach(entity("inventory_item", "I1"));
    let mut i2 = bus.attach(entity("inventory_item", "I2"));

    bus.publish(&[note("inventory_item", "I1", Operation::Update)]);

    assert_eq!(drain(&mut i1).len(), 1);
    assert!(drain(&mut i2).is_empty());
  }

  #[test]
  fn table_observers_see_every_key_in_table() {
    let bus = EventBus::new(8);
    let mut items = bus.attach(table("inventory_item"));
    let mut lots = bus.attach(table("inventory_item_lot"));

    bus.publish(&[
      note("inventory_item", "I1", Operation::RelatedChanged),
      note("inventory_item", "I2", Operation::RelatedChanged),
      note("inventory_item_lot", "L1", Operation::Update),
    ]);

    assert_eq!(drain(&mut items).len(), 2);
    assert_eq!(drain(&mut lots).len(), 1);
  }

  #[test]
  fn full_backlog_drops_newest_then_signals_stale() {
    let bus = EventBus::new(2);
    let mut slow = bus.attach(table("t"));
    let mut fast = bus.attach(table("t"));

    bus.publish(&[
      note("t", "1", Operation::Insert),
      note("t", "2", Operation::Insert),
    ]);
    drain(&mut fast);
    bus.publish(&[note("t", "3", Operation::Insert)]);

    // The fast observer is unaffected by the slow one.
    assert_eq!(drain(&mut fast).len(), 1);
    assert_eq!(bus.stats().dropped, 1);

    let received = drain(&mut slow);
    let ids: Vec<_> = received
      .iter()
      .filter_map(|m| match m {
        Message::Change(n) => Some(n.id.as_str()),
        Message::Stale { .. } => None,
      })
      .collect();
    assert_eq!(ids, vec!["1", "2"]);

    bus.publish(&[note("t", "4", Operation::Insert)]);
    let after = drain(&mut slow);
    assert!(matches!(after[0], Message::Stale { .. }), "{after:?}");
    assert!(matches!(&after[1], Message::Change(n) if n.id == "4"), "{after:?}");
  }

  #[test]
  fn dropping_observer_detaches_it() {
    let bus = EventBus::new(4);
    let observer = bus.attach(table("t"));
    assert_eq!(bus.stats().observers, 1);
    drop(observer);
    assert_eq!(bus.stats().observers, 0);
  }

  #[test]
  fn stale_broadcast_reaches_every_scope() {
    let bus = EventBus::new(4);
    let mut a = bus.attach(table("t"));
    let mut b = bus.attach(entity("u", "1"));

    bus.publish_stale("feed reconnected");

    assert!(matches!(&drain(&mut a)[..], [Message::Stale { .. }]));
    assert!(matches!(&drain(&mut b)[..], [Message::Stale { .. }]));
  }

  #[tokio::test]
  async fn shutdown_lets_queued_messages_drain() {
    let bus = EventBus::new(4);
    let mut observer = bus.attach(table("t"));
    bus.publish(&[note("t", "1", Operation::Delete)]);

    bus.shutdown();

    assert!(matches!(observer.recv().await, Some(Message::Change(_))));
    assert!(observer.recv().await.is_none());
    assert_eq!(bus.stats().observers, 0);

    let mut late = bus.attach(table("t"));
    assert!(late.recv().await.is_none());
  }
}
