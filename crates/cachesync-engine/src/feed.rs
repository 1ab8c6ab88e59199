//! [`ChannelFeed`]: an in-process [`ChangeFeed`] fed by pushing raw
//! changes into it, e.g. from a webhook endpoint.

use std::{
  collections::HashMap,
  sync::{Mutex, MutexGuard},
};

use cachesync_core::{
  event::RawChange,
  feed::{ChangeFeed, FeedStream},
};
use futures::StreamExt as _;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

#[derive(Debug, Error)]
pub enum FeedError {
  #[error("no live subscription for table {0:?}")]
  NotSubscribed(String),
}

/// A change feed backed by one bounded channel per subscribed table.
///
/// Subscribing to a table again replaces (and thereby disconnects) the
/// previous subscription, matching how a reconnecting client behaves.
pub struct ChannelFeed {
  capacity: usize,
  senders:  Mutex<HashMap<String, mpsc::Sender<RawChange>>>,
}

impl ChannelFeed {
  pub fn new(capacity: usize) -> Self {
    Self {
      capacity: capacity.max(1),
      senders:  Mutex::new(HashMap::new()),
    }
  }

  fn senders(&self) -> MutexGuard<'_, HashMap<String, mpsc::Sender<RawChange>>> {
    self.senders.lock().unwrap_or_else(|e| e.into_inner())
  }

  /// Push a change to its table's subscriber, waiting for queue space.
  pub async fn publish(&self, change: RawChange) -> Result<(), FeedError> {
    let sender = self.senders().get(&change.table).cloned();
    let Some(sender) = sender else {
      return Err(FeedError::NotSubscribed(change.table));
    };
    let table = change.table.clone();
    sender
      .send(change)
      .await
      .map_err(|_| FeedError::NotSubscribed(table))
  }

  /// Drop every open subscription; subscribers observe a disconnect.
  pub fn disconnect_all(&self) { self.senders().clear(); }

  /// Tables with a live subscription.
  pub fn subscribed_tables(&self) -> Vec<String> {
    let mut tables: Vec<_> = self
      .senders()
      .iter()
      .filter(|(_, tx)| !tx.is_closed())
      .map(|(table, _)| table.clone())
      .collect();
    tables.sort();
    tables
  }
}

impl ChangeFeed for ChannelFeed {
  type Error = FeedError;

  async fn subscribe(&self, table: &str) -> Result<FeedStream<FeedError>, FeedError> {
    let (tx, rx) = mpsc::channel(self.capacity);
    self.senders().insert(table.to_owned(), tx);
    Ok(ReceiverStream::new(rx).map(Ok).boxed())
  }
}
