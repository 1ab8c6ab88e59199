//! The `ChangeFeed` trait: the database's change stream, one subscription
//! per tracked table.

use std::{future::Future, pin::Pin};

use futures::Stream;

use crate::event::RawChange;

/// An open subscription. The stream ending, or yielding an error, means the
/// connection dropped and must be re-established.
pub type FeedStream<E> = Pin<Box<dyn Stream<Item = Result<RawChange, E>> + Send>>;

/// A source of raw change notifications.
pub trait ChangeFeed: Send + Sync + 'static {
  type Error: std::error::Error + Send + Sync + 'static;

  /// Open a subscription to committed changes on `table`.
  ///
  /// Each subscription delivers its table's changes in commit order. After
  /// a reconnect the feed may redeliver changes already seen.
  fn subscribe<'a>(
    &'a self,
    table: &'a str,
  ) -> impl Future<Output = Result<FeedStream<Self::Error>, Self::Error>> + Send + 'a;
}
