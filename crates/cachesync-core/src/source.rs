//! The `SourceOfRecord` trait: read access to the authoritative database,
//! used by forced resynchronization and startup schema checks only.

use std::{
  collections::{HashMap, HashSet},
  future::Future,
};

use crate::record::Record;

pub trait SourceOfRecord: Send + Sync {
  type Error: std::error::Error + Send + Sync + 'static;

  /// The current row in `table` whose `id_column` equals `id`, if it exists.
  fn fetch<'a>(
    &'a self,
    table: &'a str,
    id_column: &'a str,
    id: &'a str,
  ) -> impl Future<Output = Result<Option<Record>, Self::Error>> + Send + 'a;

  /// Every current row in `table`.
  fn fetch_table<'a>(
    &'a self,
    table: &'a str,
  ) -> impl Future<Output = Result<Vec<Record>, Self::Error>> + Send + 'a;

  /// The live schema as `table -> column names`.
  fn describe(
    &self,
  ) -> impl Future<Output = Result<HashMap<String, HashSet<String>>, Self::Error>>
  + Send
  + '_;
}
