//! Forced resynchronization from the source of record.
//!
//! | Method | Path | Notes |
//! |--------|------|-------|
//! | `POST` | `/admin/resync/{table}` | Whole table; purges rows the source lost |
//! | `POST` | `/admin/resync/{table}/{id}` | One entity |
//!
//! Both answer 503 when the server runs without a source of record.

use axum::{
  Json,
  extract::{Path, State},
};
use cachesync_core::{backend::CacheBackend, source::SourceOfRecord};
use cachesync_engine::{Processed, ResyncReport};
use serde::Serialize;

use crate::{ApiState, error::ApiError};

/// `POST /admin/resync/{table}`
pub async fn resync_table<B, S>(
  State(state): State<ApiState<B, S>>,
  Path(table): Path<String>,
) -> Result<Json<ResyncReport>, ApiError>
where
  B: CacheBackend + 'static,
  S: SourceOfRecord + 'static,
{
  let source = state.source()?;
  let report = state.engine.resync_table(source, &table).await?;
  Ok(Json(report))
}

#[derive(Debug, Serialize)]
pub struct KeyResyncBody {
  pub table:  String,
  pub id:     String,
  #[serde(flatten)]
  pub result: Processed,
}

/// `POST /admin/resync/{table}/{id}`
pub async fn resync_key<B, S>(
  State(state): State<ApiState<B, S>>,
  Path((table, id)): Path<(String, String)>,
) -> Result<Json<KeyResyncBody>, ApiError>
where
  B: CacheBackend + 'static,
  S: SourceOfRecord + 'static,
{
  let source = state.source()?;
  let result = state.engine.resync_key(source, &table, &id).await?;
  Ok(Json(KeyResyncBody { table, id, result }))
}
