//! Read-only views of the entity cache.
//!
//! | Method | Path | Notes |
//! |--------|------|-------|
//! | `GET`  | `/entities/{table}/{id}` | 404 if not cached |
//! | `GET`  | `/entities/{table}/{id}/children/{child_table}` | `?via=<column>` when several edges link the tables |

use axum::{
  Json,
  extract::{Path, Query, State},
};
use cachesync_core::{
  backend::CacheBackend, record::Record, registry::Edge, source::SourceOfRecord,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{ApiState, error::ApiError};

// ─── Get one ──────────────────────────────────────────────────────────────────

#[derive(Debug, Serialize)]
pub struct EntityBody {
  pub table:       String,
  pub id:          String,
  pub observed_at: DateTime<Utc>,
  pub data:        Record,
}

/// `GET /entities/{table}/{id}`
pub async fn get_one<B, S>(
  State(state): State<ApiState<B, S>>,
  Path((table, id)): Path<(String, String)>,
) -> Result<Json<EntityBody>, ApiError>
where
  B: CacheBackend + 'static,
  S: SourceOfRecord + 'static,
{
  state.ensure_tracked(&table)?;
  let key = state.engine.key(&table, &id);
  let snapshot = state
    .engine
    .store()
    .snapshot(&key)
    .await?
    .ok_or_else(|| ApiError::NotFound(format!("{table}/{id} is not cached")))?;

  Ok(Json(EntityBody {
    table,
    id,
    observed_at: snapshot.observed_at,
    data: snapshot.data,
  }))
}

// ─── Children ─────────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct ChildrenParams {
  pub via: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct ChildrenBody {
  pub table:       String,
  pub id:          String,
  pub child_table: String,
  pub via:         String,
  pub ids:         Vec<String>,
}

/// `GET /entities/{table}/{id}/children/{child_table}[?via=<column>]`
pub async fn children<B, S>(
  State(state): State<ApiState<B, S>>,
  Path((table, id, child_table)): Path<(String, String, String)>,
  Query(params): Query<ChildrenParams>,
) -> Result<Json<ChildrenBody>, ApiError>
where
  B: CacheBackend + 'static,
  S: SourceOfRecord + 'static,
{
  state.ensure_tracked(&table)?;
  let candidates: Vec<&Edge> = state
    .engine
    .registry()
    .edges_where_parent(&table)
    .iter()
    .filter(|edge| edge.child_table == child_table)
    .filter(|edge| params.via.as_ref().is_none_or(|via| *via == edge.via.label()))
    .collect();

  let edge = match candidates.as_slice() {
    [edge] => *edge,
    [] => {
      return Err(ApiError::NotFound(format!(
        "no edge from {child_table} to {table}"
      )));
    }
    _ => {
      return Err(ApiError::BadRequest(format!(
        "{child_table} references {table} through several columns; pass ?via="
      )));
    }
  };

  let key = state.engine.key(&table, &id);
  let mut ids = state.engine.store().children(&key, edge).await?;
  ids.sort();

  Ok(Json(ChildrenBody {
    table,
    id,
    child_table,
    via: edge.via.label(),
    ids,
  }))
}
