//! `GET /stats`: engine and delivery counters.

use axum::{Json, extract::State};
use cachesync_core::{backend::CacheBackend, source::SourceOfRecord};
use cachesync_engine::{EngineStats, bus::BusStats};
use serde::Serialize;

use crate::ApiState;

#[derive(Debug, Serialize)]
pub struct StatsBody {
  pub registry_version: String,
  pub engine:           EngineStats,
  pub bus:              BusStats,
}

pub async fn handler<B, S>(State(state): State<ApiState<B, S>>) -> Json<StatsBody>
where
  B: CacheBackend + 'static,
  S: SourceOfRecord + 'static,
{
  Json(StatsBody {
    registry_version: state.engine.registry().version().to_owned(),
    engine:           state.engine.stats(),
    bus:              state.engine.bus().stats(),
  })
}
