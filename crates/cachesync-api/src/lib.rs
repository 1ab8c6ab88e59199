//! JSON REST API over a running cachesync [`Engine`].
//!
//! Read access to the entity cache and its relationship indexes, forced
//! resynchronization, and counters. Auth and TLS are the caller's concern.
//!
//! # Mounting
//!
//! ```rust,ignore
//! .nest("/api", cachesync_api::api_router(engine.clone(), source))
//! ```

pub mod admin;
pub mod entities;
pub mod error;
pub mod stats;

use std::sync::Arc;

use axum::{
  Router,
  routing::{get, post},
};
use cachesync_core::{backend::CacheBackend, source::SourceOfRecord};
use cachesync_engine::Engine;

pub use error::ApiError;

/// Shared state threaded through the API handlers.
pub struct ApiState<B, S> {
  pub engine: Engine<B>,
  /// Absent when the server has no source of record; resync is then 503.
  pub source: Option<Arc<S>>,
}

impl<B, S> Clone for ApiState<B, S> {
  fn clone(&self) -> Self {
    Self {
      engine: self.engine.clone(),
      source: self.source.clone(),
    }
  }
}

impl<B: CacheBackend + 'static, S> ApiState<B, S> {
  fn ensure_tracked(&self, table: &str) -> Result<(), ApiError> {
    if self.engine.registry().is_tracked(table) {
      Ok(())
    } else {
      Err(ApiError::NotFound(format!("table {table:?} is not tracked")))
    }
  }

  fn source(&self) -> Result<&S, ApiError> {
    self
      .source
      .as_deref()
      .ok_or_else(|| ApiError::Unavailable("no source of record configured".into()))
  }
}

/// Build a fully-materialised API router for `engine`.
///
/// The returned `Router<()>` can be nested into any parent router regardless
/// of its own state type.
pub fn api_router<B, S>(engine: Engine<B>, source: Option<Arc<S>>) -> Router<()>
where
  B: CacheBackend + 'static,
  S: SourceOfRecord + 'static,
{
  Router::new()
    // Cache reads
    .route("/entities/{table}/{id}", get(entities::get_one::<B, S>))
    .route(
      "/entities/{table}/{id}/children/{child_table}",
      get(entities::children::<B, S>),
    )
    // Resync
    .route("/admin/resync/{table}", post(admin::resync_table::<B, S>))
    .route("/admin/resync/{table}/{id}", post(admin::resync_key::<B, S>))
    // Counters
    .route("/stats", get(stats::handler::<B, S>))
    .with_state(ApiState { engine, source })
}

// ─── Integration tests ────────────────────────────────────────────────────────
