//! HTTP surface of the cachesync server.
//!
//! Observers connect over server-sent events, the database (or a relay in
//! front of it) pushes raw changes to the feed webhook, and the JSON API from
//! `cachesync-api` is mounted under `/api`.
//!
//! | Method | Path | Notes |
//! |--------|------|-------|
//! | `GET`  | `/observe/{table}` | SSE, every entity of the table |
//! | `GET`  | `/observe/{table}/{id}` | SSE, one entity |
//! | `POST` | `/feed` | One raw change or an array of them |
//! | `GET`  | `/health` | |

pub mod error;
pub mod source;

pub use error::{Error, Result};

use std::{path::PathBuf, sync::Arc};

use axum::{
  Json, Router,
  extract::{Path, State},
  http::StatusCode,
  response::sse::{Event, KeepAlive, Sse},
  routing::{get, post},
};
use cachesync_core::{backend::CacheBackend, event::RawChange, source::SourceOfRecord};
use cachesync_engine::{ChannelFeed, Engine, EngineConfig, Message, Observer, Scope};
use futures::{Stream, StreamExt as _};
use serde::Deserialize;
use serde_json::{Value, json};
use tower_http::trace::TraceLayer;
use tracing::{debug, trace};

// ─── Configuration ────────────────────────────────────────────────────────────

/// Runtime server configuration, deserialised from `config.toml`.
#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
  pub host:          String,
  pub port:          u16,
  pub store_path:    PathBuf,
  pub registry_path: PathBuf,
  /// Base URL of the system of record's REST endpoint.
  #[serde(default)]
  pub source_url:    Option<String>,
  #[serde(default)]
  pub engine:        EngineConfig,
}

// ─── Application state ────────────────────────────────────────────────────────

/// Shared state threaded through all axum handlers.
pub struct AppState<B, S> {
  pub engine: Engine<B>,
  pub feed:   Arc<ChannelFeed>,
  pub source: Option<Arc<S>>,
}

impl<B, S> Clone for AppState<B, S> {
  fn clone(&self) -> Self {
    Self {
      engine: self.engine.clone(),
      feed:   Arc::clone(&self.feed),
      source: self.source.clone(),
    }
  }
}

// ─── Router ───────────────────────────────────────────────────────────────────

/// Build the server's axum [`Router`].
pub fn router<B, S>(state: AppState<B, S>) -> Router
where
  B: CacheBackend + 'static,
  S: SourceOfRecord + 'static,
{
  let api = cachesync_api::api_router(state.engine.clone(), state.source.clone());
  Router::new()
    .route("/health", get(health::<B, S>))
    .route("/feed", post(ingest_feed::<B, S>))
    .route("/observe/{table}", get(observe_table::<B, S>))
    .route("/observe/{table}/{id}", get(observe_entity::<B, S>))
    .with_state(state)
    .nest("/api", api)
    .layer(TraceLayer::new_for_http())
}

// ─── Handlers ────────────────────────────────────────────────────────────────

async fn health<B, S>(State(state): State<AppState<B, S>>) -> Json<Value>
where
  B: CacheBackend + 'static,
{
  Json(json!({
    "status": "ok",
    "registry_version": state.engine.registry().version(),
    "subscriptions": state.feed.subscribed_tables().len(),
  }))
}

/// Body of `POST /feed`.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub enum FeedBody {
  Batch(Vec<RawChange>),
  One(RawChange),
}

async fn ingest_feed<B, S>(
  State(state): State<AppState<B, S>>,
  Json(body): Json<FeedBody>,
) -> Result<(StatusCode, Json<Value>)>
where
  B: CacheBackend + 'static,
{
  let changes = match body {
    FeedBody::Batch(changes) => changes,
    FeedBody::One(change) => vec![change],
  };

  let mut accepted = 0usize;
  let mut ignored = 0usize;
  for change in changes {
    if !state.engine.registry().is_tracked(&change.table) {
      trace!(table = %change.table, "webhook change for untracked table");
      ignored += 1;
      continue;
    }
    state.feed.publish(change).await?;
    accepted += 1;
  }

  debug!(accepted, ignored, "webhook changes queued");
  Ok((
    StatusCode::ACCEPTED,
    Json(json!({ "accepted": accepted, "ignored": ignored })),
  ))
}

async fn observe_table<B, S>(
  State(state): State<AppState<B, S>>,
  Path(table): Path<String>,
) -> Result<Sse<impl Stream<Item = Result<Event, axum::Error>>>>
where
  B: CacheBackend + 'static,
{
  ensure_tracked(&state, &table)?;
  Ok(event_stream(state.engine.bus().attach(Scope::Table { table })))
}

async fn observe_entity<B, S>(
  State(state): State<AppState<B, S>>,
  Path((table, id)): Path<(String, String)>,
) -> Result<Sse<impl Stream<Item = Result<Event, axum::Error>>>>
where
  B: CacheBackend + 'static,
{
  ensure_tracked(&state, &table)?;
  Ok(event_stream(state.engine.bus().attach(Scope::Entity { table, id })))
}

fn ensure_tracked<B: CacheBackend + 'static, S>(state: &AppState<B, S>, table: &str) -> Result<()> {
  if state.engine.registry().is_tracked(table) {
    Ok(())
  } else {
    Err(Error::NotFound(format!("table {table:?} is not tracked")))
  }
}

/// Dropping the stream (client gone) drops the observer, which detaches it.
fn event_stream(observer: Observer) -> Sse<impl Stream<Item = Result<Event, axum::Error>>> {
  let events = observer.map(|message| {
    let name = match &message {
      Message::Change(_) => "change",
      Message::Stale { .. } => "stale",
    };
    Event::default().event(name).json_data(&message)
  });
  Sse::new(events).keep_alive(KeepAlive::default())
}

// ─── Integration tests ────────────────────────────────────────────────────────
