//! cachesync server binary.
//!
//! Reads `config.toml` (or the path specified with `--config`), loads the
//! relationship registry, checks it against the live schema when a source of
//! record is configured, opens the SQLite cache backend, and serves observer
//! streams, the feed webhook and the JSON API over HTTP.

use std::{
  path::{Path, PathBuf},
  sync::Arc,
};

use anyhow::Context as _;
use cachesync_core::{registry::Registry, source::SourceOfRecord as _};
use cachesync_engine::{ChannelFeed, Engine};
use cachesync_server::{AppState, ServerConfig, source::RestSource};
use cachesync_store_sqlite::SqliteBackend;
use clap::Parser;
use tokio::net::TcpListener;
use tracing::level_filters::LevelFilter;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(author, version, about = "cachesync realtime cache server")]
struct Cli {
  /// Path to the TOML configuration file.
  #[arg(short, long, default_value = "config.toml")]
  config: PathBuf,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
  // Initialise tracing.
  tracing_subscriber::fmt()
    .with_env_filter(
      EnvFilter::builder()
        .with_default_directive(LevelFilter::INFO.into())
        .from_env_lossy(),
    )
    .init();

  let cli = Cli::parse();

  // Load configuration.
  let settings = config::Config::builder()
    .add_source(config::File::from(cli.config).required(false))
    .add_source(
      config::Environment::with_prefix("CACHESYNC")
        .separator("__")
        .try_parsing(true),
    )
    .build()
    .context("failed to read config file")?;

  let server_cfg: ServerConfig = settings
    .try_deserialize()
    .context("failed to deserialise ServerConfig")?;

  // Load the relationship registry.
  let registry_path = expand_tilde(&server_cfg.registry_path);
  let registry_text = tokio::fs::read_to_string(&registry_path)
    .await
    .with_context(|| format!("failed to read registry at {registry_path:?}"))?;
  let registry = Registry::from_toml(&registry_text)
    .with_context(|| format!("invalid registry at {registry_path:?}"))?;
  tracing::info!(
    version = registry.version(),
    tables = registry.tables().count(),
    edges = registry.edges().len(),
    "registry loaded"
  );

  // Check it against the live schema.
  let source = match &server_cfg.source_url {
    Some(url) => {
      let source = RestSource::new(url).context("failed to build source client")?;
      let live = source
        .describe()
        .await
        .with_context(|| format!("failed to read live schema from {url}"))?;
      registry
        .verify_schema(&live, &server_cfg.engine.id_column)
        .context("registry does not match the live schema")?;
      Some(Arc::new(source))
    }
    None => {
      tracing::warn!("no source_url configured; schema check and resync disabled");
      None
    }
  };

  // Expand `~` in store path and open the cache backend.
  let store_path = expand_tilde(&server_cfg.store_path);
  let backend = SqliteBackend::open(&store_path)
    .await
    .with_context(|| format!("failed to open store at {store_path:?}"))?;

  // Start the engine.
  let engine = Engine::new(
    server_cfg.engine.clone(),
    Arc::new(registry),
    Arc::new(backend),
  );
  let feed = Arc::new(ChannelFeed::new(server_cfg.engine.lane_capacity));
  let handle = engine
    .start(Arc::clone(&feed))
    .await
    .context("failed to subscribe to the change feed")?;

  let app = cachesync_server::router(AppState {
    engine,
    feed,
    source,
  });
  let address = format!("{}:{}", server_cfg.host, server_cfg.port);

  tracing::info!("Listening on http://{address}");
  let listener = TcpListener::bind(&address)
    .await
    .with_context(|| format!("failed to bind {address}"))?;

  // Observer streams only end once the engine has drained and closed the
  // bus, so stop the engine before waiting on open connections.
  axum::serve(listener, app)
    .with_graceful_shutdown(async move {
      shutdown_signal().await;
      tracing::info!("shutting down");
      handle.shutdown().await;
    })
    .await
    .context("server error")?;

  Ok(())
}

async fn shutdown_signal() {
  if let Err(e) = tokio::signal::ctrl_c().await {
    tracing::error!(error = %e, "failed to listen for ctrl-c");
    std::future::pending::<()>().await;
  }
}

/// Expand a leading `~` to the user's home directory.
fn expand_tilde(path: &Path) -> PathBuf {
  let s = path.to_string_lossy();
  if let Some(rest) = s.strip_prefix("~/")
    && let Ok(home) = std::env::var("HOME")
  {
    return PathBuf::from(home).join(rest);
  }
  path.to_path_buf()
}
