mod api;
mod app;
mod cache;
mod commands;
mod config;
mod connectivity;
mod coordinator;
mod error;
mod event;
mod projector;
mod queue;
mod scheduler;
#[cfg(test)]
mod testing;
mod ui;

use clap::Parser;
use color_eyre::Result;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;

use crate::api::HttpGateway;
use crate::cache::SqliteStore;
use crate::config::{Config, SettingsHandle};
use crate::connectivity::RouteLink;
use crate::coordinator::{SyncCoordinator, SyncOptions};
use crate::scheduler::Scheduler;

/// Filter directives for the log file, e.g. `suresnap=debug`
const LOG_ENV: &str = "SURESNAP_LOG";

/// How often the network route is re-checked
const LINK_POLL: Duration = Duration::from_secs(5);

#[derive(Parser, Debug)]
#[command(name = "suresnap")]
#[command(about = "Capture transactions for a Sure finance backend, online or not")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/suresnap/config.yaml)
  #[arg(short, long)]
  config: Option<PathBuf>,

  /// Account id or name to capture into
  #[arg(short, long)]
  account: Option<String>,
}

/// Log to a daily file; the terminal belongs to the UI
fn init_logging() -> Option<WorkerGuard> {
  let dir = dirs::data_dir()?.join("suresnap").join("logs");
  let appender = tracing_appender::rolling::daily(dir, "suresnap.log");
  let (writer, guard) = tracing_appender::non_blocking(appender);

  let filter = EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new("info"));
  tracing_subscriber::fmt()
    .with_env_filter(filter)
    .with_writer(writer)
    .with_ansi(false)
    .init();

  Some(guard)
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();
  let _log_guard = init_logging();

  let (config, path) = Config::load(args.config.as_deref())?;
  let settings = Arc::new(SettingsHandle::new(config, path, Config::token_override()));

  let store = Arc::new(SqliteStore::open()?);
  let tuning = settings.sync_tuning();
  let gateway = Arc::new(HttpGateway::new(
    settings.clone(),
    Duration::from_secs(tuning.request_timeout_secs),
  ));

  let link_scheduler = Scheduler::new();
  let link = RouteLink::spawn(&link_scheduler, LINK_POLL);

  let sync = Arc::new(SyncCoordinator::new(
    store,
    gateway,
    settings.clone(),
    link,
    SyncOptions::from(&tuning),
  ));
  sync.bootstrap();

  let mut app = app::App::new(sync.clone(), settings, args.account);
  let result = app.run().await;

  sync.shutdown();
  link_scheduler.shutdown();

  result
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::api::{self, ApiGateway};
  use crate::error::ApiError;

  #[tokio::test]
  async fn test_gateway_without_token_fails_before_sending() {
    let settings = Arc::new(SettingsHandle::new(Config::default(), None, None));
    let gateway = HttpGateway::new(settings, Duration::from_secs(1));

    let err = gateway.fetch_resource(&api::tags_key()).await.unwrap_err();
    assert_eq!(err, ApiError::Network("no API token configured".to_string()));
  }
}
