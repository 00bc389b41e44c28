use clap::Parser;
use color_eyre::Result;
use std::path::PathBuf;
use tracing::warn;

use vibely::api::{CachedVibelyClient, HttpTransport, UserSummary, VibelyClient};
use vibely::cache::{QueryCache, SqliteStorage};
use vibely::commands::{self, Command};
use vibely::config::Config;
use vibely::logging;
use vibely::notice::{self, Notifier};

#[derive(Parser, Debug)]
#[command(name = "vibely")]
#[command(about = "Command-line client for Vibely")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/vibely/config.yaml)
  #[arg(short, long)]
  config: Option<PathBuf>,

  /// Vibely API base URL
  #[arg(long)]
  api_url: Option<String>,

  #[command(subcommand)]
  command: Command,
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();

  // Load configuration
  let mut config = Config::load(args.config.as_deref())?;
  if let Some(url) = args.api_url {
    config.api.base_url = url;
  }

  let _log_guard = logging::init(&config.log);

  let (notifier, mut tray) = notice::channel(chrono::Duration::seconds(10));
  let cache = build_cache(&config, notifier);
  let mut client =
    CachedVibelyClient::new(VibelyClient::new(HttpTransport::new(&config.api)?), cache);
  if let Some(viewer) = &config.api.viewer {
    client = client.with_viewer(UserSummary {
      id: viewer.id.clone(),
      username: viewer.username.clone(),
      display_name: viewer.display_name.clone(),
      avatar_url: None,
    });
  }

  let result = commands::run(args.command, &client, &config).await;

  tray.poll();
  for notice in tray.active() {
    eprintln!("{}", notice.message);
  }

  result
}

fn build_cache(config: &Config, notifier: Notifier) -> QueryCache {
  let cache = QueryCache::new()
    .with_stale_time(config.cache.stale_time())
    .with_gc_time(config.cache.gc_time())
    .with_notifier(notifier);

  if !config.cache.persist {
    return cache;
  }

  let storage = match &config.cache.path {
    Some(path) => SqliteStorage::open(path),
    None => SqliteStorage::open_default(),
  };
  match storage {
    Ok(storage) => cache.with_storage(storage),
    Err(e) => {
      // Offline reads are a convenience; run without them
      warn!("Snapshot storage unavailable: {}", e);
      cache
    }
  }
}
