mod agent;
mod cache;
mod config;
mod event;
mod net;

use clap::Parser;
use color_eyre::Result;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::BufReader;
use tokio::sync::mpsc;
use tracing::info;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;

use agent::Agent;
use cache::SqliteStorage;
use net::HttpFetcher;

const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

#[derive(Parser, Debug)]
#[command(name = "learnmate-agent")]
#[command(about = "Offline content agent for LearnMate, driven over stdin/stdout")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/learnmate-agent/config.yaml)
  #[arg(short, long)]
  config: Option<PathBuf>,

  /// App origin to arbitrate (overrides config)
  #[arg(long)]
  origin: Option<url::Url>,

  /// Build version token (overrides config)
  #[arg(long)]
  version_tag: Option<String>,

  /// Directory for the store and logs (overrides config)
  #[arg(long)]
  data_dir: Option<PathBuf>,
}

/// Log to a daily rolling file; stdout belongs to the host channel.
fn init_logging(dir: &Path) -> WorkerGuard {
  let appender = tracing_appender::rolling::daily(dir, "learnmate-agent.log");
  let (writer, guard) = tracing_appender::non_blocking(appender);

  tracing_subscriber::fmt()
    .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
    .with_writer(writer)
    .with_ansi(false)
    .init();

  guard
}

fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();

  let runtime = tokio::runtime::Runtime::new()?;
  let result = runtime.block_on(run(args));
  // A pending stdin read parks a blocking thread that never returns on its own
  runtime.shutdown_timeout(SHUTDOWN_GRACE);
  result
}

async fn run(args: Args) -> Result<()> {
  // Load configuration
  let mut config = config::Config::load(args.config.as_deref())?;

  // Command line overrides
  if let Some(origin) = args.origin {
    config.origin = origin;
  }
  if let Some(version) = args.version_tag {
    config.version = version;
  }
  if let Some(dir) = args.data_dir {
    config.data_dir = Some(dir);
  }
  config.validate()?;

  let data_dir = config.data_dir()?;
  std::fs::create_dir_all(&data_dir)?;
  let _log_guard = init_logging(&data_dir);

  info!(
    origin = %config.origin,
    version = %config.version,
    data_dir = %data_dir.display(),
    "Starting"
  );

  let storage = Arc::new(SqliteStorage::open(&data_dir.join("agent.db"))?);
  let fetcher = Arc::new(HttpFetcher::new(&config)?);

  let (output, writer) = event::spawn_writer(tokio::io::stdout());
  let platform = Arc::new(event::StdioPlatform::new(output.clone()));

  let agent = Arc::new(Agent::new(config.clone(), storage, fetcher, platform)?);
  let lifecycle = event::forward_lifecycle(agent.subscribe_lifecycle(), output.clone());

  agent.init().await?;

  let events = event::spawn_reader(
    BufReader::new(tokio::io::stdin()),
    config.origin.clone(),
    output.clone(),
  );
  let (reply_tx, reply_rx) = mpsc::unbounded_channel();
  let replies = event::forward_replies(reply_rx, output);

  Arc::clone(&agent).run(events, reply_tx).await?;

  // Let in-flight replies and the final lifecycle message drain before exit
  let _ = lifecycle.await;
  drop(agent);
  let _ = tokio::time::timeout(SHUTDOWN_GRACE, replies).await;
  let _ = tokio::time::timeout(SHUTDOWN_GRACE, writer).await;

  info!("Stopped");
  Ok(())
}
