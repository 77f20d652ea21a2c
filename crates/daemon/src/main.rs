//! groundeffect-daemon: the long-running writer process.
//!
//! Exit codes: 0 on clean shutdown, non-zero on fatal configuration
//! errors (lock conflict, missing model, unreadable config).

use anyhow::Context;
use groundeffect_core::{Config, Error};
use tracing_subscriber::EnvFilter;

use daemon::Daemon;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
  // The CLI surface is external; the daemon takes an optional config
  // path and nothing else.
  let config_path = std::env::args().nth(1);
  let config = match config_path {
    Some(path) => Config::load_from(std::path::Path::new(&path)).context("loading configuration")?,
    None => Config::load().context("loading configuration")?,
  };

  init_logging(&config)?;

  let daemon = match Daemon::build(config).await {
    Ok(daemon) => daemon,
    Err(Error::WriterLockHeld { pid }) => {
      eprintln!(
        "groundeffect-daemon: store writer lock is held by pid {}; \
         another daemon appears to be running. Stop it first.",
        pid
      );
      std::process::exit(2);
    }
    Err(e @ Error::ModelLoading(_)) => {
      eprintln!("groundeffect-daemon: {}", e);
      std::process::exit(3);
    }
    Err(e) => return Err(e).context("daemon startup"),
  };

  daemon.run().await.context("daemon run")?;
  Ok(())
}

fn init_logging(config: &Config) -> anyhow::Result<()> {
  let filter = EnvFilter::try_from_default_env()
    .unwrap_or_else(|_| EnvFilter::new(format!("groundeffect={0},daemon={0},sync={0},store={0}", config.general.log_level)));

  std::fs::create_dir_all(config.logs_dir())?;
  let file = tracing_appender::rolling::daily(config.logs_dir(), "daemon.log");

  tracing_subscriber::fmt()
    .with_env_filter(filter)
    .with_writer(file)
    .with_ansi(false)
    .init();
  Ok(())
}
