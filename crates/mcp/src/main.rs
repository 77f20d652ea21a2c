//! groundeffect-mcp: the short-lived, read-only query server.
//!
//! One instance is spawned per external-host session and speaks
//! line-delimited JSON over stdio: `{"id": .., "tool": .., "arguments": ..}`
//! in, `{"id": .., "result": ..}` or `{"id": .., "error": ..}` out. The
//! outer tool-call framing belongs to the host.

use anyhow::Context;
use serde_json::Value;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tracing::info;
use tracing_subscriber::EnvFilter;

use daemon::ControlClient;
use embedding::{Embedder, EmbeddingModel, LocalEmbedder};
use groundeffect_core::{Config, FileVault, OAuthClientConfig, TokenManager};
use mcp::{GmailSubmitter, MutationRouter, SearchEngine, ToolHandler};
use store::Store;
use sync::{AdapterRegistry, GmailImap, GoogleCalendar, RateLimiter};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
  let config = Config::load().context("loading configuration")?;
  init_logging(&config)?;

  let store = Arc::new(
    Store::open_reader(&config.lancedb_dir())
      .await
      .context("opening store read-only")?,
  );

  let model = EmbeddingModel::from_name(&config.search.embedding_model)
    .with_context(|| format!("unknown embedding model {}", config.search.embedding_model))?;
  let embedder: Arc<dyn Embedder> = Arc::new(
    LocalEmbedder::load(model, &config.models_dir(), config.search.use_gpu)
      .map_err(|e| anyhow::anyhow!("loading embedding model: {}", e))?,
  );

  let config = Arc::new(config);
  let vault = Arc::new(FileVault::new());
  let tokens = Arc::new(TokenManager::new(OAuthClientConfig::from_env(), vault));
  let limiter = Arc::new(RateLimiter::new(config.sync.rate_limit_per_second));

  // Provider adapters for mutations, one per known account.
  let adapters = Arc::new(AdapterRegistry::new());
  for account in store.list_accounts().await.map_err(|e| anyhow::anyhow!(e.to_string()))? {
    adapters.register_mail(
      &account.id,
      Arc::new(GmailImap::new(account.id.clone(), Arc::clone(&tokens), Arc::clone(&limiter))),
    );
    adapters.register_calendar(
      &account.id,
      Arc::new(GoogleCalendar::new(
        account.id.clone(),
        Arc::clone(&tokens),
        Arc::clone(&limiter),
      )),
    );
  }

  let engine = SearchEngine::new(Arc::clone(&store), Arc::clone(&embedder), Arc::clone(&config));
  let router = MutationRouter::new(
    Arc::clone(&store),
    Arc::clone(&config),
    Arc::new(GmailSubmitter::new(Arc::clone(&tokens))),
    Arc::clone(&adapters),
    ControlClient::new(config.control_socket_path()),
  );
  let handler = ToolHandler::new(store, engine, router, adapters, Arc::clone(&config));

  info!("query server ready");
  serve_stdio(handler).await
}

async fn serve_stdio(handler: ToolHandler) -> anyhow::Result<()> {
  let stdin = tokio::io::stdin();
  let mut stdout = tokio::io::stdout();
  let mut lines = BufReader::new(stdin).lines();

  while let Some(line) = lines.next_line().await? {
    let trimmed = line.trim();
    if trimmed.is_empty() {
      continue;
    }

    let request: Value = match serde_json::from_str(trimmed) {
      Ok(value) => value,
      Err(e) => {
        let reply = serde_json::json!({
          "error": { "code": "BAD_REQUEST", "message": format!("malformed request: {}", e) }
        });
        write_line(&mut stdout, &reply).await?;
        continue;
      }
    };

    let tool = request["tool"].as_str().unwrap_or_default();
    let arguments = request.get("arguments").cloned().unwrap_or(Value::Null);

    let mut reply = handler.dispatch(tool, &arguments).await;
    if let Some(id) = request.get("id") {
      reply["id"] = id.clone();
    }
    write_line(&mut stdout, &reply).await?;
  }

  Ok(())
}

async fn write_line(stdout: &mut tokio::io::Stdout, value: &Value) -> anyhow::Result<()> {
  let mut payload = serde_json::to_string(value)?;
  payload.push('\n');
  stdout.write_all(payload.as_bytes()).await?;
  stdout.flush().await?;
  Ok(())
}

fn init_logging(config: &Config) -> anyhow::Result<()> {
  let filter = EnvFilter::try_from_default_env()
    .unwrap_or_else(|_| EnvFilter::new(format!("mcp={0},store={0},sync={0}", config.general.log_level)));

  std::fs::create_dir_all(config.logs_dir())?;
  let file = tracing_appender::rolling::daily(config.logs_dir(), "mcp.log");

  // Stdout carries the protocol; logs go to the file only.
  tracing_subscriber::fmt()
    .with_env_filter(filter)
    .with_writer(file)
    .with_ansi(false)
    .init();
  Ok(())
}
