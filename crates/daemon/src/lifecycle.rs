//! Daemon lifecycle: the writer process.
//!
//! Startup order is deliberate: writer lock first (fail fast naming the
//! holder), then the store, then the embedding model (missing model is
//! fatal), then orchestrators and workers. SIGTERM cancels the fetch
//! side, drains pending commits through the store writer, and releases
//! the lock on the way out.

use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use embedding::{Embedder, EmbeddingModel, LocalEmbedder};
use groundeffect_core::{Account, Config, Error, FileVault, OAuthClientConfig, Result, TokenManager};
use store::{Store, StoreWriter};
use sync::{
  AccountOrchestrator, AdapterRegistry, GmailImap, GoogleCalendar, IngestPipeline, MutationHint, OutcomeBus,
  RateLimiter, SyncContext, TaskQueue, run_worker,
};

use crate::server::{ControlHandler, Server};

/// How often the re-embed sweep retries zero-vector rows.
const REEMBED_INTERVAL: Duration = Duration::from_secs(600);
const REEMBED_BATCH: usize = 64;

/// Delivers mutation hints to the right account orchestrator.
pub struct HintRouter {
  senders: RwLock<HashMap<String, mpsc::Sender<MutationHint>>>,
}

impl HintRouter {
  pub fn new() -> Self {
    Self {
      senders: RwLock::new(HashMap::new()),
    }
  }

  pub fn register(&self, account_id: &str) -> mpsc::Receiver<MutationHint> {
    let (tx, rx) = mpsc::channel(32);
    self.senders.write().insert(account_id.to_string(), tx);
    rx
  }

  pub fn known_accounts(&self) -> Vec<String> {
    self.senders.read().keys().cloned().collect()
  }

  pub async fn send(&self, account_id: &str, hint: MutationHint) -> bool {
    let sender = self.senders.read().get(account_id).cloned();
    match sender {
      Some(sender) => sender.send(hint).await.is_ok(),
      None => false,
    }
  }
}

impl Default for HintRouter {
  fn default() -> Self {
    Self::new()
  }
}

pub struct Daemon {
  config: Arc<Config>,
  store: Arc<Store>,
  ctx: Arc<SyncContext>,
  token_manager: Arc<TokenManager>,
  hints: Arc<HintRouter>,
  writer_task: tokio::task::JoinHandle<()>,
  cancel: CancellationToken,
}

impl Daemon {
  /// Wire the writer process together. Lock conflicts and a missing
  /// embedding model are fatal here, before any sync work starts.
  pub async fn build(config: Config) -> Result<Self> {
    let config = Arc::new(config);

    std::fs::create_dir_all(&config.general.data_dir)?;
    std::fs::create_dir_all(config.sync_state_dir())?;
    std::fs::create_dir_all(config.attachments_dir())?;

    let store = Store::open_writer(&config.lancedb_dir(), &config.writer_lock_path())
      .await
      .map_err(|e| match e {
        store::StoreError::WriterLockHeld { pid } => Error::WriterLockHeld { pid },
        other => Error::Store(other.to_string()),
      })?;
    let store = Arc::new(store);

    let model = EmbeddingModel::from_name(&config.search.embedding_model)
      .ok_or_else(|| Error::Config(format!("unknown embedding model {}", config.search.embedding_model)))?;
    let embedder: Arc<dyn Embedder> = Arc::new(
      LocalEmbedder::load(model, &config.models_dir(), config.search.use_gpu)
        .map_err(|e| Error::ModelLoading(e.to_string()))?,
    );

    let vault = Arc::new(FileVault::new());
    let token_manager = Arc::new(TokenManager::new(OAuthClientConfig::from_env(), vault));

    let (writer, handle) = StoreWriter::new(Arc::clone(&store));
    let writer_task = tokio::spawn(writer.run());
    let ingest = Arc::new(IngestPipeline::new(
      Arc::clone(&embedder),
      handle.clone(),
      config.search.body_max_chars,
    ));

    let ctx = Arc::new(SyncContext {
      config: Arc::clone(&config),
      store: Arc::clone(&store),
      writer: handle,
      ingest,
      limiter: Arc::new(RateLimiter::new(config.sync.rate_limit_per_second)),
      queue: Arc::new(TaskQueue::new()),
      bus: Arc::new(OutcomeBus::new()),
      adapters: AdapterRegistry::new(),
      state_dir: config.sync_state_dir(),
      attachments_dir: config.attachments_dir(),
    });

    Ok(Self {
      config,
      store,
      ctx,
      token_manager,
      hints: Arc::new(HintRouter::new()),
      writer_task,
      cancel: CancellationToken::new(),
    })
  }

  pub fn store(&self) -> Arc<Store> {
    Arc::clone(&self.store)
  }

  /// Run until SIGTERM/ctrl-c, then drain and release.
  pub async fn run(self) -> Result<()> {
    info!("daemon starting, data dir {:?}", self.config.general.data_dir);

    // One orchestrator per enabled account.
    let accounts = self
      .store
      .list_accounts()
      .await
      .map_err(|e| Error::Store(e.to_string()))?;
    let mut orchestrators = Vec::new();
    for account in accounts {
      if !self.config.account_overrides(&account.id).sync_enabled {
        info!("account {} disabled by config, skipping", account.id);
        continue;
      }
      orchestrators.push(self.spawn_account(account)?);
    }
    info!("{} account orchestrators running", orchestrators.len());

    // The shared fetch pool.
    for _ in 0..self.config.sync.max_concurrent_fetches {
      tokio::spawn(run_worker(Arc::clone(&self.ctx), self.cancel.child_token()));
    }

    // Zero-vector retry sweep.
    tokio::spawn(reembed_sweep(
      Arc::clone(&self.ctx),
      self.cancel.child_token(),
    ));

    // Control socket.
    let handler = Arc::new(ControlHandler::new(Arc::clone(&self.store), Arc::clone(&self.hints)));
    let server = Server::new(self.config.control_socket_path(), handler);
    let shutdown = server.shutdown_handle();

    let cancel = self.cancel.clone();
    tokio::spawn(async move {
      let mut sigterm = match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
        Ok(signal) => signal,
        Err(e) => {
          warn!("cannot install SIGTERM handler: {}", e);
          return;
        }
      };
      tokio::select! {
        _ = tokio::signal::ctrl_c() => info!("ctrl-c received"),
        _ = sigterm.recv() => info!("SIGTERM received"),
      }
      cancel.cancel();
      shutdown.shutdown();
    });

    server.run().await.map_err(|e| Error::Other(e.to_string()))?;

    // Drain: stop producing, close the writer channel, wait for the
    // final flush, then the store (and its lock) drop with self.
    info!("draining in-flight commits");
    self.cancel.cancel();
    for handle in orchestrators {
      let _ = handle.await;
    }
    drop(self.ctx);
    if let Err(e) = self.writer_task.await {
      error!("store writer task panicked: {}", e);
    }

    info!("daemon shutdown complete");
    Ok(())
  }

  fn spawn_account(&self, account: Account) -> Result<tokio::task::JoinHandle<()>> {
    info!("starting orchestrator for {}", account.id);

    let mail = Arc::new(GmailImap::new(
      account.id.clone(),
      Arc::clone(&self.token_manager),
      Arc::clone(&self.ctx.limiter),
    ));
    let calendar = Arc::new(GoogleCalendar::new(
      account.id.clone(),
      Arc::clone(&self.token_manager),
      Arc::clone(&self.ctx.limiter),
    ));
    self.ctx.adapters.register_mail(&account.id, mail);
    self.ctx.adapters.register_calendar(&account.id, calendar);

    let hints = self.hints.register(&account.id);
    let orchestrator = AccountOrchestrator::new(Arc::clone(&self.ctx), account, hints, self.cancel.child_token())?;
    Ok(tokio::spawn(orchestrator.run()))
  }
}

/// Retry rows that committed with a zero vector.
async fn reembed_sweep(ctx: Arc<SyncContext>, cancel: CancellationToken) {
  let mut tick = tokio::time::interval(REEMBED_INTERVAL);
  tick.tick().await;

  loop {
    tokio::select! {
      _ = cancel.cancelled() => return,
      _ = tick.tick() => {}
    }

    match ctx.store.mail_needing_embedding(REEMBED_BATCH).await {
      Ok(items) if !items.is_empty() => {
        info!("re-embedding {} mail items", items.len());
        let alias = None;
        if let Err(e) = ctx.ingest.process_mail(items, alias).await {
          warn!("mail re-embed pass failed: {}", e);
        }
      }
      Ok(_) => {}
      Err(e) => warn!("re-embed scan failed: {}", e),
    }

    match ctx.store.events_needing_embedding(REEMBED_BATCH).await {
      Ok(items) if !items.is_empty() => {
        info!("re-embedding {} events", items.len());
        if let Err(e) = ctx.ingest.process_events(items, None).await {
          warn!("event re-embed pass failed: {}", e);
        }
      }
      Ok(_) => {}
      Err(e) => warn!("re-embed scan failed: {}", e),
    }
  }
}

