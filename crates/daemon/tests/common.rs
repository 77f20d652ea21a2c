//! Shared harness for daemon integration tests: a real store in a temp
//! directory, fake providers, a deterministic embedder, and the full
//! orchestrator/worker/writer plumbing.

use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use groundeffect_core::{Account, Config};
use store::{Store, StoreWriter};
use sync::testing::{FakeEmbedder, MockCalendarAdapter, MockMailAdapter};
use sync::{
  AccountOrchestrator, AdapterRegistry, IngestPipeline, MutationHint, OutcomeBus, RateLimiter, SyncContext, TaskQueue,
  run_worker,
};

pub const WORKERS: usize = 4;

pub struct Harness {
  /// Keeps the temp data dir alive for the run
  pub _dir: TempDir,
  pub store: Arc<Store>,
  pub ctx: Arc<SyncContext>,
  pub cancel: CancellationToken,
  pub embedder: Arc<FakeEmbedder>,
  writer_task: tokio::task::JoinHandle<()>,
}

impl Harness {
  pub async fn new() -> Self {
    let dir = TempDir::new().expect("temp dir");

    let mut config = Config::default();
    config.general.data_dir = dir.path().to_path_buf();

    let store = Arc::new(
      Store::open_writer(&config.lancedb_dir(), &config.writer_lock_path())
        .await
        .expect("open store"),
    );

    let (writer, handle) = StoreWriter::new(Arc::clone(&store));
    let writer_task = tokio::spawn(writer.run());

    let embedder = Arc::new(FakeEmbedder::new());
    let ingest = Arc::new(IngestPipeline::new(
      embedder.clone() as Arc<dyn embedding::Embedder>,
      handle.clone(),
      config.search.body_max_chars,
    ));

    let config = Arc::new(config);
    let ctx = Arc::new(SyncContext {
      config: Arc::clone(&config),
      store: Arc::clone(&store),
      writer: handle,
      ingest,
      limiter: Arc::new(RateLimiter::new(50)),
      queue: Arc::new(TaskQueue::new()),
      bus: Arc::new(OutcomeBus::new()),
      adapters: AdapterRegistry::new(),
      state_dir: config.sync_state_dir(),
      attachments_dir: config.attachments_dir(),
    });

    let cancel = CancellationToken::new();
    for _ in 0..WORKERS {
      tokio::spawn(run_worker(Arc::clone(&ctx), cancel.child_token()));
    }

    Self {
      _dir: dir,
      store,
      ctx,
      cancel,
      embedder,
      writer_task,
    }
  }

  /// Register fakes and spawn the orchestrator for one account.
  pub async fn add_account(
    &self,
    account_id: &str,
  ) -> (
    Arc<MockMailAdapter>,
    Arc<MockCalendarAdapter>,
    mpsc::Sender<MutationHint>,
    tokio::task::JoinHandle<()>,
  ) {
    let mail = Arc::new(MockMailAdapter::for_account(account_id));
    mail.ensure_folder("INBOX", 1);
    let calendar = Arc::new(MockCalendarAdapter::for_account(account_id));

    self.ctx.adapters.register_mail(account_id, mail.clone());
    self.ctx.adapters.register_calendar(account_id, calendar.clone());

    let account = Account::new(account_id, "Test Account");
    self.store.upsert_account(&account).await.expect("seed account");

    let (hint_tx, hint_rx) = mpsc::channel(16);
    let orchestrator =
      AccountOrchestrator::new(Arc::clone(&self.ctx), account, hint_rx, self.cancel.child_token()).expect("orchestrator");
    let handle = tokio::spawn(orchestrator.run());

    (mail, calendar, hint_tx, handle)
  }

  pub async fn shutdown(self) {
    self.cancel.cancel();
    // Dropping the context closes the writer channel so the final batch
    // drains before the store (and lock) go away.
    drop(self.ctx);
    let _ = self.writer_task.await;
  }
}

/// Poll until `predicate` holds or the deadline passes.
pub async fn wait_for<F, Fut>(what: &str, timeout: Duration, mut predicate: F)
where
  F: FnMut() -> Fut,
  Fut: std::future::Future<Output = bool>,
{
  let deadline = tokio::time::Instant::now() + timeout;
  loop {
    if predicate().await {
      return;
    }
    if tokio::time::Instant::now() > deadline {
      panic!("timed out waiting for {}", what);
    }
    tokio::time::sleep(Duration::from_millis(100)).await;
  }
}
