//! Per-account sync orchestrator.
//!
//! One orchestrator task per account, cooperating through the shared
//! fetch queue and outcome bus. The state machine is an explicit enum
//! with a pure transition function; all provider I/O happens in the
//! workers, so a wedged mailbox never blocks another account's
//! orchestrator.

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use groundeffect_core::{Account, AccountStatus, Config, Error, Result};
use store::{Store, WriteOp, WriterHandle};

use crate::caldav::CalendarAdapter;
use crate::idle::{IdleEvent, IdleEventKind, IdleListener};
use crate::imap::MailAdapter;
use crate::ingest::IngestPipeline;
use crate::rate_limit::RateLimiter;
use crate::state::SyncState;
use crate::task::{FetchTask, Priority, TaskKind, UidSelection};
use crate::worker::{FetchOutcome, OutcomeBus};

/// Envelope batch size during priming.
const PRIMING_BATCH: usize = 50;
/// Consecutive IDLE drops before falling back to polling.
const DEGRADE_AFTER_DROPS: u32 = 3;
/// Give up requeueing a transient failure after this many attempts.
const MAX_TASK_ATTEMPTS: u32 = 5;

/// Account lifecycle. Init acquires tokens and resolves folders; Priming
/// fetches the recent window; Live listens and polls; Degraded polls
/// with backoff after repeated IDLE drops; NeedsReauth and Disabled
/// issue no fetches.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccountState {
  Init,
  Priming,
  Live,
  Degraded,
  NeedsReauth,
  Disabled,
}

/// Inputs to the transition function.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StateEvent {
  AuthVerified,
  AuthFailed,
  FirstBatchCommitted,
  RepeatedDisconnects,
  Recovered,
  OperatorDisabled,
  OperatorEnabled,
}

impl AccountState {
  /// Pure transition function; unlisted (state, event) pairs stay put.
  pub fn transition(self, event: StateEvent) -> AccountState {
    use AccountState::*;
    use StateEvent::*;
    match (self, event) {
      (_, OperatorDisabled) => Disabled,
      (Disabled, OperatorEnabled) => Init,
      (Disabled, _) => Disabled,
      (_, AuthFailed) => NeedsReauth,
      (Init, AuthVerified) => Priming,
      (NeedsReauth, AuthVerified) => Priming,
      (Priming, FirstBatchCommitted) => Live,
      (Live, RepeatedDisconnects) => Degraded,
      (Degraded, Recovered) => Live,
      (state, _) => state,
    }
  }

  pub fn account_status(self) -> AccountStatus {
    match self {
      AccountState::Init | AccountState::Priming => AccountStatus::Syncing,
      AccountState::Live | AccountState::Degraded => AccountStatus::Active,
      AccountState::NeedsReauth => AccountStatus::NeedsReauth,
      AccountState::Disabled => AccountStatus::Disabled,
    }
  }
}

/// Cross-process nudges delivered through the daemon control socket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MutationHint {
  /// Mail was sent from this account; pull the Sent copy now
  MailSent,
  /// A calendar mutation landed; refresh one event or the whole delta
  CalendarChanged { provider_event_id: Option<String> },
  /// Operator-requested immediate sync
  TriggerSync,
  Disable,
  Enable,
}

/// Per-account provider adapters, registered by the daemon (real) or
/// tests (fakes).
pub struct AdapterRegistry {
  mail: RwLock<HashMap<String, Arc<dyn MailAdapter>>>,
  calendar: RwLock<HashMap<String, Arc<dyn CalendarAdapter>>>,
}

impl AdapterRegistry {
  pub fn new() -> Self {
    Self {
      mail: RwLock::new(HashMap::new()),
      calendar: RwLock::new(HashMap::new()),
    }
  }

  pub fn register_mail(&self, account_id: &str, adapter: Arc<dyn MailAdapter>) {
    self.mail.write().insert(account_id.to_string(), adapter);
  }

  pub fn register_calendar(&self, account_id: &str, adapter: Arc<dyn CalendarAdapter>) {
    self.calendar.write().insert(account_id.to_string(), adapter);
  }

  pub fn mail(&self, account_id: &str) -> Result<Arc<dyn MailAdapter>> {
    self
      .mail
      .read()
      .get(account_id)
      .cloned()
      .ok_or_else(|| Error::AccountNotFound(account_id.to_string()))
  }

  pub fn calendar(&self, account_id: &str) -> Result<Arc<dyn CalendarAdapter>> {
    self
      .calendar
      .read()
      .get(account_id)
      .cloned()
      .ok_or_else(|| Error::AccountNotFound(account_id.to_string()))
  }
}

impl Default for AdapterRegistry {
  fn default() -> Self {
    Self::new()
  }
}

/// Everything the orchestrators and workers share.
pub struct SyncContext {
  pub config: Arc<Config>,
  pub store: Arc<Store>,
  pub writer: WriterHandle,
  pub ingest: Arc<IngestPipeline>,
  pub limiter: Arc<RateLimiter>,
  pub queue: Arc<crate::task::TaskQueue>,
  pub bus: Arc<OutcomeBus>,
  pub adapters: AdapterRegistry,
  pub state_dir: PathBuf,
  pub attachments_dir: PathBuf,
}

pub struct AccountOrchestrator {
  ctx: Arc<SyncContext>,
  account: Account,
  state: AccountState,
  sync_state: SyncState,
  outcomes: mpsc::Receiver<FetchOutcome>,
  hints: mpsc::Receiver<MutationHint>,
  idle_rx: mpsc::Receiver<IdleEvent>,
  idle_tx: mpsc::Sender<IdleEvent>,
  idle_cancel: Option<CancellationToken>,
  cancel: CancellationToken,
  consecutive_drops: u32,
  degraded_backoff: Duration,
  awaiting_first_commit: bool,
  folders: Vec<String>,
  backfill_floor: DateTime<Utc>,
}

impl AccountOrchestrator {
  pub fn new(
    ctx: Arc<SyncContext>,
    account: Account,
    hints: mpsc::Receiver<MutationHint>,
    cancel: CancellationToken,
  ) -> Result<Self> {
    let sync_state = SyncState::load(&ctx.state_dir, &account.id)?;
    let outcomes = ctx.bus.register(&account.id);
    let (idle_tx, idle_rx) = mpsc::channel(64);
    let backfill_floor = account.recent_window_start(Utc::now());

    Ok(Self {
      ctx,
      account,
      state: AccountState::Init,
      sync_state,
      outcomes,
      hints,
      idle_rx,
      idle_tx,
      idle_cancel: None,
      cancel,
      consecutive_drops: 0,
      degraded_backoff: Duration::from_secs(1),
      awaiting_first_commit: false,
      folders: vec![],
      backfill_floor,
    })
  }

  pub fn state(&self) -> AccountState {
    self.state
  }

  /// Drive the account until cancelled.
  pub async fn run(mut self) {
    info!("orchestrator starting for {}", self.account.id);

    loop {
      if self.cancel.is_cancelled() {
        break;
      }
      match self.state {
        AccountState::Init => self.run_init().await,
        AccountState::Priming => self.run_event_loop().await,
        AccountState::Live => self.run_event_loop().await,
        AccountState::Degraded => self.run_degraded().await,
        AccountState::NeedsReauth => self.run_needs_reauth().await,
        AccountState::Disabled => self.run_disabled().await,
      }
    }

    self.quiesce().await;
    self.ctx.bus.unregister(&self.account.id);
    info!("orchestrator stopped for {}", self.account.id);
  }

  async fn run_init(&mut self) {
    match self.verify_auth().await {
      Ok(()) => {
        self.apply(StateEvent::AuthVerified).await;
        self.start_priming().await;
      }
      Err(e) if e.requires_reauth() => {
        warn!("auth verification failed for {}: {}", self.account.id, e);
        self.apply(StateEvent::AuthFailed).await;
      }
      Err(e) => {
        warn!("init failed for {} ({}), retrying", self.account.id, e);
        tokio::select! {
          _ = self.cancel.cancelled() => {}
          _ = tokio::time::sleep(Duration::from_secs(5)) => {}
        }
      }
    }
  }

  async fn verify_auth(&self) -> Result<()> {
    let mail = self.ctx.adapters.mail(&self.account.id)?;
    mail.verify().await?;
    if self.account.sync_calendar {
      let calendar = self.ctx.adapters.calendar(&self.account.id)?;
      calendar.verify().await?;
    }
    Ok(())
  }

  /// Queue the priming work: folder resolution, the recent window plus
  /// unread/flagged mail, and the calendar horizon.
  async fn start_priming(&mut self) {
    self.awaiting_first_commit = true;

    if self.account.sync_email {
      self.push(TaskKind::FolderList, Priority::RecentWindow);
    }
    if self.account.sync_calendar {
      self.push_calendar_delta();
    }
  }

  fn push(&self, kind: TaskKind, priority: Priority) {
    self.ctx.queue.push(FetchTask::new(self.account.id.clone(), kind, priority));
  }

  fn push_calendar_delta(&self) {
    self.push(
      TaskKind::CalDavDelta {
        calendar_id: "primary".to_string(),
        sync_token: self.sync_state.calendar_sync_token.clone(),
        window_start: Some(self.account.recent_window_start(Utc::now())),
      },
      Priority::Incremental,
    );
  }

  /// Shared select loop for Priming and Live.
  async fn run_event_loop(&mut self) {
    let email_poll = Duration::from_secs(self.ctx.config.sync.email_poll_interval_secs);
    let calendar_poll = Duration::from_secs(self.ctx.config.sync.calendar_poll_interval_secs);

    let mut email_tick = tokio::time::interval(email_poll);
    let mut calendar_tick = tokio::time::interval(calendar_poll);
    // Backfill shares the (configurable) mail polling cadence.
    let mut backfill_tick = tokio::time::interval(email_poll);
    email_tick.tick().await;
    calendar_tick.tick().await;
    backfill_tick.tick().await;

    let entered = self.state;
    while self.state == entered && !self.cancel.is_cancelled() {
      tokio::select! {
        _ = self.cancel.cancelled() => return,
        Some(outcome) = self.outcomes.recv() => self.handle_outcome(outcome).await,
        Some(event) = self.idle_rx.recv() => self.handle_idle_event(event).await,
        Some(hint) = self.hints.recv() => self.handle_hint(hint).await,
        _ = email_tick.tick() => {
          if self.account.sync_email && self.state == AccountState::Live {
            self.queue_incremental();
          }
        }
        _ = calendar_tick.tick() => {
          if self.account.sync_calendar {
            self.push_calendar_delta();
          }
        }
        _ = backfill_tick.tick() => {
          if self.account.sync_email && self.state == AccountState::Live {
            self.queue_backfill();
          }
        }
      }
    }
  }

  /// Poll with exponential backoff until a fetch succeeds again.
  async fn run_degraded(&mut self) {
    warn!(
      "{} degraded, polling with {:?} backoff",
      self.account.id, self.degraded_backoff
    );

    while self.state == AccountState::Degraded && !self.cancel.is_cancelled() {
      tokio::select! {
        _ = self.cancel.cancelled() => return,
        Some(outcome) = self.outcomes.recv() => self.handle_outcome(outcome).await,
        Some(hint) = self.hints.recv() => self.handle_hint(hint).await,
        _ = tokio::time::sleep(self.degraded_backoff) => {
          self.queue_incremental();
          if self.account.sync_calendar {
            self.push_calendar_delta();
          }
          self.degraded_backoff = (self.degraded_backoff * 2).min(Duration::from_secs(60));
        }
      }
    }
  }

  /// No fetches until the external OAuth flow replaces credentials;
  /// probe once per poll interval so recovery is automatic.
  async fn run_needs_reauth(&mut self) {
    let probe = Duration::from_secs(self.ctx.config.sync.email_poll_interval_secs);

    while self.state == AccountState::NeedsReauth && !self.cancel.is_cancelled() {
      tokio::select! {
        _ = self.cancel.cancelled() => return,
        Some(hint) = self.hints.recv() => self.handle_hint(hint).await,
        _ = tokio::time::sleep(probe) => {
          if self.verify_auth().await.is_ok() {
            info!("credentials restored for {}", self.account.id);
            self.apply(StateEvent::AuthVerified).await;
            self.start_priming().await;
          }
        }
      }
    }
  }

  async fn run_disabled(&mut self) {
    while self.state == AccountState::Disabled && !self.cancel.is_cancelled() {
      tokio::select! {
        _ = self.cancel.cancelled() => return,
        Some(hint) = self.hints.recv() => self.handle_hint(hint).await,
      }
    }
  }

  async fn handle_outcome(&mut self, outcome: FetchOutcome) {
    match outcome {
      FetchOutcome::FoldersResolved { folders } => {
        let allowlist = &self.account.folders;
        let selected: Vec<_> = folders
          .into_iter()
          .filter(|f| allowlist.is_empty() || allowlist.iter().any(|name| name == &f.name))
          .collect();

        for info in &selected {
          let known = self.sync_state.folder(&info.name);
          if known.uid_validity != 0 && known.uid_validity != info.uid_validity {
            self.begin_epoch_remap(&info.name, info.uid_validity).await;
          } else {
            if known.uid_validity == 0 {
              self.sync_state.record_folder(&info.name, info.uid_validity, 0);
            }
            self.queue_priming_window(&info.name);
          }
        }

        self.folders = selected.iter().map(|f| f.name.clone()).collect();
        self.save_state();
      }

      FetchOutcome::MailCommitted {
        folder,
        uid_validity,
        count,
        max_uid,
        priority,
        poisoned,
      } => {
        self.degraded_backoff = Duration::from_secs(1);
        let known = self.sync_state.folder(&folder);
        if uid_validity != 0 && known.uid_validity != 0 && known.uid_validity != uid_validity {
          // The server rolled the folder's epoch between two syncs.
          self.begin_epoch_remap(&folder, uid_validity).await;
        } else if uid_validity != 0 {
          self.sync_state.record_folder(&folder, uid_validity, max_uid);
        }
        for uid in poisoned {
          warn!("quarantining {}/{} uid {}", self.account.id, folder, uid);
          self.sync_state.quarantine(&folder, uid);
        }

        self.account.last_email_sync = Some(Utc::now());
        self.persist_account().await;
        self.save_state();
        debug!(
          "{}: committed {} mail items from {} ({:?})",
          self.account.id, count, folder, priority
        );

        if self.awaiting_first_commit {
          self.awaiting_first_commit = false;
          self.apply(StateEvent::FirstBatchCommitted).await;
          self.spawn_idle_listeners();
        }
        if self.state == AccountState::Degraded {
          self.apply(StateEvent::Recovered).await;
          self.spawn_idle_listeners();
        }
      }

      FetchOutcome::BackfillPlanned {
        folder,
        window_start,
        scheduled,
      } => {
        debug!(
          "{}: backfill window for {} reaches {} ({} messages)",
          self.account.id, folder, window_start, scheduled
        );
        self.sync_state.backfill_cursor = Some(window_start);
        self.save_state();
      }

      FetchOutcome::CalendarCommitted {
        calendar_id,
        count,
        deleted,
        next_sync_token,
      } => {
        self.degraded_backoff = Duration::from_secs(1);
        if let Some(token) = next_sync_token {
          self.sync_state.calendar_sync_token = Some(token);
        }
        self.account.last_calendar_sync = Some(Utc::now());
        self.persist_account().await;
        self.save_state();
        debug!(
          "{}: calendar {} commit ({} changed, {} deleted)",
          self.account.id, calendar_id, count, deleted
        );

        if self.awaiting_first_commit && (count > 0 || deleted > 0) {
          self.awaiting_first_commit = false;
          self.apply(StateEvent::FirstBatchCommitted).await;
          self.spawn_idle_listeners();
        }
        if self.state == AccountState::Degraded {
          self.apply(StateEvent::Recovered).await;
          self.spawn_idle_listeners();
        }
      }

      FetchOutcome::AttachmentSaved { mail_id, filename, .. } => {
        debug!("{}: attachment {} for {} saved", self.account.id, filename, mail_id);
      }

      FetchOutcome::Failed {
        task,
        reason,
        transient,
        auth,
      } => {
        if auth {
          error!("{}: auth failure on {}: {}", self.account.id, task.kind.label(), reason);
          self.apply(StateEvent::AuthFailed).await;
          return;
        }

        // An expired calendar cursor means restart without a token.
        if let TaskKind::CalDavDelta { .. } = task.kind {
          if reason.contains("sync token expired") {
            self.sync_state.calendar_sync_token = None;
            self.save_state();
            self.push_calendar_delta();
            return;
          }
        }

        if transient && task.attempt < MAX_TASK_ATTEMPTS {
          let mut retry = *task;
          retry.attempt += 1;
          let delay = Duration::from_secs(1 << retry.attempt.min(6));
          let label = retry.kind.label();
          self.sync_state.bump_retry(label);
          self.save_state();
          warn!(
            "{}: {} failed ({}), retry {} in {:?}",
            self.account.id, label, reason, retry.attempt, delay
          );

          let queue = Arc::clone(&self.ctx.queue);
          let cancel = self.cancel.clone();
          tokio::spawn(async move {
            tokio::select! {
              _ = cancel.cancelled() => {}
              _ = tokio::time::sleep(delay) => queue.push(retry),
            }
          });
        } else {
          error!(
            "{}: dropping {} after {} attempts: {}",
            self.account.id,
            task.kind.label(),
            task.attempt,
            reason
          );
        }
      }
    }
  }

  async fn handle_idle_event(&mut self, event: IdleEvent) {
    match event.kind {
      IdleEventKind::Changed => {
        self.consecutive_drops = 0;
        debug!("{}: idle push on {}", self.account.id, event.folder);
        let watermark = self.sync_state.folder(&event.folder).last_seen_uid;
        self.push(
          TaskKind::EnvelopeBatch {
            folder: event.folder,
            selection: UidSelection::After(watermark),
          },
          Priority::Incremental,
        );
      }
      IdleEventKind::Disconnected => {
        self.consecutive_drops += 1;
        if self.consecutive_drops >= DEGRADE_AFTER_DROPS && self.state == AccountState::Live {
          self.consecutive_drops = 0;
          self.stop_idle_listeners();
          self.degraded_backoff = Duration::from_secs(1);
          self.apply(StateEvent::RepeatedDisconnects).await;
        }
      }
    }
  }

  async fn handle_hint(&mut self, hint: MutationHint) {
    match hint {
      MutationHint::MailSent => {
        debug!("{}: mutation hint, pulling Sent", self.account.id);
        self.push(
          TaskKind::EnvelopeBatch {
            folder: "[Gmail]/Sent Mail".to_string(),
            selection: UidSelection::After(self.sync_state.folder("[Gmail]/Sent Mail").last_seen_uid),
          },
          Priority::Incremental,
        );
      }
      MutationHint::CalendarChanged { provider_event_id } => match provider_event_id {
        Some(id) => self.push(
          TaskKind::CalDavEvent {
            calendar_id: "primary".to_string(),
            provider_event_id: id,
          },
          Priority::Incremental,
        ),
        None => self.push_calendar_delta(),
      },
      MutationHint::TriggerSync => {
        self.queue_incremental();
        if self.account.sync_calendar {
          self.push_calendar_delta();
        }
      }
      MutationHint::Disable => {
        self.quiesce().await;
        self.apply(StateEvent::OperatorDisabled).await;
      }
      MutationHint::Enable => {
        self.apply(StateEvent::OperatorEnabled).await;
      }
    }
  }

  /// Recent window plus unread/flagged, minus poisoned UIDs, batched.
  fn queue_priming_window(&self, folder: &str) {
    let since = self.account.recent_window_start(Utc::now());
    let folder = folder.to_string();
    let account_id = self.account.id.clone();
    let queue = Arc::clone(&self.ctx.queue);
    let adapters = self.ctx.adapters.mail(&account_id);
    let poison: std::collections::BTreeSet<u32> = self
      .sync_state
      .poison_uids
      .get(&folder)
      .cloned()
      .unwrap_or_default();

    // The searches are cheap single round-trips; run them off-loop and
    // enqueue envelope batches as they resolve.
    tokio::spawn(async move {
      let adapter = match adapters {
        Ok(adapter) => adapter,
        Err(e) => {
          warn!("{}: no mail adapter: {}", account_id, e);
          return;
        }
      };

      let recent = adapter.search_since(&folder, since, None).await.unwrap_or_default();
      let special = adapter.search_unread_or_flagged(&folder).await.unwrap_or_default();

      let mut uids: Vec<u32> = recent
        .into_iter()
        .chain(special)
        .filter(|uid| !poison.contains(uid))
        .collect();
      uids.sort_unstable_by(|a, b| b.cmp(a));
      uids.dedup();

      info!("{}/{}: priming {} messages", account_id, folder, uids.len());
      for chunk in uids.chunks(PRIMING_BATCH) {
        queue.push(FetchTask::new(
          account_id.clone(),
          TaskKind::EnvelopeBatch {
            folder: folder.clone(),
            selection: UidSelection::Explicit(chunk.to_vec()),
          },
          Priority::RecentWindow,
        ));
      }
    });
  }

  /// Re-key a folder after a UIDVALIDITY rollover: refetch the tracked
  /// window under the new epoch, then sweep rows still on the old one.
  async fn begin_epoch_remap(&mut self, folder: &str, new_validity: u32) {
    warn!(
      "{}/{}: UIDVALIDITY changed to {}, remapping",
      self.account.id, folder, new_validity
    );
    self.sync_state.reset_folder_epoch(folder, new_validity);
    self.save_state();

    let since = self.account.recent_window_start(Utc::now());
    let account_id = self.account.id.clone();
    let folder = folder.to_string();
    let ctx = Arc::clone(&self.ctx);

    tokio::spawn(async move {
      let adapter = match ctx.adapters.mail(&account_id) {
        Ok(adapter) => adapter,
        Err(_) => return,
      };

      let mut uids = adapter.search_since(&folder, since, None).await.unwrap_or_default();
      let special = adapter.search_unread_or_flagged(&folder).await.unwrap_or_default();
      uids.extend(special);
      uids.sort_unstable_by(|a, b| b.cmp(a));
      uids.dedup();

      let items = match adapter.fetch_bodies(&folder, &uids).await {
        Ok(items) => items,
        Err(e) => {
          warn!("{}/{}: remap fetch failed: {}", account_id, folder, e);
          return;
        }
      };

      let mapping: HashMap<String, u32> = items.iter().map(|i| (i.message_id.clone(), i.uid)).collect();
      let alias = ctx.config.alias_for(&account_id).map(|s| s.to_string());

      // Upserts re-key survivors to the new epoch; the remap op sweeps
      // anything the new epoch no longer contains. Invalidation drains
      // before new UIDs commit because both ride the same writer batch,
      // applied updates-then-deletes.
      if let Err(e) = ctx.ingest.process_mail(items, alias.as_deref()).await {
        warn!("{}/{}: remap ingest failed: {}", account_id, folder, e);
        return;
      }
      if let Err(e) = ctx
        .writer
        .submit_and_wait(WriteOp::RemapFolder {
          account_id: account_id.clone(),
          folder: folder.clone(),
          new_validity,
          mapping,
        })
        .await
      {
        warn!("{}/{}: remap sweep failed: {}", account_id, folder, e);
      }
    });
  }

  fn queue_incremental(&self) {
    let folders: Vec<String> = if self.folders.is_empty() {
      vec!["INBOX".to_string()]
    } else {
      self.folders.clone()
    };
    for folder in folders {
      let watermark = self.sync_state.folder(&folder).last_seen_uid;
      self.push(
        TaskKind::EnvelopeBatch {
          folder,
          selection: UidSelection::After(watermark),
        },
        Priority::Incremental,
      );
    }
  }

  fn queue_backfill(&mut self) {
    let cursor = self
      .sync_state
      .backfill_cursor
      .unwrap_or_else(|| self.account.recent_window_start(Utc::now()));
    if cursor <= self.backfill_floor {
      return;
    }
    self.push(
      TaskKind::BackfillWindow {
        folder: "INBOX".to_string(),
        before: cursor,
        floor: self.backfill_floor,
      },
      Priority::Backfill,
    );
  }

  fn spawn_idle_listeners(&mut self) {
    if !self.ctx.config.sync.email_idle_enabled || !self.account.sync_email {
      return;
    }
    if self.idle_cancel.is_some() {
      return;
    }
    let Ok(adapter) = self.ctx.adapters.mail(&self.account.id) else {
      return;
    };

    let cancel = self.cancel.child_token();
    let folders: Vec<String> = if self.folders.is_empty() {
      vec!["INBOX".to_string()]
    } else {
      self.folders.clone()
    };
    for folder in folders {
      IdleListener::new(
        self.account.id.clone(),
        folder,
        Arc::clone(&adapter),
        self.idle_tx.clone(),
        cancel.clone(),
      )
      .spawn();
    }
    self.idle_cancel = Some(cancel);
  }

  fn stop_idle_listeners(&mut self) {
    if let Some(cancel) = self.idle_cancel.take() {
      cancel.cancel();
    }
  }

  /// Apply a state event, persisting the visible account status when it
  /// changes.
  async fn apply(&mut self, event: StateEvent) {
    let next = self.state.transition(event);
    if next != self.state {
      info!("{}: {:?} -> {:?} on {:?}", self.account.id, self.state, next, event);
      self.state = next;
      self.account.status = next.account_status();
      self.persist_account().await;
      if matches!(next, AccountState::NeedsReauth | AccountState::Disabled) {
        self.quiesce_tasks();
      }
    }
  }

  async fn persist_account(&self) {
    self
      .ctx
      .writer
      .submit(WriteOp::UpsertAccount(Box::new(self.account.clone())))
      .await;
  }

  fn save_state(&self) {
    if let Err(e) = self.sync_state.save(&self.ctx.state_dir) {
      warn!("{}: failed to save sync state: {}", self.account.id, e);
    }
  }

  fn quiesce_tasks(&self) {
    let dropped = self.ctx.queue.cancel_account(&self.account.id);
    if dropped > 0 {
      debug!("{}: cancelled {} queued tasks", self.account.id, dropped);
    }
  }

  async fn quiesce(&mut self) {
    self.stop_idle_listeners();
    self.quiesce_tasks();
    self.save_state();
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_transitions_cover_lifecycle() {
    use AccountState::*;
    use StateEvent::*;

    assert_eq!(Init.transition(AuthVerified), Priming);
    assert_eq!(Priming.transition(FirstBatchCommitted), Live);
    assert_eq!(Live.transition(RepeatedDisconnects), Degraded);
    assert_eq!(Degraded.transition(Recovered), Live);
    assert_eq!(NeedsReauth.transition(AuthVerified), Priming);
  }

  #[test]
  fn test_auth_failure_parks_from_any_active_state() {
    use AccountState::*;
    for state in [Init, Priming, Live, Degraded] {
      assert_eq!(state.transition(StateEvent::AuthFailed), NeedsReauth);
    }
  }

  #[test]
  fn test_disabled_is_sticky_until_enabled() {
    use AccountState::*;
    use StateEvent::*;

    let disabled = Live.transition(OperatorDisabled);
    assert_eq!(disabled, Disabled);
    assert_eq!(disabled.transition(AuthVerified), Disabled);
    assert_eq!(disabled.transition(FirstBatchCommitted), Disabled);
    assert_eq!(disabled.transition(OperatorEnabled), Init);
  }

  #[test]
  fn test_unlisted_pairs_stay_put() {
    use AccountState::*;
    use StateEvent::*;

    assert_eq!(Live.transition(AuthVerified), Live);
    assert_eq!(Init.transition(FirstBatchCommitted), Init);
    assert_eq!(Priming.transition(Recovered), Priming);
  }

  #[test]
  fn test_status_mapping() {
    assert_eq!(AccountState::Priming.account_status(), AccountStatus::Syncing);
    assert_eq!(AccountState::Live.account_status(), AccountStatus::Active);
    assert_eq!(AccountState::Degraded.account_status(), AccountStatus::Active);
    assert_eq!(AccountState::NeedsReauth.account_status(), AccountStatus::NeedsReauth);
  }
}
