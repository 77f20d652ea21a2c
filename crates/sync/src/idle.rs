//! IDLE listeners.
//!
//! One long-running task per (account, folder) holding its own IMAP
//! connection. Listeners only publish to a channel; the orchestrator
//! owns the reaction. Disconnects back off 1,2,4,...,60 s and are
//! reported so the orchestrator can degrade to polling after repeated
//! drops.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::imap::{MailAdapter, MailboxEvent};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IdleEventKind {
  /// Server pushed a mailbox change
  Changed,
  /// The connection dropped; the listener will retry
  Disconnected,
}

#[derive(Debug, Clone)]
pub struct IdleEvent {
  pub account_id: String,
  pub folder: String,
  pub kind: IdleEventKind,
}

pub struct IdleListener {
  account_id: String,
  folder: String,
  adapter: Arc<dyn MailAdapter>,
  events: mpsc::Sender<IdleEvent>,
  cancel: CancellationToken,
}

impl IdleListener {
  pub fn new(
    account_id: impl Into<String>,
    folder: impl Into<String>,
    adapter: Arc<dyn MailAdapter>,
    events: mpsc::Sender<IdleEvent>,
    cancel: CancellationToken,
  ) -> Self {
    Self {
      account_id: account_id.into(),
      folder: folder.into(),
      adapter,
      events,
      cancel,
    }
  }

  pub fn spawn(self) -> tokio::task::JoinHandle<()> {
    tokio::spawn(self.run())
  }

  async fn run(self) {
    let mut backoff = Duration::from_secs(1);
    info!("idle listener starting for {}/{}", self.account_id, self.folder);

    loop {
      let wait = self.adapter.idle(&self.folder);
      tokio::select! {
        _ = self.cancel.cancelled() => {
          debug!("idle listener for {}/{} cancelled", self.account_id, self.folder);
          return;
        }
        result = wait => match result {
          Ok(MailboxEvent::Changed) => {
            backoff = Duration::from_secs(1);
            if self.send(IdleEventKind::Changed).await.is_err() {
              return;
            }
          }
          Ok(MailboxEvent::Timeout) => {
            // Quiet window; re-issue immediately.
            backoff = Duration::from_secs(1);
          }
          Err(e) => {
            warn!("idle drop on {}/{}: {}", self.account_id, self.folder, e);
            if self.send(IdleEventKind::Disconnected).await.is_err() {
              return;
            }
            tokio::select! {
              _ = self.cancel.cancelled() => return,
              _ = tokio::time::sleep(backoff) => {}
            }
            backoff = (backoff * 2).min(Duration::from_secs(60));
          }
        }
      }
    }
  }

  async fn send(&self, kind: IdleEventKind) -> Result<(), ()> {
    self
      .events
      .send(IdleEvent {
        account_id: self.account_id.clone(),
        folder: self.folder.clone(),
        kind,
      })
      .await
      .map_err(|_| ())
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::testing::MockMailAdapter;

  #[tokio::test]
  async fn test_listener_publishes_on_push() {
    let adapter = Arc::new(MockMailAdapter::new());
    adapter.ensure_folder("INBOX", 1);

    let (tx, mut rx) = mpsc::channel(8);
    let cancel = CancellationToken::new();
    let handle = IdleListener::new("a@x.test", "INBOX", adapter.clone(), tx, cancel.clone()).spawn();

    adapter.push_idle_change("INBOX");
    let event = tokio::time::timeout(Duration::from_secs(1), rx.recv())
      .await
      .unwrap()
      .unwrap();
    assert_eq!(event.kind, IdleEventKind::Changed);
    assert_eq!(event.folder, "INBOX");

    cancel.cancel();
    handle.await.unwrap();
  }

  #[tokio::test]
  async fn test_listener_reports_disconnects() {
    let adapter = Arc::new(MockMailAdapter::new());
    adapter.ensure_folder("INBOX", 1);
    adapter.fail_idle(true);

    let (tx, mut rx) = mpsc::channel(8);
    let cancel = CancellationToken::new();
    let handle = IdleListener::new("a@x.test", "INBOX", adapter.clone(), tx, cancel.clone()).spawn();

    let event = tokio::time::timeout(Duration::from_secs(1), rx.recv())
      .await
      .unwrap()
      .unwrap();
    assert_eq!(event.kind, IdleEventKind::Disconnected);

    cancel.cancel();
    handle.await.unwrap();
  }
}
