//! Sync status aggregation for the control socket and the query server.

use groundeffect_core::{AccountStats, Result, SyncStatus, TotalStats};
use std::sync::Arc;
use store::Store;

/// Per-account counters plus aggregate totals, straight from the store.
pub async fn build_sync_status(store: &Arc<Store>) -> Result<SyncStatus> {
  let accounts = store
    .list_accounts()
    .await
    .map_err(|e| groundeffect_core::Error::Store(e.to_string()))?;

  let mut stats = Vec::with_capacity(accounts.len());
  let mut totals = TotalStats::default();

  for account in &accounts {
    let email_count = store
      .count_mail(Some(&account.id))
      .await
      .map_err(|e| groundeffect_core::Error::Store(e.to_string()))?;
    let event_count = store
      .count_events(Some(&account.id))
      .await
      .map_err(|e| groundeffect_core::Error::Store(e.to_string()))?;

    totals.email_count += email_count;
    totals.event_count += event_count;

    stats.push(AccountStats {
      id: account.id.clone(),
      alias: account.alias.clone(),
      status: account.status,
      last_email_sync: account.last_email_sync,
      last_calendar_sync: account.last_calendar_sync,
      email_count,
      event_count,
    });
  }

  totals.index_size_mb = store.disk_usage_mb();

  Ok(SyncStatus {
    accounts: stats,
    totals,
  })
}
