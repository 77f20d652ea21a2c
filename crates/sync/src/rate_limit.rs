//! Process-wide rate limiting for Google API traffic.
//!
//! One global token bucket (10 req/s by default) shared by every account
//! and task kind, with per-account sub-buckets carved underneath it, a
//! separate 100/min budget for backfill, and two named concurrency
//! permits: one IMAP control channel per account and at most three
//! large-body fetches in flight across all accounts. Server Retry-After
//! values push the bucket's earliest refill forward; waiters queue FIFO.

use governor::clock::DefaultClock;
use governor::state::{InMemoryState, NotKeyed};
use governor::{Quota, RateLimiter as GovernorLimiter};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use groundeffect_core::{Error, Result};

type DirectLimiter = GovernorLimiter<NotKeyed, InMemoryState, DefaultClock>;

const LARGE_BODY_PERMITS: usize = 3;
const BACKFILL_PER_MINUTE: u32 = 100;

pub struct RateLimiter {
  global: DirectLimiter,
  per_account: Mutex<HashMap<String, Arc<DirectLimiter>>>,
  backfill: DirectLimiter,
  per_second: u32,
  /// Earliest instant the global bucket refills again (Retry-After)
  suspended_until: Mutex<Option<Instant>>,
  /// FIFO ordering for global waiters
  fifo: tokio::sync::Mutex<()>,
  control_channels: Mutex<HashMap<String, Arc<Semaphore>>>,
  large_body: Arc<Semaphore>,
}

impl RateLimiter {
  pub fn new(requests_per_second: u32) -> Self {
    let per_second = NonZeroU32::new(requests_per_second).unwrap_or(NonZeroU32::new(10).unwrap());
    // Burst of one: acquisitions space out evenly, so no sliding
    // one-second window ever exceeds the configured rate.
    let global_quota = Quota::per_second(per_second).allow_burst(NonZeroU32::new(1).unwrap());
    Self {
      global: GovernorLimiter::direct(global_quota),
      per_account: Mutex::new(HashMap::new()),
      backfill: GovernorLimiter::direct(Quota::per_minute(NonZeroU32::new(BACKFILL_PER_MINUTE).unwrap())),
      per_second: per_second.get(),
      suspended_until: Mutex::new(None),
      fifo: tokio::sync::Mutex::new(()),
      control_channels: Mutex::new(HashMap::new()),
      large_body: Arc::new(Semaphore::new(LARGE_BODY_PERMITS)),
    }
  }

  /// Acquire one global token.
  pub async fn acquire(&self) -> Result<()> {
    self.acquire_n(1, None, None).await
  }

  /// Acquire one token from the account's sub-bucket and the global
  /// bucket, in that order.
  pub async fn acquire_for(&self, account_id: &str) -> Result<()> {
    let bucket = self.account_bucket(account_id);
    bucket.until_ready().await;
    self.acquire_n(1, None, None).await
  }

  /// Acquire `n` tokens, optionally bounded by a deadline and a
  /// cancellation signal. Waiters are served in arrival order.
  pub async fn acquire_n(&self, n: u32, deadline: Option<Instant>, cancel: Option<&CancellationToken>) -> Result<()> {
    let n = NonZeroU32::new(n.max(1)).unwrap();

    let wait = async {
      // The queue mutex makes the whole acquisition FIFO-fair.
      let _slot = self.fifo.lock().await;
      self.wait_suspension().await;
      self
        .global
        .until_n_ready(n)
        .await
        .map_err(|e| Error::BadRequest(format!("request exceeds bucket capacity: {}", e)))
    };

    match (deadline, cancel) {
      (Some(deadline), Some(cancel)) => {
        tokio::select! {
          result = tokio::time::timeout_at(deadline.into(), wait) => {
            result.map_err(|_| Error::RateLimited { retry_after_secs: 0 })?
          }
          _ = cancel.cancelled() => Err(Error::Cancelled),
        }
      }
      (Some(deadline), None) => tokio::time::timeout_at(deadline.into(), wait)
        .await
        .map_err(|_| Error::RateLimited { retry_after_secs: 0 })?,
      (None, Some(cancel)) => {
        tokio::select! {
          result = wait => result,
          _ = cancel.cancelled() => Err(Error::Cancelled),
        }
      }
      (None, None) => wait.await,
    }
  }

  /// One token from the backfill budget (100 messages/minute) plus the
  /// global bucket.
  pub async fn acquire_backfill(&self) -> Result<()> {
    self.backfill.until_ready().await;
    self.acquire().await
  }

  /// Honour a server Retry-After by pushing the earliest refill out.
  pub fn suspend_for(&self, duration: Duration) {
    let until = Instant::now() + duration;
    let mut suspended = self.suspended_until.lock();
    let later = match *suspended {
      Some(existing) => existing.max(until),
      None => until,
    };
    *suspended = Some(later);
    warn!("rate limiter suspended for {:?}", duration);
  }

  async fn wait_suspension(&self) {
    loop {
      let wait = {
        let mut suspended = self.suspended_until.lock();
        match *suspended {
          Some(until) => {
            let now = Instant::now();
            if until <= now {
              *suspended = None;
              None
            } else {
              Some(until - now)
            }
          }
          None => None,
        }
      };
      match wait {
        Some(duration) => tokio::time::sleep(duration).await,
        None => return,
      }
    }
  }

  fn account_bucket(&self, account_id: &str) -> Arc<DirectLimiter> {
    let mut buckets = self.per_account.lock();
    Arc::clone(buckets.entry(account_id.to_string()).or_insert_with(|| {
      debug!("creating rate bucket for {}", account_id);
      Arc::new(GovernorLimiter::direct(Quota::per_second(
        NonZeroU32::new(self.per_second).unwrap(),
      )))
    }))
  }

  /// The single IMAP control-channel permit for an account.
  pub fn control_channel(&self, account_id: &str) -> Arc<Semaphore> {
    let mut channels = self.control_channels.lock();
    Arc::clone(
      channels
        .entry(account_id.to_string())
        .or_insert_with(|| Arc::new(Semaphore::new(1))),
    )
  }

  /// Global large-body fetch permits (3 across all accounts).
  pub fn large_body(&self) -> Arc<Semaphore> {
    Arc::clone(&self.large_body)
  }

  /// Non-blocking probe, used by status reporting.
  pub fn check(&self) -> bool {
    self.global.check().is_ok()
  }
}

impl Default for RateLimiter {
  fn default() -> Self {
    Self::new(10)
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[tokio::test]
  async fn test_no_window_exceeds_limit() {
    // 5/s limit, 12 acquisitions: every sliding 1 s window must hold <= 5.
    let limiter = RateLimiter::new(5);
    let mut stamps = Vec::new();

    for _ in 0..12 {
      limiter.acquire().await.unwrap();
      stamps.push(Instant::now());
    }

    for (i, &start) in stamps.iter().enumerate() {
      let in_window = stamps[i..]
        .iter()
        .take_while(|&&t| t.duration_since(start) < Duration::from_secs(1))
        .count();
      assert!(in_window <= 5, "window starting at sample {} held {}", i, in_window);
    }
  }

  #[tokio::test]
  async fn test_retry_after_suspends_bucket() {
    let limiter = RateLimiter::new(100);
    limiter.acquire().await.unwrap();

    limiter.suspend_for(Duration::from_millis(300));
    let start = Instant::now();
    limiter.acquire().await.unwrap();
    assert!(start.elapsed() >= Duration::from_millis(300));
  }

  #[tokio::test]
  async fn test_deadline_expires() {
    let limiter = RateLimiter::new(100);
    limiter.suspend_for(Duration::from_secs(5));

    let deadline = Instant::now() + Duration::from_millis(50);
    let err = limiter.acquire_n(1, Some(deadline), None).await.unwrap_err();
    assert!(matches!(err, Error::RateLimited { .. }));
  }

  #[tokio::test]
  async fn test_cancellation_releases_waiter() {
    let limiter = Arc::new(RateLimiter::new(100));
    limiter.suspend_for(Duration::from_secs(5));

    let cancel = CancellationToken::new();
    let child = cancel.child_token();
    let task = {
      let limiter = Arc::clone(&limiter);
      tokio::spawn(async move { limiter.acquire_n(1, None, Some(&child)).await })
    };

    tokio::time::sleep(Duration::from_millis(50)).await;
    cancel.cancel();
    let result = task.await.unwrap();
    assert!(matches!(result, Err(Error::Cancelled)));
  }

  #[tokio::test]
  async fn test_control_channel_is_exclusive() {
    let limiter = RateLimiter::new(10);
    let channel = limiter.control_channel("a@x.test");

    let held = channel.clone().try_acquire_owned().unwrap();
    assert!(channel.try_acquire().is_err());
    drop(held);
    assert!(channel.try_acquire().is_ok());

    // Different account, different channel.
    assert!(limiter.control_channel("b@y.test").try_acquire().is_ok());
  }

  #[tokio::test]
  async fn test_large_body_cap() {
    let limiter = RateLimiter::new(10);
    let semaphore = limiter.large_body();
    let _one = semaphore.clone().try_acquire_owned().unwrap();
    let _two = semaphore.clone().try_acquire_owned().unwrap();
    let _three = semaphore.clone().try_acquire_owned().unwrap();
    assert!(semaphore.try_acquire().is_err());
  }
}
