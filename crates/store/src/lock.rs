//! Writer-lock discipline: at most one process opens the store writable.
//!
//! The lock is a PID file created exclusively. A stale file left by a
//! dead process is reclaimed; a live holder is reported by PID so the
//! daemon can print a useful diagnostic before exiting non-zero.

use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

use crate::connection::{Result, StoreError};

pub struct WriterLock {
  path: PathBuf,
}

impl WriterLock {
  /// Acquire the writer lock, reclaiming a stale file if its owner died.
  pub fn acquire(path: &Path) -> Result<Self> {
    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent)?;
    }

    match Self::try_create(path) {
      Ok(lock) => Ok(lock),
      Err(StoreError::WriterLockHeld { pid }) => {
        if process_alive(pid) {
          return Err(StoreError::WriterLockHeld { pid });
        }
        warn!("reclaiming stale writer lock left by pid {}", pid);
        std::fs::remove_file(path)?;
        Self::try_create(path)
      }
      Err(e) => Err(e),
    }
  }

  fn try_create(path: &Path) -> Result<Self> {
    match OpenOptions::new().write(true).create_new(true).open(path) {
      Ok(mut file) => {
        write!(file, "{}", std::process::id())?;
        info!("acquired writer lock at {:?}", path);
        Ok(Self { path: path.to_path_buf() })
      }
      Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
        let pid = std::fs::read_to_string(path)
          .ok()
          .and_then(|s| s.trim().parse::<u32>().ok())
          .unwrap_or(0);
        Err(StoreError::WriterLockHeld { pid })
      }
      Err(e) => Err(e.into()),
    }
  }

  pub fn path(&self) -> &Path {
    &self.path
  }
}

impl Drop for WriterLock {
  fn drop(&mut self) {
    if let Err(e) = std::fs::remove_file(&self.path) {
      warn!("failed to remove writer lock {:?}: {}", self.path, e);
    } else {
      info!("released writer lock");
    }
  }
}

fn process_alive(pid: u32) -> bool {
  if pid == 0 {
    return false;
  }
  // Signal 0 probes for existence without delivering anything.
  unsafe { libc::kill(pid as libc::pid_t, 0) == 0 }
}
