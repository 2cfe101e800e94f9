//! Run-wide cancellation.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::watch;

/// Why a run was cancelled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CancelReason {
  /// Interrupted from outside (Ctrl-C, caller request).
  Interrupted,
  /// A unit failed and fail-fast is enabled.
  FailFast,
}

/// Cloneable cancellation token shared by the scheduler, workers and the
/// process runner. The first reason set wins.
#[derive(Debug, Clone)]
pub struct CancelToken {
  tx: Arc<watch::Sender<Option<CancelReason>>>,
}

impl Default for CancelToken {
  fn default() -> Self {
    Self::new()
  }
}

impl CancelToken {
  pub fn new() -> Self {
    let (tx, _rx) = watch::channel(None);
    Self { tx: Arc::new(tx) }
  }

  /// Cancel with `reason`. Returns false if the token was already cancelled.
  pub fn cancel(&self, reason: CancelReason) -> bool {
    self.tx.send_if_modified(|current| {
      if current.is_some() {
        return false;
      }
      *current = Some(reason);
      true
    })
  }

  pub fn reason(&self) -> Option<CancelReason> {
    *self.tx.borrow()
  }

  pub fn is_cancelled(&self) -> bool {
    self.reason().is_some()
  }

  /// Resolves once the token is cancelled.
  pub async fn cancelled(&self) -> CancelReason {
    let mut rx = self.tx.subscribe();
    loop {
      if let Some(reason) = *rx.borrow_and_update() {
        return reason;
      }
      // The sender lives as long as any token clone, including `self`
      if rx.changed().await.is_err() {
        std::future::pending::<()>().await;
      }
    }
  }
}
