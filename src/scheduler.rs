//! Deferred execution with cancellation.
//!
//! Every background task of the sync engine (backoff timers, the probe loop,
//! throttled cache writes, refetches) is spawned through a [`Scheduler`]. All
//! of them observe the scheduler's root token, so a single `shutdown()` stops
//! the whole engine.

use std::future::Future;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Default)]
pub struct Scheduler {
  root: CancellationToken,
}

impl Scheduler {
  pub fn new() -> Self {
    Self::default()
  }

  /// Run `task` now, unless the scheduler is shut down first.
  pub fn spawn<F>(&self, task: F) -> JoinHandle<()>
  where
    F: Future<Output = ()> + Send + 'static,
  {
    let token = self.root.clone();
    tokio::spawn(async move {
      tokio::select! {
        _ = token.cancelled() => {}
        _ = task => {}
      }
    })
  }

  /// Run `task` after `delay`. The returned token cancels just this task.
  pub fn defer<F>(&self, delay: Duration, task: F) -> CancellationToken
  where
    F: Future<Output = ()> + Send + 'static,
  {
    let token = self.root.child_token();
    let cancel = token.clone();
    tokio::spawn(async move {
      tokio::select! {
        _ = cancel.cancelled() => {}
        _ = async {
          tokio::time::sleep(delay).await;
          task.await;
        } => {}
      }
    });
    token
  }

  /// A token cancelled when the scheduler shuts down.
  pub fn token(&self) -> CancellationToken {
    self.root.child_token()
  }

  pub fn shutdown(&self) {
    self.root.cancel();
  }

  pub fn is_shutdown(&self) -> bool {
    self.root.is_cancelled()
  }
}
