//! Pending mutations, their lifecycle and the handle given to submitters.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::watch;

use crate::error::ApiError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MutationStatus {
  Pending,
  InFlight,
  /// Waiting for connectivity
  Paused,
  /// Permanent failure, kept until dismissed
  Failed,
  Succeeded,
}

/// Inputs to the mutation state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MutationEvent {
  Dispatch,
  Succeed,
  /// Retryable failure with budget left and connectivity up
  RetryLater,
  /// Execution gated by connectivity
  Pause,
  Fail,
  /// Connectivity came back
  Resume,
  /// Reloaded after a process restart
  Restart,
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("invalid transition: {event:?} while {from:?}")]
pub struct InvalidTransition {
  pub from: MutationStatus,
  pub event: MutationEvent,
}

impl MutationStatus {
  pub fn apply(self, event: MutationEvent) -> Result<MutationStatus, InvalidTransition> {
    use MutationEvent::*;
    use MutationStatus::*;

    let next = match (self, event) {
      (Pending, Dispatch) => InFlight,
      (Pending, Pause) => Paused,
      (InFlight, Succeed) => Succeeded,
      (InFlight, RetryLater) => Pending,
      (InFlight, Pause) => Paused,
      (InFlight, Fail) => Failed,
      (Paused, Resume) => Pending,
      (Pending | InFlight | Paused, Restart) => Pending,
      (from, event) => return Err(InvalidTransition { from, event }),
    };
    Ok(next)
  }

  pub fn is_settled(&self) -> bool {
    matches!(self, MutationStatus::Failed | MutationStatus::Succeeded)
  }

  /// Still waiting to reach the backend.
  pub fn is_live(&self) -> bool {
    matches!(
      self,
      MutationStatus::Pending | MutationStatus::InFlight | MutationStatus::Paused
    )
  }

  pub fn label(&self) -> &'static str {
    match self {
      MutationStatus::Pending => "pending",
      MutationStatus::InFlight => "in flight",
      MutationStatus::Paused => "paused",
      MutationStatus::Failed => "failed",
      MutationStatus::Succeeded => "succeeded",
    }
  }
}

/// A queued write, persisted until it settles.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingMutation {
  pub id: u64,
  /// Mutations sharing a scope execute one at a time, in id order
  pub scope: String,
  pub name: String,
  pub payload: Value,
  pub created_at: DateTime<Utc>,
  #[serde(default)]
  pub attempt_count: u32,
  pub status: MutationStatus,
  #[serde(default)]
  pub last_error: Option<String>,
}

impl PendingMutation {
  /// Id of the synthetic record standing in for this mutation.
  pub fn local_id(&self) -> String {
    format!("local-{}", self.id)
  }
}

/// Point-in-time view published on a [`MutationHandle`].
#[derive(Debug, Clone, PartialEq)]
pub struct MutationSnapshot {
  pub status: MutationStatus,
  pub attempt_count: u32,
  pub error: Option<String>,
}

impl MutationSnapshot {
  pub(crate) fn of(mutation: &PendingMutation) -> Self {
    Self {
      status: mutation.status,
      attempt_count: mutation.attempt_count,
      error: mutation.last_error.clone(),
    }
  }
}

/// Observes one mutation's progress.
#[derive(Debug, Clone)]
pub struct MutationHandle {
  id: u64,
  rx: watch::Receiver<MutationSnapshot>,
}

impl MutationHandle {
  pub(crate) fn new(id: u64, rx: watch::Receiver<MutationSnapshot>) -> Self {
    Self { id, rx }
  }

  pub fn id(&self) -> u64 {
    self.id
  }

  pub fn status(&self) -> MutationStatus {
    self.rx.borrow().status
  }

  /// Message of the last error, verbatim from the backend for client errors.
  pub fn error(&self) -> Option<String> {
    self.rx.borrow().error.clone()
  }

  /// Wait until the mutation succeeds or fails permanently. Returns the last
  /// known snapshot if the queue drops the mutation first.
  pub async fn settled(&self) -> MutationSnapshot {
    let mut rx = self.rx.clone();
    let settled = rx
      .wait_for(|snapshot| snapshot.status.is_settled())
      .await
      .map(|snapshot| snapshot.clone())
      .ok();
    settled.unwrap_or_else(|| rx.borrow().clone())
  }
}

/// Retry budget and timings for mutation execution.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
  /// Retries allowed after the first attempt
  pub max_retries: u32,
  pub base_delay: Duration,
  pub max_delay: Duration,
  pub request_timeout: Duration,
}

impl Default for RetryPolicy {
  fn default() -> Self {
    Self {
      max_retries: 3,
      base_delay: Duration::from_secs(1),
      max_delay: Duration::from_secs(30),
      request_timeout: Duration::from_secs(15),
    }
  }
}

impl RetryPolicy {
  /// Delay before retry number `attempt` (1-based): `min(base * 2^(n-1), cap)`.
  pub fn backoff(&self, attempt: u32) -> Duration {
    let exponent = attempt.saturating_sub(1).min(31);
    self
      .base_delay
      .checked_mul(1u32 << exponent)
      .map_or(self.max_delay, |delay| delay.min(self.max_delay))
  }

  pub fn is_exhausted(&self, attempt_count: u32) -> bool {
    attempt_count > self.max_retries
  }
}

#[derive(Debug, Clone)]
pub enum SettlementOutcome {
  /// The backend accepted the write and returned the created entity
  Succeeded(Value),
  Failed(ApiError),
}

/// A mutation reaching a terminal state.
#[derive(Debug, Clone)]
pub struct Settlement {
  pub mutation: PendingMutation,
  pub outcome: SettlementOutcome,
}

impl Settlement {
  pub fn is_success(&self) -> bool {
    matches!(self.outcome, SettlementOutcome::Succeeded(_))
  }
}

/// Observer of queue lifecycle events.
///
/// Called synchronously from the queue, outside its internal lock.
pub trait SettlementListener: Send + Sync {
  /// A live mutation entered the queue: freshly enqueued, or reloaded on
  /// resume. Runs before the mutation is dispatched.
  fn on_accepted(&self, mutation: &PendingMutation);

  fn on_settled(&self, settlement: &Settlement);
}
