//! Durable mutation queue.
//!
//! Writes submitted by the user are persisted, executed per scope in order,
//! retried with exponential backoff on transient failures and paused while
//! the backend cannot be reached.

mod mutation;
mod persist;
mod runner;

pub use mutation::{
  InvalidTransition, MutationEvent, MutationHandle, MutationSnapshot, MutationStatus,
  PendingMutation, RetryPolicy, Settlement, SettlementListener, SettlementOutcome,
};
pub use runner::MutationQueue;
