//! Error types shared by the sync engine.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Structured error body returned by the backend on non-success responses.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ApiErrorBody {
  #[serde(default)]
  pub error: String,
  #[serde(default)]
  pub message: Option<String>,
  #[serde(default)]
  pub details: Option<Value>,
}

impl ApiErrorBody {
  /// The message shown to the user: `message`, falling back to `error`.
  pub fn display_message(&self) -> &str {
    self
      .message
      .as_deref()
      .filter(|m| !m.is_empty())
      .unwrap_or(&self.error)
  }
}

/// Errors raised by the API gateway.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ApiError {
  /// The request never produced an HTTP response.
  #[error("network error: {0}")]
  Network(String),

  #[error("request timed out")]
  Timeout,

  /// 5xx response.
  #[error("server error {status}: {}", body.display_message())]
  Server { status: u16, body: ApiErrorBody },

  /// 4xx response. The message is surfaced to the user verbatim.
  #[error("{}", body.display_message())]
  Client { status: u16, body: ApiErrorBody },

  /// 2xx response whose body could not be understood.
  #[error("invalid response: {0}")]
  InvalidResponse(String),

  #[error("unknown mutation: {0}")]
  UnknownMutation(String),
}

impl ApiError {
  /// Build the error for a non-success HTTP status.
  pub fn from_status(status: u16, body: ApiErrorBody) -> Self {
    if status >= 500 {
      ApiError::Server { status, body }
    } else {
      ApiError::Client { status, body }
    }
  }

  /// Network errors, timeouts and 5xx responses are worth retrying.
  pub fn is_retryable(&self) -> bool {
    matches!(
      self,
      ApiError::Network(_) | ApiError::Timeout | ApiError::Server { .. }
    )
  }

  pub fn status(&self) -> Option<u16> {
    match self {
      ApiError::Server { status, .. } | ApiError::Client { status, .. } => Some(*status),
      _ => None,
    }
  }
}

/// Result type for durable storage operations.
pub type StoreResult<T> = Result<T, StoreError>;

/// Errors raised by the durable store and the layers persisting into it.
#[derive(Error, Debug)]
pub enum StoreError {
  #[error("sqlite error: {0}")]
  Sqlite(#[from] rusqlite::Error),

  #[error("serialization error: {0}")]
  Serialization(#[from] serde_json::Error),

  #[error("io error: {0}")]
  Io(#[from] std::io::Error),

  #[error("could not determine data directory")]
  NoDataDir,
}
