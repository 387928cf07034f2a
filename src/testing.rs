//! Test doubles shared by the engine's unit tests.

use futures::future::BoxFuture;
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use crate::api::{ApiGateway, Collection};
use crate::cache::CacheKey;
use crate::config::{ApiConfig, ConfigSource};
use crate::error::{ApiError, ApiErrorBody};

/// Scriptable in-memory backend.
///
/// Mutations pop queued responses first; once those run out they succeed
/// and the created record is appended to the matching collection.
pub struct FakeGateway {
  probe_ok: AtomicBool,
  probe_delay: Mutex<Duration>,
  probes: AtomicUsize,
  mutation_responses: Mutex<VecDeque<Result<Value, ApiError>>>,
  mutation_calls: Mutex<Vec<(String, Value)>>,
  mutation_delay: Mutex<Duration>,
  collections: Mutex<HashMap<String, Collection>>,
  fetches: AtomicUsize,
  created: AtomicUsize,
}

impl FakeGateway {
  pub fn new() -> Self {
    Self {
      probe_ok: AtomicBool::new(true),
      probe_delay: Mutex::new(Duration::ZERO),
      probes: AtomicUsize::new(0),
      mutation_responses: Mutex::new(VecDeque::new()),
      mutation_calls: Mutex::new(Vec::new()),
      mutation_delay: Mutex::new(Duration::ZERO),
      collections: Mutex::new(HashMap::new()),
      fetches: AtomicUsize::new(0),
      created: AtomicUsize::new(0),
    }
  }

  pub fn set_probe_ok(&self, ok: bool) {
    self.probe_ok.store(ok, Ordering::SeqCst);
  }

  pub fn set_probe_delay(&self, delay: Duration) {
    *self.probe_delay.lock() = delay;
  }

  pub fn probe_count(&self) -> usize {
    self.probes.load(Ordering::SeqCst)
  }

  pub fn push_mutation_response(&self, response: Result<Value, ApiError>) {
    self.mutation_responses.lock().push_back(response);
  }

  pub fn set_mutation_delay(&self, delay: Duration) {
    *self.mutation_delay.lock() = delay;
  }

  /// Every submitted mutation, in call order.
  pub fn mutation_calls(&self) -> Vec<(String, Value)> {
    self.mutation_calls.lock().clone()
  }

  pub fn set_collection(&self, resource: &str, items: Value) {
    let items = items.as_array().cloned().unwrap_or_default();
    self.collections.lock().insert(resource.to_string(), items);
  }

  pub fn fetch_count(&self) -> usize {
    self.fetches.load(Ordering::SeqCst)
  }
}

impl ApiGateway for FakeGateway {
  fn fetch_resource(&self, key: &CacheKey) -> BoxFuture<'static, Result<Collection, ApiError>> {
    self.fetches.fetch_add(1, Ordering::SeqCst);
    let items = self
      .collections
      .lock()
      .get(key.resource())
      .cloned()
      .unwrap_or_default();
    Box::pin(async move { Ok(items) })
  }

  fn submit_mutation(
    &self,
    name: &str,
    payload: &Value,
  ) -> BoxFuture<'static, Result<Value, ApiError>> {
    self
      .mutation_calls
      .lock()
      .push((name.to_string(), payload.clone()));

    let response = match self.mutation_responses.lock().pop_front() {
      Some(response) => response,
      None => {
        let n = self.created.fetch_add(1, Ordering::SeqCst) + 1;
        let mut record = payload.clone();
        if let Some(fields) = record.as_object_mut() {
          fields.insert("id".to_string(), json!(format!("srv-{}", n)));
        }
        if let Some(resource) = crate::api::mutation_resource(name) {
          self
            .collections
            .lock()
            .entry(resource.to_string())
            .or_default()
            .insert(0, record.clone());
        }
        Ok(record)
      }
    };

    let delay = *self.mutation_delay.lock();
    Box::pin(async move {
      tokio::time::sleep(delay).await;
      response
    })
  }

  fn probe(&self) -> BoxFuture<'static, Result<(), ApiError>> {
    self.probes.fetch_add(1, Ordering::SeqCst);
    let ok = self.probe_ok.load(Ordering::SeqCst);
    let delay = *self.probe_delay.lock();
    Box::pin(async move {
      tokio::time::sleep(delay).await;
      if ok {
        Ok(())
      } else {
        Err(ApiError::Network("connection refused".into()))
      }
    })
  }
}

/// Fixed configuration.
pub struct StaticConfig {
  api: Option<ApiConfig>,
}

impl StaticConfig {
  pub fn configured() -> Self {
    Self {
      api: Some(ApiConfig {
        backend_url: "https://sure.example.com".to_string(),
        api_token: "token".to_string(),
      }),
    }
  }

  pub fn unconfigured() -> Self {
    Self { api: None }
  }
}

impl ConfigSource for StaticConfig {
  fn api_config(&self) -> Option<ApiConfig> {
    self.api.clone()
  }

  fn is_configured(&self) -> bool {
    self
      .api
      .as_ref()
      .map_or(false, |api| !api.backend_url.is_empty())
  }
}

pub fn client_error(status: u16, message: &str) -> ApiError {
  ApiError::from_status(
    status,
    ApiErrorBody {
      error: "unprocessable_entity".to_string(),
      message: Some(message.to_string()),
      details: None,
    },
  )
}

pub fn server_error(status: u16) -> ApiError {
  ApiError::from_status(
    status,
    ApiErrorBody {
      error: "service_unavailable".to_string(),
      message: None,
      details: None,
    },
  )
}

/// Poll `condition` for up to a second.
pub async fn eventually<F>(condition: F) -> bool
where
  F: Fn() -> bool,
{
  for _ in 0..100 {
    if condition() {
      return true;
    }
    tokio::time::sleep(Duration::from_millis(10)).await;
  }
  condition()
}
